//! Replication message protocol
//!
//! Messages are serialized with postcard and handed to a network adapter.
//!
//! ## Message Flow
//!
//! ```text
//! Peer A (has doc)                Peer B (wants doc)
//!   |                               |
//!   |<-- Request {data} ------------|   first step, B has nothing yet
//!   |--- Sync {data} -------------->|
//!   |<-- Sync {data} ---------------|
//!   |         ... until neither side has a non-empty step ...
//!   |                               |
//!   |--- Ephemeral {session, n} --->|   unpersisted gossip
//! ```
//!
//! A peer that cannot supply a requested document from storage or from any
//! of its own peers answers with `DocUnavailable`.

use serde::{Deserialize, Serialize};

use crate::error::RepoError;
use crate::types::{DocumentId, PeerId, SessionId};

/// Every message a network adapter may carry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// One step of the convergence handshake for a document
    Sync {
        sender_id: PeerId,
        target_id: PeerId,
        document_id: DocumentId,
        /// Opaque sync-step payload produced by the CRDT
        data: Vec<u8>,
    },

    /// First step sent when the sender wants a document it does not have
    ///
    /// Same shape as `Sync`; lets the recipient tell "asking" apart from
    /// "continuing an existing exchange".
    Request {
        sender_id: PeerId,
        target_id: PeerId,
        document_id: DocumentId,
        data: Vec<u8>,
    },

    /// The sender has exhausted every source and cannot supply the document
    DocUnavailable {
        sender_id: PeerId,
        target_id: PeerId,
        document_id: DocumentId,
    },

    /// Unpersisted gossip, ordered only within (sender, session)
    Ephemeral {
        sender_id: PeerId,
        target_id: PeerId,
        document_id: DocumentId,
        session_id: SessionId,
        /// Strictly increasing for each message the sender emits in a session
        count: u64,
        data: Vec<u8>,
    },

    /// Opaque payload for a pluggable authentication exchange
    Auth {
        sender_id: PeerId,
        target_id: PeerId,
        payload: Vec<u8>,
    },
}

/// Discriminant of a [`Message`], used for logging and dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Sync,
    Request,
    DocUnavailable,
    Ephemeral,
    Auth,
}

impl MessageKind {
    /// Wire name of the message type
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Sync => "sync",
            MessageKind::Request => "request",
            MessageKind::DocUnavailable => "doc-unavailable",
            MessageKind::Ephemeral => "ephemeral",
            MessageKind::Auth => "auth",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Message {
    /// Encode message to bytes using postcard
    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Decode message from bytes using postcard
    pub fn decode(data: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(data)
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Sync { .. } => MessageKind::Sync,
            Message::Request { .. } => MessageKind::Request,
            Message::DocUnavailable { .. } => MessageKind::DocUnavailable,
            Message::Ephemeral { .. } => MessageKind::Ephemeral,
            Message::Auth { .. } => MessageKind::Auth,
        }
    }

    pub fn sender_id(&self) -> &PeerId {
        match self {
            Message::Sync { sender_id, .. }
            | Message::Request { sender_id, .. }
            | Message::DocUnavailable { sender_id, .. }
            | Message::Ephemeral { sender_id, .. }
            | Message::Auth { sender_id, .. } => sender_id,
        }
    }

    pub fn target_id(&self) -> &PeerId {
        match self {
            Message::Sync { target_id, .. }
            | Message::Request { target_id, .. }
            | Message::DocUnavailable { target_id, .. }
            | Message::Ephemeral { target_id, .. }
            | Message::Auth { target_id, .. } => target_id,
        }
    }

    /// The document this message is about (`None` for auth messages)
    pub fn document_id(&self) -> Option<&DocumentId> {
        match self {
            Message::Sync { document_id, .. }
            | Message::Request { document_id, .. }
            | Message::DocUnavailable { document_id, .. }
            | Message::Ephemeral { document_id, .. } => Some(document_id),
            Message::Auth { .. } => None,
        }
    }

    /// Check if this message may be processed by the repo layer
    ///
    /// True for sync, ephemeral, request and doc-unavailable messages with
    /// a non-empty sender. Auth messages are routed elsewhere.
    pub fn is_valid_repo_message(&self) -> bool {
        !self.sender_id().is_empty() && self.kind() != MessageKind::Auth
    }

    pub fn is_sync(&self) -> bool {
        matches!(self, Message::Sync { .. })
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request { .. })
    }

    pub fn is_doc_unavailable(&self) -> bool {
        matches!(self, Message::DocUnavailable { .. })
    }

    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Message::Ephemeral { .. })
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Message::Auth { .. })
    }
}

/// A message that passed repo validation
///
/// Only these ever reach a document synchronizer or the ephemeral layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoMessage {
    document_id: DocumentId,
    message: Message,
}

impl RepoMessage {
    pub fn as_message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    pub fn sender_id(&self) -> &PeerId {
        self.message.sender_id()
    }

    /// Repo messages always carry a document id
    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }
}

impl TryFrom<Message> for RepoMessage {
    type Error = RepoError;

    fn try_from(message: Message) -> Result<Self, Self::Error> {
        if !message.is_valid_repo_message() {
            return Err(RepoError::InvalidMessage(format!(
                "{} message from '{}' is not a repo message",
                message.kind(),
                message.sender_id()
            )));
        }
        let document_id = message.document_id().cloned().ok_or_else(|| {
            RepoError::InvalidMessage(format!("{} message without document", message.kind()))
        })?;
        Ok(RepoMessage {
            document_id,
            message,
        })
    }
}

/// Outbound message contents before the sending layer stamps them
///
/// Omits `sender_id` everywhere, and `session_id`/`count` for ephemeral
/// messages: the network subsystem assigns those.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContents {
    Sync {
        target_id: PeerId,
        document_id: DocumentId,
        data: Vec<u8>,
    },
    Request {
        target_id: PeerId,
        document_id: DocumentId,
        data: Vec<u8>,
    },
    DocUnavailable {
        target_id: PeerId,
        document_id: DocumentId,
    },
    Ephemeral {
        target_id: PeerId,
        document_id: DocumentId,
        data: Vec<u8>,
    },
    Auth {
        target_id: PeerId,
        payload: Vec<u8>,
    },
}

impl MessageContents {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageContents::Sync { .. } => MessageKind::Sync,
            MessageContents::Request { .. } => MessageKind::Request,
            MessageContents::DocUnavailable { .. } => MessageKind::DocUnavailable,
            MessageContents::Ephemeral { .. } => MessageKind::Ephemeral,
            MessageContents::Auth { .. } => MessageKind::Auth,
        }
    }

    pub fn target_id(&self) -> &PeerId {
        match self {
            MessageContents::Sync { target_id, .. }
            | MessageContents::Request { target_id, .. }
            | MessageContents::DocUnavailable { target_id, .. }
            | MessageContents::Ephemeral { target_id, .. }
            | MessageContents::Auth { target_id, .. } => target_id,
        }
    }

    /// Attach the protocol fields and produce a full [`Message`]
    ///
    /// `session` is only consulted for ephemeral contents.
    pub fn into_message(self, sender_id: PeerId, session: (&SessionId, u64)) -> Message {
        match self {
            MessageContents::Sync {
                target_id,
                document_id,
                data,
            } => Message::Sync {
                sender_id,
                target_id,
                document_id,
                data,
            },
            MessageContents::Request {
                target_id,
                document_id,
                data,
            } => Message::Request {
                sender_id,
                target_id,
                document_id,
                data,
            },
            MessageContents::DocUnavailable {
                target_id,
                document_id,
            } => Message::DocUnavailable {
                sender_id,
                target_id,
                document_id,
            },
            MessageContents::Ephemeral {
                target_id,
                document_id,
                data,
            } => Message::Ephemeral {
                sender_id,
                target_id,
                document_id,
                session_id: session.0.clone(),
                count: session.1,
                data,
            },
            MessageContents::Auth { target_id, payload } => Message::Auth {
                sender_id,
                target_id,
                payload,
            },
        }
    }
}

/// Wrapper for versioned messages
///
/// New protocol versions are added as variants without breaking existing
/// peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    /// Protocol version 1
    V1(Message),
}

impl WireMessage {
    /// Create a new wire message wrapping a message
    pub fn new(msg: Message) -> Self {
        WireMessage::V1(msg)
    }

    /// Encode wire message to bytes using postcard
    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Decode wire message from bytes using postcard
    pub fn decode(data: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(data)
    }

    /// Unwrap the inner Message
    pub fn into_inner(self) -> Message {
        match self {
            WireMessage::V1(msg) => msg,
        }
    }

    /// Get a reference to the inner Message
    pub fn as_inner(&self) -> &Message {
        match self {
            WireMessage::V1(msg) => msg,
        }
    }

    /// Get the protocol version
    pub fn version(&self) -> u8 {
        match self {
            WireMessage::V1(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_message(sender: &str) -> Message {
        Message::Sync {
            sender_id: PeerId::from(sender),
            target_id: PeerId::from("bob"),
            document_id: DocumentId::from("doc-1"),
            data: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn test_sync_message_encode_decode() {
        let msg = sync_message("alice");
        let encoded = msg.encode().unwrap();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_wire_message_versioning() {
        let msg = Message::DocUnavailable {
            sender_id: PeerId::from("alice"),
            target_id: PeerId::from("bob"),
            document_id: DocumentId::from("doc-1"),
        };
        let wire = WireMessage::new(msg);
        assert_eq!(wire.version(), 1);

        let encoded = wire.encode().unwrap();
        let decoded = WireMessage::decode(&encoded).unwrap();

        assert_eq!(decoded.version(), 1);
        assert!(decoded.as_inner().is_doc_unavailable());
        match decoded.into_inner() {
            Message::DocUnavailable { document_id, .. } => {
                assert_eq!(document_id.as_str(), "doc-1")
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_ephemeral_keeps_session_and_count() {
        let msg = Message::Ephemeral {
            sender_id: PeerId::from("alice"),
            target_id: PeerId::from("bob"),
            document_id: DocumentId::from("doc-1"),
            session_id: SessionId::from("session-1"),
            count: 42,
            data: b"cursor at 12".to_vec(),
        };
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            Message::Ephemeral {
                session_id, count, ..
            } => {
                assert_eq!(session_id.as_str(), "session-1");
                assert_eq!(count, 42);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        assert!(WireMessage::decode(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_valid_repo_messages() {
        assert!(sync_message("alice").is_valid_repo_message());
        assert!(!sync_message("").is_valid_repo_message());

        let auth = Message::Auth {
            sender_id: PeerId::from("alice"),
            target_id: PeerId::from("bob"),
            payload: vec![],
        };
        assert!(!auth.is_valid_repo_message());
        assert!(auth.document_id().is_none());
    }

    #[test]
    fn test_repo_message_try_from() {
        let repo = RepoMessage::try_from(sync_message("alice")).unwrap();
        assert_eq!(repo.kind(), MessageKind::Sync);
        assert_eq!(repo.document_id().as_str(), "doc-1");
        assert_eq!(repo.sender_id().as_str(), "alice");

        let err = RepoMessage::try_from(sync_message("")).unwrap_err();
        assert!(matches!(err, RepoError::InvalidMessage(_)));

        let auth = Message::Auth {
            sender_id: PeerId::from("alice"),
            target_id: PeerId::from("bob"),
            payload: vec![9],
        };
        assert!(RepoMessage::try_from(auth).is_err());
    }

    #[test]
    fn test_message_type_checks() {
        let sync = sync_message("alice");
        assert!(sync.is_sync());
        assert!(!sync.is_request());
        assert!(!sync.is_ephemeral());

        let request = Message::Request {
            sender_id: PeerId::from("alice"),
            target_id: PeerId::from("bob"),
            document_id: DocumentId::from("doc-1"),
            data: vec![],
        };
        assert!(request.is_request());
        assert_eq!(request.kind().as_str(), "request");
    }

    #[test]
    fn test_contents_into_message() {
        let session = SessionId::from("s");
        let contents = MessageContents::Ephemeral {
            target_id: PeerId::from("bob"),
            document_id: DocumentId::from("doc-1"),
            data: vec![7],
        };
        assert_eq!(contents.kind(), MessageKind::Ephemeral);

        let msg = contents.into_message(PeerId::from("alice"), (&session, 3));
        assert_eq!(msg.sender_id().as_str(), "alice");
        assert_eq!(msg.target_id().as_str(), "bob");
        match msg {
            Message::Ephemeral {
                session_id, count, ..
            } => {
                assert_eq!(session_id, session);
                assert_eq!(count, 3);
            }
            _ => panic!("Wrong message type"),
        }

        let sync = MessageContents::Sync {
            target_id: PeerId::from("bob"),
            document_id: DocumentId::from("doc-1"),
            data: vec![1],
        }
        .into_message(PeerId::from("alice"), (&session, 0));
        assert!(sync.is_sync());
    }
}
