//! Transport contract
//!
//! A [`NetworkAdapter`] moves [`Message`]s between peers and reports peer
//! lifecycle. The repo assumes nothing about the transport beyond this
//! trait: delivery is best effort and the sync protocol tolerates loss.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::protocol::Message;
use crate::types::PeerId;

/// What a peer told us about itself when it appeared
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMetadata {
    /// Identifier of the peer's storage, if it has one
    pub storage_id: Option<String>,
    /// Ephemeral peers never persist documents
    pub is_ephemeral: bool,
}

/// Events emitted by a network adapter
#[derive(Debug, Clone)]
pub enum NetworkAdapterEvent {
    /// The adapter finished connecting and can carry messages
    Ready,
    /// A peer became reachable through this adapter
    PeerCandidate {
        peer_id: PeerId,
        metadata: PeerMetadata,
    },
    /// A peer is no longer reachable through this adapter
    PeerDisconnected { peer_id: PeerId },
    /// A message arrived
    Message(Message),
    /// The adapter shut down; no further events follow
    Close,
}

/// A transport that carries messages between peers
///
/// Implementations must be cheap to call from async contexts: `send` should
/// enqueue and return, never block on the network.
pub trait NetworkAdapter: Send + Sync {
    /// Start participating as `peer_id`
    fn connect(&self, peer_id: PeerId);

    /// Deliver a message to its `target_id`, best effort
    fn send(&self, message: Message);

    /// Stop participating
    fn disconnect(&self);

    /// Subscribe to adapter events
    ///
    /// Every event emitted after subscribing is delivered in order, none are
    /// dropped. Callers must subscribe before calling
    /// [`connect`](Self::connect).
    fn subscribe(&self) -> mpsc::UnboundedReceiver<NetworkAdapterEvent>;

    /// Short name for logs
    fn name(&self) -> &str {
        "adapter"
    }
}
