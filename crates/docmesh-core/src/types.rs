//! Core identifier types for docmesh

use std::fmt;
use std::sync::Arc;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Globally unique, opaque identifier of a document
///
/// Stable for the lifetime of the document and used as a map key by the
/// collection, the synchronizers and storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    /// Create a new random DocumentId (16 random bytes, base58 encoded)
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        Self(bs58::encode(&bytes).into_string())
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identifier of a remote participant
///
/// Unique per connection, but may be reused when a peer reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Create a PeerId from any string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Create a random PeerId, used when no explicit id is configured
    pub fn random() -> Self {
        Self(format!("peer-{}", Ulid::new().to_string().to_lowercase()))
    }

    /// Whether the id is empty (never valid for cursor operations)
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Random value generated once per process lifetime
///
/// Paired with a strictly increasing counter on every ephemeral message, so
/// receivers can order gossip per (sender, session) and drop duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Create a new session id (ULID string)
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Injectable generator of fresh document ids
///
/// Must produce collision-free, opaque identifiers.
pub type IdGenerator = Arc<dyn Fn() -> DocumentId + Send + Sync>;

/// The default id generator, backed by [`DocumentId::random`]
pub fn default_id_generator() -> IdGenerator {
    Arc::new(DocumentId::random)
}
