//! Ephemeral message deduplication
//!
//! Ephemeral gossip is relayed freely, so the same message can arrive more
//! than once and out of order. Each sender stamps its messages with a
//! session id and a strictly increasing count; a receiver keeps the highest
//! count seen per (sender, session) and drops anything not newer.

use std::collections::HashMap;

use crate::types::{DocumentId, PeerId, SessionId};

/// An ephemeral message delivered to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralMessage {
    pub sender_id: PeerId,
    pub document_id: DocumentId,
    pub session_id: SessionId,
    pub count: u64,
    pub data: Vec<u8>,
}

/// Highest-count-wins filter for ephemeral messages
#[derive(Debug, Default)]
pub struct EphemeralDeduplicator {
    highest: HashMap<(PeerId, SessionId), u64>,
}

impl EphemeralDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message and report whether it should be delivered
    ///
    /// Returns `false` for a count at or below the highest already seen from
    /// the same sender in the same session.
    pub fn observe(&mut self, sender_id: &PeerId, session_id: &SessionId, count: u64) -> bool {
        let key = (sender_id.clone(), session_id.clone());
        match self.highest.get(&key) {
            Some(&seen) if count <= seen => false,
            _ => {
                self.highest.insert(key, count);
                true
            }
        }
    }

    /// Forget every session of a peer
    pub fn forget_peer(&mut self, peer_id: &PeerId) {
        self.highest.retain(|(sender, _), _| sender != peer_id);
    }

    /// Number of (sender, session) pairs tracked
    pub fn len(&self) -> usize {
        self.highest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.highest.is_empty()
    }
}
