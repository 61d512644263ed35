//! CRDT document contract and its Automerge implementation
//!
//! The replication layer never computes diffs itself. It only needs a
//! document value that can produce the next sync step for a peer cursor and
//! apply an incoming step, plus enough bookkeeping (heads, save/load) for
//! change detection and storage. [`CrdtDocument`] is exactly that surface,
//! so the engine can be swapped or mocked without touching the synchronizer.

use automerge::sync::{self, SyncDoc};
use automerge::transaction::{Transactable, Transaction};
use automerge::{AutoSerde, Automerge, AutomergeError, ChangeHash, ReadDoc, ScalarValue, ROOT};

use crate::error::{RepoError, RepoResult};
use crate::handle::DocHandle;

/// A mergeable document driven by a resumable two-sided sync protocol
pub trait CrdtDocument: Clone + Send + Sync + 'static {
    /// Opaque per-peer sync state
    type Cursor: Clone + Send + Sync + 'static;
    /// Summary of the document version, compared to detect changes
    type Heads: Clone + PartialEq + Send + Sync + std::fmt::Debug;

    /// An empty document
    fn new_document() -> Self;

    /// The initial cursor for a peer we have never talked to
    fn new_cursor() -> Self::Cursor;

    /// Prepare a stored cursor for a peer that reconnected
    ///
    /// Keeps what the peer is known to have, drops in-flight bookkeeping of
    /// the previous connection.
    fn resume_cursor(cursor: &Self::Cursor) -> Self::Cursor;

    /// Produce the next step for the peer, or `None` if it is believed to be
    /// up to date
    fn generate_sync_step(&self, cursor: &mut Self::Cursor) -> Option<Vec<u8>>;

    /// Merge an incoming step, advancing the cursor
    fn receive_sync_step(&mut self, cursor: &mut Self::Cursor, step: &[u8]) -> RepoResult<()>;

    fn heads(&self) -> Self::Heads;

    /// Whether this document already holds everything the peer behind
    /// `cursor` has told us about
    ///
    /// False until the peer has sent at least one step.
    fn in_sync_with(&self, cursor: &Self::Cursor) -> bool;

    /// Whether the document holds no changes at all
    fn is_empty(&self) -> bool;

    /// Full snapshot for storage
    fn save_bytes(&self) -> Vec<u8>;

    /// Merge a stored snapshot into this document
    fn merge_saved(&mut self, bytes: &[u8]) -> RepoResult<()>;
}

impl CrdtDocument for Automerge {
    type Cursor = sync::State;
    type Heads = Vec<ChangeHash>;

    fn new_document() -> Self {
        Automerge::new()
    }

    fn new_cursor() -> Self::Cursor {
        sync::State::new()
    }

    fn resume_cursor(cursor: &Self::Cursor) -> Self::Cursor {
        // The encoded form only retains the shared heads
        sync::State::decode(&cursor.encode()).unwrap_or_else(|_| sync::State::new())
    }

    fn generate_sync_step(&self, cursor: &mut Self::Cursor) -> Option<Vec<u8>> {
        SyncDoc::generate_sync_message(self, cursor).map(|msg| msg.encode())
    }

    fn receive_sync_step(&mut self, cursor: &mut Self::Cursor, step: &[u8]) -> RepoResult<()> {
        let msg = sync::Message::decode(step)
            .map_err(|e| RepoError::MalformedSyncMessage(e.to_string()))?;
        SyncDoc::receive_sync_message(self, cursor, msg)?;
        Ok(())
    }

    fn heads(&self) -> Self::Heads {
        self.get_heads()
    }

    fn in_sync_with(&self, cursor: &Self::Cursor) -> bool {
        cursor.their_heads.as_ref().is_some_and(|theirs| {
            theirs
                .iter()
                .all(|hash| self.get_change_by_hash(hash).is_some())
        })
    }

    fn is_empty(&self) -> bool {
        self.get_heads().is_empty()
    }

    fn save_bytes(&self) -> Vec<u8> {
        self.save()
    }

    fn merge_saved(&mut self, bytes: &[u8]) -> RepoResult<()> {
        self.load_incremental(bytes)?;
        Ok(())
    }
}

impl DocHandle<Automerge> {
    /// Run an Automerge transaction against the handle's document
    ///
    /// Goes through [`DocHandle::update_doc`], so it is atomic and fires the
    /// change notification when something was written.
    pub fn change<F, O>(&self, f: F) -> RepoResult<O>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<O, AutomergeError>,
    {
        self.update_doc(|doc| {
            doc.transact(f)
                .map(|success| success.result)
                .map_err(|failure| RepoError::from(failure.error))
        })
    }

    /// Render the current value as JSON, waiting until it is ready
    pub async fn to_json(&self) -> RepoResult<serde_json::Value> {
        let doc = self.value().await?;
        to_json(&doc)
    }
}

/// Render an Automerge document as a JSON value
pub fn to_json(doc: &Automerge) -> RepoResult<serde_json::Value> {
    serde_json::to_value(AutoSerde::from(doc)).map_err(|e| RepoError::Serialization(e.to_string()))
}

/// Write a JSON scalar into a root field of the document
///
/// Objects and arrays are stored as their JSON text.
pub fn put_root_value(
    tx: &mut Transaction<'_>,
    key: &str,
    value: &serde_json::Value,
) -> Result<(), AutomergeError> {
    let scalar = match value {
        serde_json::Value::Null => ScalarValue::Null,
        serde_json::Value::Bool(b) => ScalarValue::from(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => ScalarValue::from(i),
            None => ScalarValue::from(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => ScalarValue::from(s.as_str()),
        other => ScalarValue::from(other.to_string()),
    };
    tx.put(ROOT, key, scalar)
}
