//! Document persistence
//!
//! A [`StorageAdapter`] is a plain key/value store of document snapshots.
//! [`StorageSubsystem`] connects it to handles: it resolves a found handle
//! from disk, or hands it to the network when there is nothing stored, and
//! writes a fresh snapshot whenever the document changes.
//!
//! ```text
//!  find(id) ──► Loading ──load_into──┬── hit ──► handle.load(bytes) ──► Ready
//!                                    └── miss ─► handle.request() ───► Requesting
//!
//!  HandleEvent::Changed ──► save snapshot
//!  HandleEvent::Deleted ──► remove snapshot
//! ```

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::document::CrdtDocument;
use crate::error::RepoResult;
use crate::handle::{DocHandle, HandleEvent, HandleState};
use crate::types::DocumentId;

mod database;
mod memory;

pub use database::RedbStorageAdapter;
pub use memory::MemoryStorageAdapter;

/// Key/value store of document snapshots
pub trait StorageAdapter: Send + Sync {
    /// Load the stored snapshot of a document, if any
    fn load(&self, document_id: &DocumentId) -> RepoResult<Option<Vec<u8>>>;

    /// Store a snapshot, replacing any previous one
    fn save(&self, document_id: &DocumentId, data: &[u8]) -> RepoResult<()>;

    /// Remove a document's snapshot; removing a missing one is not an error
    fn remove(&self, document_id: &DocumentId) -> RepoResult<()>;

    /// Ids of every stored document
    fn document_ids(&self) -> RepoResult<Vec<DocumentId>>;
}

/// Connects a [`StorageAdapter`] to document handles
#[derive(Clone)]
pub struct StorageSubsystem {
    adapter: Arc<dyn StorageAdapter>,
}

impl StorageSubsystem {
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self { adapter }
    }

    pub fn adapter(&self) -> &Arc<dyn StorageAdapter> {
        &self.adapter
    }

    /// Resolve a loading handle from storage
    ///
    /// Returns `true` if a snapshot was found. On a miss the handle moves on
    /// to requesting the document from peers. Handles that are not loading
    /// are left alone.
    pub fn load_into<D: CrdtDocument>(&self, handle: &DocHandle<D>) -> RepoResult<bool> {
        if handle.state() != HandleState::Loading {
            return Ok(false);
        }
        let document_id = handle.document_id();
        match self.adapter.load(document_id) {
            Ok(Some(bytes)) => match handle.load(&bytes) {
                Ok(()) if handle.is_ready() => {
                    debug!(%document_id, bytes = bytes.len(), "Loaded document from storage");
                    Ok(true)
                }
                Ok(()) => {
                    debug!(%document_id, "Stored snapshot was empty, requesting from peers");
                    handle.request();
                    Ok(false)
                }
                Err(e) => {
                    warn!(
                        %document_id,
                        error = %e,
                        "Stored snapshot is unreadable, requesting from peers"
                    );
                    handle.request();
                    Err(e)
                }
            },
            Ok(None) => {
                debug!(%document_id, "Document not in storage, requesting from peers");
                handle.request();
                Ok(false)
            }
            Err(e) => {
                warn!(%document_id, error = %e, "Storage load failed, requesting from peers");
                handle.request();
                Err(e)
            }
        }
    }

    /// Write the handle's current snapshot
    ///
    /// Empty and deleted documents are not written.
    pub fn save<D: CrdtDocument>(&self, handle: &DocHandle<D>) -> RepoResult<()> {
        if handle.is_deleted() {
            return Ok(());
        }
        let bytes = handle.with_doc(|doc| (!doc.is_empty()).then(|| doc.save_bytes()));
        if let Some(bytes) = bytes {
            self.adapter.save(handle.document_id(), &bytes)?;
            debug!(document_id = %handle.document_id(), bytes = bytes.len(), "Saved document");
        }
        Ok(())
    }

    pub fn remove(&self, document_id: &DocumentId) -> RepoResult<()> {
        self.adapter.remove(document_id)?;
        debug!(%document_id, "Removed document from storage");
        Ok(())
    }

    /// Keep storage in step with a handle until it is deleted
    ///
    /// Saves once on attach if the handle is already ready, then after every
    /// change, and removes the snapshot on deletion. Events are handled in
    /// order, so a save can never follow the removal.
    pub fn attach<D: CrdtDocument>(&self, handle: DocHandle<D>) -> JoinHandle<()> {
        let mut events = handle.subscribe();
        let storage = self.clone();
        tokio::spawn(async move {
            // Changes made before the subscription fired no event
            if handle.is_ready() {
                if let Err(e) = storage.save(&handle) {
                    warn!(document_id = %handle.document_id(), error = %e, "Initial save failed");
                }
            }
            loop {
                match events.recv().await {
                    Ok(HandleEvent::Changed) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Err(e) = storage.save(&handle) {
                            warn!(
                                document_id = %handle.document_id(),
                                error = %e,
                                "Autosave failed"
                            );
                        }
                    }
                    Ok(HandleEvent::Deleted) => {
                        if let Err(e) = storage.remove(handle.document_id()) {
                            warn!(
                                document_id = %handle.document_id(),
                                error = %e,
                                "Failed to remove deleted document"
                            );
                        }
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use automerge::transaction::Transactable;
    use automerge::{Automerge, ROOT};

    fn subsystem() -> (StorageSubsystem, Arc<MemoryStorageAdapter>) {
        let adapter = Arc::new(MemoryStorageAdapter::new());
        (StorageSubsystem::new(adapter.clone()), adapter)
    }

    #[test]
    fn test_load_miss_moves_to_requesting() {
        let (storage, _) = subsystem();
        let handle: DocHandle<Automerge> = DocHandle::new(DocumentId::from("doc-1"), false);

        assert!(!storage.load_into(&handle).unwrap());
        assert_eq!(handle.state(), HandleState::Requesting);
    }

    #[test]
    fn test_save_then_load_hit() {
        let (storage, adapter) = subsystem();
        let source: DocHandle<Automerge> = DocHandle::new(DocumentId::from("doc-1"), true);
        source.change(|tx| tx.put(ROOT, "count", 1_i64)).unwrap();
        storage.save(&source).unwrap();
        assert_eq!(adapter.len(), 1);

        let found: DocHandle<Automerge> = DocHandle::new(DocumentId::from("doc-1"), false);
        assert!(storage.load_into(&found).unwrap());
        assert!(found.is_ready());
        assert_eq!(found.heads(), source.heads());
    }

    #[test]
    fn test_empty_document_is_not_saved() {
        let (storage, adapter) = subsystem();
        let handle: DocHandle<Automerge> = DocHandle::new(DocumentId::from("doc-1"), true);
        storage.save(&handle).unwrap();
        assert!(adapter.is_empty());
    }

    #[test]
    fn test_corrupt_snapshot_falls_back_to_network() {
        let (storage, adapter) = subsystem();
        let id = DocumentId::from("doc-1");
        adapter.save(&id, b"not an automerge document").unwrap();

        let handle: DocHandle<Automerge> = DocHandle::new(id, false);
        assert!(!storage.load_into(&handle).unwrap_or(false));
        assert_eq!(handle.state(), HandleState::Requesting);
    }

    #[tokio::test]
    async fn test_attach_autosaves_and_removes() {
        let (storage, adapter) = subsystem();
        let handle: DocHandle<Automerge> = DocHandle::new(DocumentId::from("doc-1"), true);
        let task = storage.attach(handle.clone());

        handle.change(|tx| tx.put(ROOT, "title", "notes")).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while adapter.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("document was not autosaved");

        handle.delete();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("autosave task did not stop")
            .unwrap();
        assert!(adapter.is_empty());
    }

    #[tokio::test]
    async fn test_attach_saves_changes_made_before_it() {
        let (storage, adapter) = subsystem();
        let handle: DocHandle<Automerge> = DocHandle::new(DocumentId::from("doc-1"), true);
        handle.change(|tx| tx.put(ROOT, "title", "early")).unwrap();

        let _task = storage.attach(handle.clone());

        tokio::time::timeout(Duration::from_secs(2), async {
            while adapter.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("earlier change was not saved");
    }
}
