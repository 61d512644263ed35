//! In-memory storage adapter

use std::collections::HashMap;

use parking_lot::RwLock;

use super::StorageAdapter;
use crate::error::RepoResult;
use crate::types::DocumentId;

/// Snapshots kept in a map; lost when the process exits
#[derive(Debug, Default)]
pub struct MemoryStorageAdapter {
    documents: RwLock<HashMap<DocumentId, Vec<u8>>>,
}

impl MemoryStorageAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }
}

impl StorageAdapter for MemoryStorageAdapter {
    fn load(&self, document_id: &DocumentId) -> RepoResult<Option<Vec<u8>>> {
        Ok(self.documents.read().get(document_id).cloned())
    }

    fn save(&self, document_id: &DocumentId, data: &[u8]) -> RepoResult<()> {
        self.documents
            .write()
            .insert(document_id.clone(), data.to_vec());
        Ok(())
    }

    fn remove(&self, document_id: &DocumentId) -> RepoResult<()> {
        self.documents.write().remove(document_id);
        Ok(())
    }

    fn document_ids(&self) -> RepoResult<Vec<DocumentId>> {
        let mut ids: Vec<DocumentId> = self.documents.read().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
