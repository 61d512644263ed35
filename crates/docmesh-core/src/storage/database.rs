//! Persistent storage adapter using redb
//!
//! One table, keyed by document id, holding the latest full snapshot.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};

use super::StorageAdapter;
use crate::error::RepoResult;
use crate::types::DocumentId;

const DOCUMENTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("documents");

/// Storage adapter backed by a redb database file
#[derive(Clone)]
pub struct RedbStorageAdapter {
    db: Arc<RwLock<Database>>,
}

impl RedbStorageAdapter {
    /// Open or create the database at `path`
    ///
    /// Creates missing parent directories.
    pub fn open(path: impl AsRef<Path>) -> RepoResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(DOCUMENTS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }
}

impl StorageAdapter for RedbStorageAdapter {
    fn load(&self, document_id: &DocumentId) -> RepoResult<Option<Vec<u8>>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(DOCUMENTS_TABLE)?;

        Ok(table.get(document_id.as_str())?.map(|v| v.value().to_vec()))
    }

    fn save(&self, document_id: &DocumentId, data: &[u8]) -> RepoResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(DOCUMENTS_TABLE)?;
            table.insert(document_id.as_str(), data)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn remove(&self, document_id: &DocumentId) -> RepoResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(DOCUMENTS_TABLE)?;
            table.remove(document_id.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn document_ids(&self) -> RepoResult<Vec<DocumentId>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(DOCUMENTS_TABLE)?;

        let mut ids = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            ids.push(DocumentId::from(key.value()));
        }
        Ok(ids)
    }
}
