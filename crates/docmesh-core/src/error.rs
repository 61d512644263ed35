//! Error types for docmesh

use thiserror::Error;

use crate::types::DocumentId;

/// Main error type for docmesh operations
#[derive(Error, Debug)]
pub enum RepoError {
    /// A cursor operation was given an empty or malformed peer id
    #[error("Invalid peer id: {0:?}")]
    InvalidPeerId(String),

    /// The document handle has been deleted
    #[error("Document deleted: {0}")]
    DocumentDeleted(DocumentId),

    /// Neither storage nor any connected peer could supply the document
    #[error("Document unavailable: {0}")]
    DocumentUnavailable(DocumentId),

    /// A received message failed protocol validation
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// An incoming sync step could not be decoded
    #[error("Malformed sync message: {0}")]
    MalformedSyncMessage(String),

    /// Automerge document error
    #[error("Automerge error: {0}")]
    Automerge(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error during storage operations
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<automerge::AutomergeError> for RepoError {
    fn from(err: automerge::AutomergeError) -> Self {
        RepoError::Automerge(err.to_string())
    }
}

impl From<postcard::Error> for RepoError {
    fn from(err: postcard::Error) -> Self {
        RepoError::Serialization(err.to_string())
    }
}

/// Result type alias using RepoError
pub type RepoResult<T> = Result<T, RepoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RepoError::InvalidPeerId(String::new());
        assert_eq!(format!("{}", err), "Invalid peer id: \"\"");

        let err = RepoError::DocumentDeleted(DocumentId::from("doc-1"));
        assert_eq!(format!("{}", err), "Document deleted: doc-1");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let repo_err: RepoError = io_err.into();
        assert!(matches!(repo_err, RepoError::Io(_)));
    }
}
