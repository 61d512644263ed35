//! Storage integration tests
//!
//! Repos backed by a redb file: documents survive restarts, documents
//! received over the network are persisted, and deletion removes the
//! stored snapshot.

use std::sync::Arc;
use std::time::Duration;

use automerge::transaction::Transactable;
use automerge::ROOT;
use docmesh_core::{
    DocumentId, HandleState, MemoryNetworkAdapter, PeerId, RedbStorageAdapter, Repo, RepoConfig,
    StorageAdapter,
};
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

fn open_storage(dir: &TempDir) -> Arc<RedbStorageAdapter> {
    Arc::new(RedbStorageAdapter::open(dir.path().join("docmesh.redb")).unwrap())
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let result = timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {}", what);
}

// ============================================================================
// Persistence
// ============================================================================

/// Changes are autosaved and a restarted repo loads them without peers
#[tokio::test]
async fn test_document_survives_restart() {
    let dir = TempDir::new().unwrap();
    let storage = open_storage(&dir);

    let id = {
        let repo = Repo::new(RepoConfig::with_peer_id("alice"), Some(storage.clone()));
        let handle = repo.create();
        handle.change(|tx| tx.put(ROOT, "title", "notes")).unwrap();
        let id = handle.document_id().clone();
        wait_until("autosave", || storage.load(&id).unwrap().is_some()).await;
        id
    };

    let repo = Repo::new(RepoConfig::with_peer_id("alice"), Some(storage));
    let handle = repo.find(&id);
    let value = timeout(WAIT, handle.to_json()).await.unwrap().unwrap();
    assert_eq!(value, serde_json::json!({"title": "notes"}));
    assert!(!handle.is_new());
}

/// A later change overwrites the stored snapshot
#[tokio::test]
async fn test_latest_snapshot_wins() {
    let dir = TempDir::new().unwrap();
    let storage = open_storage(&dir);
    let repo = Repo::new(RepoConfig::with_peer_id("alice"), Some(storage.clone()));

    let handle = repo.create();
    handle.change(|tx| tx.put(ROOT, "count", 1_i64)).unwrap();
    handle.change(|tx| tx.put(ROOT, "count", 2_i64)).unwrap();
    repo.flush().unwrap();

    let bytes = storage.load(handle.document_id()).unwrap().unwrap();
    let doc = automerge::Automerge::load(&bytes).unwrap();
    assert_eq!(
        docmesh_core::to_json(&doc).unwrap(),
        serde_json::json!({"count": 2})
    );
}

/// Listing reports every stored document
#[tokio::test]
async fn test_stored_document_ids() {
    let dir = TempDir::new().unwrap();
    let storage = open_storage(&dir);
    let repo = Repo::new(RepoConfig::with_peer_id("alice"), Some(storage));

    let mut ids = Vec::new();
    for n in 0..3_i64 {
        let handle = repo.create();
        handle.change(|tx| tx.put(ROOT, "n", n)).unwrap();
        ids.push(handle.document_id().clone());
    }
    repo.flush().unwrap();

    let mut stored = repo.stored_document_ids().unwrap();
    stored.sort();
    ids.sort();
    assert_eq!(stored, ids);
}

/// Deleting a document removes its snapshot
#[tokio::test]
async fn test_delete_removes_snapshot() {
    let dir = TempDir::new().unwrap();
    let storage = open_storage(&dir);
    let repo = Repo::new(RepoConfig::with_peer_id("alice"), Some(storage.clone()));

    let handle = repo.create();
    handle.change(|tx| tx.put(ROOT, "doomed", true)).unwrap();
    repo.flush().unwrap();
    let id = handle.document_id().clone();
    assert!(storage.load(&id).unwrap().is_some());

    repo.delete(&id);
    wait_until("snapshot removal", || storage.load(&id).unwrap().is_none()).await;
}

/// A document that is neither stored nor reachable ends up requesting
#[tokio::test]
async fn test_storage_miss_requests_from_network() {
    let dir = TempDir::new().unwrap();
    let repo = Repo::new(RepoConfig::with_peer_id("alice"), Some(open_storage(&dir)));

    let handle = repo.find(&DocumentId::from("not-here"));
    wait_until("storage miss", || handle.state() == HandleState::Requesting).await;
}

// ============================================================================
// Network + Storage
// ============================================================================

/// A document fetched from a peer is available offline afterwards
#[tokio::test]
async fn test_fetched_document_is_persisted() {
    let dir = TempDir::new().unwrap();
    let bob_storage = open_storage(&dir);

    let alice = Repo::new(RepoConfig::with_peer_id("alice"), None);
    let original = alice.create();
    original
        .change(|tx| tx.put(ROOT, "shared", "yes"))
        .unwrap();
    let id = original.document_id().clone();

    {
        let bob = Repo::new(RepoConfig::with_peer_id("bob"), Some(bob_storage.clone()));
        let (a, b) = MemoryNetworkAdapter::connected_pair(Duration::from_millis(5));
        alice.add_network_adapter(a.clone());
        bob.add_network_adapter(b.clone());
        a.peer_candidate(PeerId::from("bob"));
        b.peer_candidate(PeerId::from("alice"));

        let found = bob.find(&id);
        timeout(WAIT, found.value()).await.unwrap().unwrap();
        wait_until("bob to persist the document", || {
            bob_storage.load(&id).unwrap().is_some()
        })
        .await;
    }

    let offline_bob = Repo::new(RepoConfig::with_peer_id("bob"), Some(bob_storage));
    let value = timeout(WAIT, offline_bob.find(&id).to_json())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, serde_json::json!({"shared": "yes"}));
}
