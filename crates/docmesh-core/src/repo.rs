//! Repo - the primary entry point for docmesh
//!
//! A [`Repo`] ties the pieces together:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ Repo                                                             │
//! │                                                                  │
//! │  DocCollection ──CollectionEvent──┐                              │
//! │                                   ▼                              │
//! │  NetworkSubsystem ─NetworkEvent─► event loop ──► DocSynchronizer │
//! │        ▲                          │   │           (one actor per │
//! │        │                          │   │            document)     │
//! │        │                          │   └────────► StorageSubsystem│
//! │        │                          ▼                              │
//! │        └──── outbound forwarder ◄── MessageContents              │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The event loop reads both sources through unbounded listeners, so every
//! created or found document gets its synchronizer and every inbound message
//! is routed, however large the burst.
//!
//! A document that only a remote peer asked about is cached while it is being
//! resolved. If it turns out to be unavailable here it is evicted again.
//!
//! # Example
//!
//! ```ignore
//! use docmesh_core::{MemoryNetworkAdapter, Repo, RepoConfig};
//!
//! let repo = Repo::new(RepoConfig::default(), None);
//! let handle = repo.create();
//! handle.change(|tx| tx.put(automerge::ROOT, "count", 1_i64))?;
//!
//! let (ours, theirs) = MemoryNetworkAdapter::connected_pair(Duration::from_millis(10));
//! repo.add_network_adapter(ours);
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};

use automerge::Automerge;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::collection::{CollectionEvent, DocCollection};
use crate::document::CrdtDocument;
use crate::error::{RepoError, RepoResult};
use crate::handle::{DocHandle, HandleState};
use crate::network::{EphemeralMessage, NetworkAdapter, NetworkEvent, NetworkSubsystem};
use crate::protocol::{Message, MessageContents, RepoMessage};
use crate::storage::{StorageAdapter, StorageSubsystem};
use crate::synchronizer::{DocSynchronizer, SynchronizerCommand};
use crate::types::{default_id_generator, DocumentId, IdGenerator, PeerId};

/// Default capacity for repo event channels
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Decides whether a document is offered to a peer
///
/// Consulted when a peer connects and when a document first becomes known.
/// Messages a peer sends about a document are always processed.
pub type SharePolicy = Arc<dyn Fn(&PeerId, &DocumentId) -> bool + Send + Sync>;

/// Configuration for a [`Repo`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// Our identity on the network
    pub peer_id: PeerId,
    /// Capacity of the event channels offered to outside subscribers
    pub event_capacity: usize,
    /// Offer every document to every peer without being asked
    pub share_by_default: bool,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            peer_id: PeerId::random(),
            event_capacity: EVENT_CHANNEL_CAPACITY,
            share_by_default: true,
        }
    }
}

impl RepoConfig {
    /// Config with an explicit peer id and defaults otherwise
    pub fn with_peer_id(peer_id: impl Into<PeerId>) -> Self {
        Self {
            peer_id: peer_id.into(),
            ..Self::default()
        }
    }

    /// Load a JSON config file
    pub fn load(path: impl AsRef<Path>) -> RepoResult<Self> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data).map_err(|e| RepoError::Serialization(e.to_string()))
    }

    /// Write the config as pretty JSON, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> RepoResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data =
            serde_json::to_vec_pretty(self).map_err(|e| RepoError::Serialization(e.to_string()))?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Load the config at `path`, or create and save a default one
    pub fn load_or_create(path: impl AsRef<Path>) -> RepoResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        let config = Self::default();
        config.save(path)?;
        Ok(config)
    }
}

/// Builder for a [`Repo`] with injected collaborators
pub struct RepoBuilder<D: CrdtDocument> {
    config: RepoConfig,
    storage: Option<Arc<dyn StorageAdapter>>,
    share_policy: Option<SharePolicy>,
    id_generator: IdGenerator,
    _doc: std::marker::PhantomData<fn() -> D>,
}

impl<D: CrdtDocument> RepoBuilder<D> {
    pub fn new(config: RepoConfig) -> Self {
        Self {
            config,
            storage: None,
            share_policy: None,
            id_generator: default_id_generator(),
            _doc: std::marker::PhantomData,
        }
    }

    pub fn storage(mut self, storage: Arc<dyn StorageAdapter>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn share_policy(mut self, policy: SharePolicy) -> Self {
        self.share_policy = Some(policy);
        self
    }

    pub fn id_generator(mut self, id_generator: IdGenerator) -> Self {
        self.id_generator = id_generator;
        self
    }

    /// Build the repo and start its background tasks
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Repo<D> {
        let share = self.config.share_by_default;
        let share_policy = self.share_policy.unwrap_or_else(|| {
            let policy: SharePolicy = Arc::new(move |_: &PeerId, _: &DocumentId| share);
            policy
        });
        let capacity = self.config.event_capacity;

        let collection = DocCollection::with_capacity(self.id_generator, capacity);
        let network = NetworkSubsystem::with_capacity(self.config.peer_id.clone(), capacity);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<MessageContents>();
        let (ephemeral_tx, _) = broadcast::channel(capacity.max(1));

        // Listen before anything can emit
        let mut collection_rx = collection.listen();
        let mut network_rx = network.listen();

        let inner = Arc::new(RepoInner {
            peer_id: self.config.peer_id.clone(),
            collection,
            network: network.clone(),
            storage: self.storage.map(StorageSubsystem::new),
            synchronizers: Mutex::new(HashMap::new()),
            remote_only: Mutex::new(HashMap::new()),
            share_policy,
            ephemeral_tx,
            outbound_tx,
        });

        let forwarder = tokio::spawn(async move {
            while let Some(contents) = outbound_rx.recv().await {
                network.send(contents);
            }
        });

        let event_loop = {
            let inner = inner.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        Some(event) = collection_rx.recv() => inner.on_collection_event(event),
                        Some(event) = network_rx.recv() => inner.on_network_event(event),
                        else => break,
                    }
                }
                debug!("Repo event loop stopped");
            })
        };

        info!(peer_id = %inner.peer_id, "Repo started");

        Repo {
            inner,
            tasks: vec![forwarder, event_loop],
        }
    }
}

/// Running state of one document's synchronizer
struct SynchronizerEntry<D: CrdtDocument> {
    synchronizer: Arc<DocSynchronizer<D>>,
    inbox: mpsc::UnboundedSender<SynchronizerCommand>,
    task: JoinHandle<()>,
    autosave: Option<JoinHandle<()>>,
}

impl<D: CrdtDocument> SynchronizerEntry<D> {
    fn command(&self, command: SynchronizerCommand) {
        if self.inbox.send(command).is_err() {
            debug!(document_id = %self.synchronizer.document_id(), "Synchronizer inbox closed");
        }
    }

    fn stop(self) {
        self.task.abort();
        if let Some(autosave) = self.autosave {
            autosave.abort();
        }
    }
}

struct RepoInner<D: CrdtDocument> {
    peer_id: PeerId,
    collection: DocCollection<D>,
    network: Arc<NetworkSubsystem>,
    storage: Option<StorageSubsystem>,
    synchronizers: Mutex<HashMap<DocumentId, SynchronizerEntry<D>>>,
    /// Documents cached only because a peer mentioned them, with the task
    /// waiting for each to resolve
    remote_only: Mutex<HashMap<DocumentId, JoinHandle<()>>>,
    share_policy: SharePolicy,
    ephemeral_tx: broadcast::Sender<EphemeralMessage>,
    outbound_tx: mpsc::UnboundedSender<MessageContents>,
}

impl<D: CrdtDocument> RepoInner<D> {
    fn on_collection_event(&self, event: CollectionEvent<D>) {
        match event {
            CollectionEvent::Document { handle } => {
                // Skip handles evicted or deleted before the event got here
                let current = self
                    .collection
                    .get(handle.document_id())
                    .is_some_and(|cached| cached.ptr_eq(&handle));
                if current {
                    self.ensure_synchronizer(&handle);
                }
            }
            CollectionEvent::DeleteDocument { document_id } => self.retire(&document_id),
        }
    }

    fn on_network_event(self: &Arc<Self>, event: NetworkEvent) {
        match event {
            NetworkEvent::Ready => debug!("Network ready"),
            NetworkEvent::PeerConnected { peer_id, .. } => {
                let synchronizers = self.synchronizers.lock();
                for (document_id, entry) in synchronizers.iter() {
                    if (self.share_policy)(&peer_id, document_id) {
                        entry.command(SynchronizerCommand::BeginSync(peer_id.clone()));
                    }
                }
            }
            NetworkEvent::PeerDisconnected { peer_id } => {
                let synchronizers = self.synchronizers.lock();
                for entry in synchronizers.values() {
                    entry.command(SynchronizerCommand::EndSync(peer_id.clone()));
                }
            }
            NetworkEvent::Message(message) => self.route(message),
            NetworkEvent::Auth(message) => {
                debug!(
                    sender_id = %message.sender_id(),
                    "Ignoring auth message, no authenticator configured"
                );
            }
        }
    }

    /// Start a synchronizer for the handle unless one is already running
    fn ensure_synchronizer(
        &self,
        handle: &DocHandle<D>,
    ) -> mpsc::UnboundedSender<SynchronizerCommand> {
        let document_id = handle.document_id().clone();
        let mut synchronizers = self.synchronizers.lock();

        if let Some(entry) = synchronizers.get(&document_id) {
            if entry.synchronizer.handle().ptr_eq(handle) {
                return entry.inbox.clone();
            }
        }
        // A handle for this id was deleted and found again
        if let Some(stale) = synchronizers.remove(&document_id) {
            stale.stop();
        }

        let synchronizer = Arc::new(DocSynchronizer::new(handle.clone(), self.outbound_tx.clone()));
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let task = synchronizer.clone().spawn(inbox_rx);

        let autosave = match &self.storage {
            Some(storage) => {
                if handle.state() == HandleState::Loading {
                    let storage = storage.clone();
                    let handle = handle.clone();
                    tokio::spawn(async move {
                        if let Err(e) = storage.load_into(&handle) {
                            warn!(
                                document_id = %handle.document_id(),
                                error = %e,
                                "Failed to load document"
                            );
                        }
                    });
                }
                Some(storage.attach(handle.clone()))
            }
            None => {
                handle.request();
                None
            }
        };

        let entry = SynchronizerEntry {
            synchronizer,
            inbox: inbox.clone(),
            task,
            autosave,
        };
        for peer_id in self.network.peers() {
            if (self.share_policy)(&peer_id, &document_id) {
                entry.command(SynchronizerCommand::BeginSync(peer_id));
            }
        }
        debug!(%document_id, "Synchronizer registered");
        synchronizers.insert(document_id, entry);
        inbox
    }

    /// Stop the synchronizer of a deleted document
    fn retire(&self, document_id: &DocumentId) {
        {
            let mut synchronizers = self.synchronizers.lock();
            let deleted = synchronizers
                .get(document_id)
                .is_some_and(|entry| entry.synchronizer.handle().is_deleted());
            if deleted {
                if let Some(entry) = synchronizers.remove(document_id) {
                    entry.stop();
                }
            }
        }
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.remove(document_id) {
                warn!(%document_id, error = %e, "Failed to remove deleted document");
            }
        }
    }

    fn route(self: &Arc<Self>, message: RepoMessage) {
        if let Message::Ephemeral {
            sender_id,
            document_id,
            session_id,
            count,
            data,
            ..
        } = message.as_message()
        {
            let _ = self.ephemeral_tx.send(EphemeralMessage {
                sender_id: sender_id.clone(),
                document_id: document_id.clone(),
                session_id: session_id.clone(),
                count: *count,
                data: data.clone(),
            });
            return;
        }

        let document_id = message.document_id().clone();
        let handle = {
            let mut remote_only = self.remote_only.lock();
            match self.collection.get(&document_id) {
                Some(handle) => handle,
                None => {
                    debug!(
                        %document_id,
                        sender_id = %message.sender_id(),
                        "Message for unknown document"
                    );
                    let handle = self.collection.find(&document_id);
                    remote_only.insert(document_id.clone(), self.watch_unrequested(&handle));
                    handle
                }
            }
        };
        let inbox = self.ensure_synchronizer(&handle);
        if inbox.send(SynchronizerCommand::Receive(message)).is_err() {
            debug!(%document_id, "Synchronizer inbox closed, dropping message");
        }
    }

    /// Wait for a document only a peer asked about to resolve
    fn watch_unrequested(self: &Arc<Self>, handle: &DocHandle<D>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = handle.clone();
        tokio::spawn(async move {
            let state = handle.resolved().await;
            if let Some(this) = weak.upgrade() {
                this.settle_unrequested(&handle, state);
            }
        })
    }

    /// Evict an unrequested document that no source could supply
    ///
    /// Lock order is remote_only, then collection, then synchronizers.
    fn settle_unrequested(&self, handle: &DocHandle<D>, state: HandleState) {
        let document_id = handle.document_id();
        let mut remote_only = self.remote_only.lock();
        // A local find claimed the document in the meantime
        if remote_only.remove(document_id).is_none() {
            return;
        }
        if state != HandleState::Unavailable || !self.collection.evict(handle) {
            return;
        }
        let mut synchronizers = self.synchronizers.lock();
        let owned = synchronizers
            .get(document_id)
            .is_some_and(|entry| entry.synchronizer.handle().ptr_eq(handle));
        if owned {
            if let Some(entry) = synchronizers.remove(document_id) {
                entry.stop();
            }
        }
        debug!(%document_id, "Dropped unavailable document no local caller asked for");
    }
}

/// A replicated document store
///
/// Owns the document collection, the network subsystem and optional storage,
/// and runs one synchronizer per document. Dropping the repo stops all of its
/// background tasks.
pub struct Repo<D: CrdtDocument = Automerge> {
    inner: Arc<RepoInner<D>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Repo<Automerge> {
    /// Start building an Automerge repo
    pub fn builder(config: RepoConfig) -> RepoBuilder<Automerge> {
        RepoBuilder::new(config)
    }

    /// Create an Automerge repo with optional storage
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: RepoConfig, storage: Option<Arc<dyn StorageAdapter>>) -> Self {
        let builder = RepoBuilder::new(config);
        match storage {
            Some(storage) => builder.storage(storage).build(),
            None => builder.build(),
        }
    }
}

impl<D: CrdtDocument> Repo<D> {
    pub fn peer_id(&self) -> &PeerId {
        &self.inner.peer_id
    }

    /// Attach a network adapter
    pub fn add_network_adapter(&self, adapter: Arc<dyn NetworkAdapter>) {
        self.inner.network.add_adapter(adapter);
    }

    /// Peers currently connected
    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.network.peers()
    }

    /// Create a new, locally authored document
    pub fn create(&self) -> DocHandle<D> {
        self.inner.collection.create()
    }

    /// Find a document by id
    ///
    /// Resolves from storage if present, otherwise from connected peers.
    pub fn find(&self, document_id: &DocumentId) -> DocHandle<D> {
        let mut remote_only = self.inner.remote_only.lock();
        if let Some(watcher) = remote_only.remove(document_id) {
            watcher.abort();
        }
        self.inner.collection.find(document_id)
    }

    /// Delete a document locally
    pub fn delete(&self, document_id: &DocumentId) {
        self.inner.collection.delete(document_id);
    }

    /// Handles currently held in memory
    pub fn handles(&self) -> Vec<DocHandle<D>> {
        self.inner.collection.handles()
    }

    /// Ids of every document in storage
    pub fn stored_document_ids(&self) -> RepoResult<Vec<DocumentId>> {
        match &self.inner.storage {
            Some(storage) => storage.adapter().document_ids(),
            None => Ok(Vec::new()),
        }
    }

    /// Peers the synchronizer of a document is tracking
    pub fn sync_peers(&self, document_id: &DocumentId) -> Vec<PeerId> {
        self.inner
            .synchronizers
            .lock()
            .get(document_id)
            .map(|entry| entry.synchronizer.peers())
            .unwrap_or_default()
    }

    /// Subscribe to ephemeral messages from peers
    pub fn subscribe_ephemeral(&self) -> broadcast::Receiver<EphemeralMessage> {
        self.inner.ephemeral_tx.subscribe()
    }

    /// Send an unpersisted message about a document to every connected peer
    pub fn broadcast_ephemeral(&self, document_id: &DocumentId, data: Vec<u8>) {
        for target_id in self.inner.network.peers() {
            self.inner.network.send(MessageContents::Ephemeral {
                target_id,
                document_id: document_id.clone(),
                data: data.clone(),
            });
        }
    }

    /// Save every ready document to storage
    pub fn flush(&self) -> RepoResult<()> {
        let Some(storage) = &self.inner.storage else {
            return Ok(());
        };
        for handle in self.inner.collection.handles() {
            if handle.is_ready() {
                storage.save(&handle)?;
            }
        }
        Ok(())
    }

    /// Flush, disconnect adapters and stop background tasks
    pub fn shutdown(&mut self) -> RepoResult<()> {
        let flushed = self.flush();
        self.inner.network.shutdown();
        self.stop_tasks();
        info!(peer_id = %self.inner.peer_id, "Repo stopped");
        flushed
    }

    fn stop_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        for (_, watcher) in self.inner.remote_only.lock().drain() {
            watcher.abort();
        }
        for (_, entry) in self.inner.synchronizers.lock().drain() {
            entry.stop();
        }
    }
}

impl<D: CrdtDocument> Drop for Repo<D> {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use automerge::transaction::Transactable;
    use automerge::ROOT;
    use tempfile::TempDir;

    use crate::storage::MemoryStorageAdapter;

    #[test]
    fn test_config_defaults() {
        let config = RepoConfig::default();
        assert!(!config.peer_id.is_empty());
        assert_eq!(config.event_capacity, EVENT_CHANNEL_CAPACITY);
        assert!(config.share_by_default);
    }

    #[test]
    fn test_config_partial_json_uses_defaults() {
        let config: RepoConfig = serde_json::from_str(r#"{"peer_id": "alice"}"#).unwrap();
        assert_eq!(config.peer_id.as_str(), "alice");
        assert!(config.share_by_default);
    }

    #[test]
    fn test_config_load_or_create_persists_peer_id() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/config.json");

        let first = RepoConfig::load_or_create(&path).unwrap();
        let second = RepoConfig::load_or_create(&path).unwrap();

        assert!(path.exists());
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_create_without_storage_is_ready() {
        let repo = Repo::new(RepoConfig::with_peer_id("alice"), None);
        let handle = repo.create();
        handle.change(|tx| tx.put(ROOT, "count", 1_i64)).unwrap();

        assert_eq!(
            handle.to_json().await.unwrap(),
            serde_json::json!({"count": 1})
        );
        assert!(repo.find(handle.document_id()).ptr_eq(&handle));
    }

    #[tokio::test]
    async fn test_find_without_storage_or_peers_requests() {
        let repo = Repo::new(RepoConfig::with_peer_id("alice"), None);
        let handle = repo.find(&DocumentId::from("elsewhere"));

        tokio::time::timeout(Duration::from_secs(2), async {
            while handle.state() != HandleState::Requesting {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("handle never started requesting");
    }

    #[tokio::test]
    async fn test_flush_and_reload_from_storage() {
        let storage = Arc::new(MemoryStorageAdapter::new());
        let id = {
            let repo = Repo::new(RepoConfig::with_peer_id("alice"), Some(storage.clone()));
            let handle = repo.create();
            handle.change(|tx| tx.put(ROOT, "title", "notes")).unwrap();
            repo.flush().unwrap();
            handle.document_id().clone()
        };

        let repo = Repo::new(RepoConfig::with_peer_id("alice"), Some(storage));
        assert_eq!(repo.stored_document_ids().unwrap(), vec![id.clone()]);
        let handle = repo.find(&id);
        let value = tokio::time::timeout(Duration::from_secs(2), handle.to_json())
            .await
            .expect("document did not load")
            .unwrap();
        assert_eq!(value, serde_json::json!({"title": "notes"}));
    }

    fn request_from_bob(document_id: &DocumentId) -> RepoMessage {
        let data = Automerge::new()
            .generate_sync_step(&mut Automerge::new_cursor())
            .unwrap();
        RepoMessage::try_from(Message::Request {
            sender_id: PeerId::from("bob"),
            target_id: PeerId::from("alice"),
            document_id: document_id.clone(),
            data,
        })
        .unwrap()
    }

    async fn wait_until(what: &str, cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
    }

    #[tokio::test]
    async fn test_unavailable_remote_only_document_is_evicted() {
        let repo = Repo::new(RepoConfig::with_peer_id("alice"), None);
        let id = DocumentId::from("asked-by-bob");

        repo.inner.route(request_from_bob(&id));
        let handle = repo.inner.collection.get(&id).unwrap();
        wait_until("a synchronizer", || !repo.sync_peers(&id).is_empty()).await;

        handle.unavailable();

        wait_until("eviction", || repo.handles().is_empty()).await;
        assert!(repo.sync_peers(&id).is_empty());
        assert!(repo.inner.remote_only.lock().is_empty());
    }

    #[tokio::test]
    async fn test_local_find_keeps_document_a_peer_asked_about() {
        let repo = Repo::new(RepoConfig::with_peer_id("alice"), None);
        let id = DocumentId::from("asked-by-both");

        repo.inner.route(request_from_bob(&id));
        let found = repo.find(&id);
        assert!(repo.inner.remote_only.lock().is_empty());

        found.unavailable();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(repo.handles().len(), 1);
        assert!(repo.find(&id).ptr_eq(&found));
    }

    #[tokio::test]
    async fn test_ready_remote_only_document_stays_cached() {
        let repo = Repo::new(RepoConfig::with_peer_id("alice"), None);
        let id = DocumentId::from("supplied-by-bob");

        repo.inner.route(request_from_bob(&id));
        let handle = repo.inner.collection.get(&id).unwrap();
        handle.change(|tx| tx.put(ROOT, "from", "bob")).unwrap();

        wait_until("the watcher to settle", || {
            repo.inner.remote_only.lock().is_empty()
        })
        .await;
        assert_eq!(repo.handles().len(), 1);
    }

    #[tokio::test]
    async fn test_event_burst_beyond_capacity_wires_every_document() {
        let config = RepoConfig {
            event_capacity: 4,
            ..RepoConfig::with_peer_id("alice")
        };
        let storage = Arc::new(MemoryStorageAdapter::new());
        let repo = Repo::new(config, Some(storage.clone()));

        let handles: Vec<_> = (0..40).map(|_| repo.create()).collect();
        for (i, handle) in handles.iter().enumerate() {
            handle.change(|tx| tx.put(ROOT, "n", i as i64)).unwrap();
        }

        wait_until("every document to be autosaved", || {
            storage.document_ids().map(|ids| ids.len()).unwrap_or(0) == handles.len()
        })
        .await;
        assert_eq!(repo.inner.synchronizers.lock().len(), handles.len());
    }
}
