//! Network subsystem
//!
//! Fans adapters in and out for the repo:
//!
//! ```text
//!  adapter A ──┐                        ┌── NetworkEvent::PeerConnected
//!  adapter B ──┼─► forwarder tasks ─────┼── NetworkEvent::Message (validated,
//!  adapter C ──┘   (one per adapter)    │     ephemeral deduplicated)
//!                                       └── NetworkEvent::Auth
//!
//!  send(MessageContents) ─► stamp sender/session/count ─► route by target
//! ```
//!
//! Outbound sends are best effort: a message for a peer without a route is
//! logged and dropped.
//!
//! Events reach the repo through [`NetworkSubsystem::listen`], which never
//! drops anything. [`NetworkSubsystem::subscribe`] is a bounded view for
//! observers that can tolerate lag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::adapter::{NetworkAdapter, NetworkAdapterEvent, PeerMetadata};
use super::ephemeral::EphemeralDeduplicator;
use crate::protocol::{Message, MessageContents, RepoMessage};
use crate::types::{PeerId, SessionId};

/// Default capacity for the network event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events published by the network subsystem
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// An adapter reported it is ready
    Ready,
    /// A peer became reachable
    PeerConnected {
        peer_id: PeerId,
        metadata: PeerMetadata,
    },
    /// A peer is gone
    PeerDisconnected { peer_id: PeerId },
    /// A validated repo message
    Message(RepoMessage),
    /// An authentication payload, passed through untouched
    Auth(Message),
}

/// Owns the adapters and the local identity on the wire
pub struct NetworkSubsystem {
    peer_id: PeerId,
    session_id: SessionId,
    ephemeral_count: AtomicU64,
    adapters: Mutex<Vec<Arc<dyn NetworkAdapter>>>,
    routes: Mutex<HashMap<PeerId, usize>>,
    dedup: Mutex<EphemeralDeduplicator>,
    event_tx: broadcast::Sender<NetworkEvent>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<NetworkEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NetworkSubsystem {
    /// Create a subsystem for `peer_id` with a fresh session
    pub fn new(peer_id: PeerId) -> Arc<Self> {
        Self::with_capacity(peer_id, EVENT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(peer_id: PeerId, capacity: usize) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            peer_id,
            session_id: SessionId::new(),
            ephemeral_count: AtomicU64::new(0),
            adapters: Mutex::new(Vec::new()),
            routes: Mutex::new(HashMap::new()),
            dedup: Mutex::new(EphemeralDeduplicator::new()),
            event_tx,
            listeners: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Subscribe to network events
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.event_tx.subscribe()
    }

    /// Receive every event from now on, in order and without loss
    pub fn listen(&self) -> mpsc::UnboundedReceiver<NetworkEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().push(tx);
        rx
    }

    /// Peers that currently have a route
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.routes.lock().keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.routes.lock().contains_key(peer_id)
    }

    /// Attach an adapter and connect it as the local peer
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_adapter(self: &Arc<Self>, adapter: Arc<dyn NetworkAdapter>) {
        // Subscribe first so the adapter's Ready is not missed
        let mut events = adapter.subscribe();
        let index = {
            let mut adapters = self.adapters.lock();
            adapters.push(adapter.clone());
            adapters.len() - 1
        };
        info!(adapter = adapter.name(), index, "Adding network adapter");

        let weak: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(this) = weak.upgrade() else { break };
                if !this.handle_adapter_event(index, event) {
                    break;
                }
            }
            debug!(index, "Adapter forwarder stopped");
        });
        self.tasks.lock().push(task);

        adapter.connect(self.peer_id.clone());
    }

    /// Stamp and send outbound contents
    ///
    /// Ephemeral messages get the next count of this session.
    pub fn send(&self, contents: MessageContents) {
        let count = match contents {
            MessageContents::Ephemeral { .. } => {
                self.ephemeral_count.fetch_add(1, Ordering::SeqCst) + 1
            }
            _ => 0,
        };
        let target_id = contents.target_id().clone();
        let message = contents.into_message(self.peer_id.clone(), (&self.session_id, count));

        let adapter = {
            let routes = self.routes.lock();
            routes
                .get(&target_id)
                .and_then(|index| self.adapters.lock().get(*index).cloned())
        };
        match adapter {
            Some(adapter) => {
                trace!(peer_id = %target_id, kind = %message.kind(), "Sending");
                adapter.send(message);
            }
            None => debug!(
                peer_id = %target_id,
                kind = %message.kind(),
                "No route to peer, dropping message"
            ),
        }
    }

    /// Disconnect every adapter and stop forwarding
    pub fn shutdown(&self) {
        let adapters: Vec<_> = self.adapters.lock().drain(..).collect();
        for adapter in adapters {
            adapter.disconnect();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.routes.lock().clear();
    }

    /// Returns false once the adapter has closed
    fn handle_adapter_event(&self, index: usize, event: NetworkAdapterEvent) -> bool {
        match event {
            NetworkAdapterEvent::Ready => {
                debug!(index, "Adapter ready");
                self.emit(NetworkEvent::Ready);
            }
            NetworkAdapterEvent::PeerCandidate { peer_id, metadata } => {
                if peer_id == self.peer_id {
                    debug!(%peer_id, "Ignoring ourselves as a peer candidate");
                    return true;
                }
                self.routes.lock().insert(peer_id.clone(), index);
                info!(%peer_id, "Peer connected");
                self.emit(NetworkEvent::PeerConnected { peer_id, metadata });
            }
            NetworkAdapterEvent::PeerDisconnected { peer_id } => {
                let removed = {
                    let mut routes = self.routes.lock();
                    if routes.get(&peer_id) == Some(&index) {
                        routes.remove(&peer_id);
                        true
                    } else {
                        false
                    }
                };
                if removed {
                    self.dedup.lock().forget_peer(&peer_id);
                    info!(%peer_id, "Peer disconnected");
                    self.emit(NetworkEvent::PeerDisconnected { peer_id });
                }
            }
            NetworkAdapterEvent::Message(message) => self.receive(message),
            NetworkAdapterEvent::Close => {
                let lost: Vec<PeerId> = {
                    let mut routes = self.routes.lock();
                    let lost: Vec<PeerId> = routes
                        .iter()
                        .filter(|(_, i)| **i == index)
                        .map(|(p, _)| p.clone())
                        .collect();
                    for peer_id in &lost {
                        routes.remove(peer_id);
                    }
                    lost
                };
                {
                    let mut dedup = self.dedup.lock();
                    for peer_id in &lost {
                        dedup.forget_peer(peer_id);
                    }
                }
                debug!(index, peers = lost.len(), "Adapter closed");
                for peer_id in lost {
                    self.emit(NetworkEvent::PeerDisconnected { peer_id });
                }
                return false;
            }
        }
        true
    }

    fn receive(&self, message: Message) {
        if message.is_auth() {
            if message.sender_id().is_empty() {
                debug!("Dropping auth message without sender");
            } else {
                self.emit(NetworkEvent::Auth(message));
            }
            return;
        }

        let message = match RepoMessage::try_from(message) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "Dropping invalid message");
                return;
            }
        };

        if let Message::Ephemeral {
            sender_id,
            session_id,
            count,
            ..
        } = message.as_message()
        {
            if !self.dedup.lock().observe(sender_id, session_id, *count) {
                trace!(%sender_id, count, "Dropping duplicate ephemeral message");
                return;
            }
        }

        self.emit(NetworkEvent::Message(message));
    }

    fn emit(&self, event: NetworkEvent) {
        self.listeners
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::network::memory::MemoryNetworkAdapter;
    use crate::types::DocumentId;

    async fn next_event(events: &mut broadcast::Receiver<NetworkEvent>) -> NetworkEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for network event")
            .unwrap()
    }

    fn ephemeral(sender: &str, session: &str, count: u64) -> Message {
        Message::Ephemeral {
            sender_id: PeerId::from(sender),
            target_id: PeerId::from("alice"),
            document_id: DocumentId::from("doc-1"),
            session_id: SessionId::from(session),
            count,
            data: vec![],
        }
    }

    #[tokio::test]
    async fn test_peer_lifecycle() {
        let network = NetworkSubsystem::new(PeerId::from("alice"));
        let mut events = network.subscribe();
        let adapter = Arc::new(MemoryNetworkAdapter::new(true, None));
        network.add_adapter(adapter.clone());

        assert!(matches!(next_event(&mut events).await, NetworkEvent::Ready));

        adapter.peer_candidate(PeerId::from("bob"));
        match next_event(&mut events).await {
            NetworkEvent::PeerConnected { peer_id, .. } => assert_eq!(peer_id.as_str(), "bob"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(network.peers(), vec![PeerId::from("bob")]);

        adapter.close();
        match next_event(&mut events).await {
            NetworkEvent::PeerDisconnected { peer_id } => assert_eq!(peer_id.as_str(), "bob"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(network.peers().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_messages_are_dropped() {
        let network = NetworkSubsystem::new(PeerId::from("alice"));
        let mut events = network.subscribe();
        let adapter = Arc::new(MemoryNetworkAdapter::new(false, None));
        network.add_adapter(adapter.clone());

        adapter.receive(Message::Sync {
            sender_id: PeerId::from(""),
            target_id: PeerId::from("alice"),
            document_id: DocumentId::from("doc-1"),
            data: vec![1],
        });
        adapter.receive(ephemeral("bob", "s1", 1));

        // Only the valid one comes through
        match next_event(&mut events).await {
            NetworkEvent::Message(m) => assert!(m.as_message().is_ephemeral()),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_ephemeral_is_dropped() {
        let network = NetworkSubsystem::new(PeerId::from("alice"));
        let mut events = network.subscribe();
        let adapter = Arc::new(MemoryNetworkAdapter::new(false, None));
        network.add_adapter(adapter.clone());

        adapter.receive(ephemeral("bob", "s1", 1));
        adapter.receive(ephemeral("bob", "s1", 1));
        adapter.receive(ephemeral("bob", "s1", 2));

        let counts: Vec<u64> = [next_event(&mut events).await, next_event(&mut events).await]
            .into_iter()
            .map(|event| match event {
                NetworkEvent::Message(m) => match m.into_message() {
                    Message::Ephemeral { count, .. } => count,
                    other => panic!("unexpected message: {:?}", other),
                },
                other => panic!("unexpected event: {:?}", other),
            })
            .collect();
        assert_eq!(counts, vec![1, 2]);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_forgets_ephemeral_sessions() {
        let network = NetworkSubsystem::new(PeerId::from("alice"));
        let mut events = network.listen();
        let adapter = Arc::new(MemoryNetworkAdapter::new(false, None));
        network.add_adapter(adapter.clone());

        adapter.peer_candidate(PeerId::from("bob"));
        adapter.receive(ephemeral("bob", "s1", 5));
        adapter.peer_disconnected(PeerId::from("bob"));
        adapter.peer_candidate(PeerId::from("bob"));
        adapter.receive(ephemeral("bob", "s1", 1));

        let mut counts = Vec::new();
        while counts.len() < 2 {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("timed out waiting for network event")
                .expect("network dropped");
            if let NetworkEvent::Message(m) = event {
                if let Message::Ephemeral { count, .. } = m.into_message() {
                    counts.push(count);
                }
            }
        }
        assert_eq!(counts, vec![5, 1]);
        assert_eq!(network.dedup.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_listen_never_lags() {
        let network = NetworkSubsystem::with_capacity(PeerId::from("alice"), 4);
        let mut lossy = network.subscribe();
        let mut events = network.listen();
        let adapter = Arc::new(MemoryNetworkAdapter::new(false, None));
        network.add_adapter(adapter.clone());

        for count in 1..=100 {
            adapter.receive(ephemeral("bob", "s1", count));
        }

        for expected in 1..=100u64 {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("timed out waiting for network event")
                .expect("network dropped");
            match event {
                NetworkEvent::Message(m) => match m.into_message() {
                    Message::Ephemeral { count, .. } => assert_eq!(count, expected),
                    other => panic!("unexpected message: {:?}", other),
                },
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert!(matches!(
            lossy.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(_))
        ));
    }

    #[tokio::test]
    async fn test_auth_is_passed_through() {
        let network = NetworkSubsystem::new(PeerId::from("alice"));
        let mut events = network.subscribe();
        let adapter = Arc::new(MemoryNetworkAdapter::new(false, None));
        network.add_adapter(adapter.clone());

        adapter.receive(Message::Auth {
            sender_id: PeerId::from("bob"),
            target_id: PeerId::from("alice"),
            payload: vec![42],
        });

        match next_event(&mut events).await {
            NetworkEvent::Auth(Message::Auth { payload, .. }) => assert_eq!(payload, vec![42]),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_stamps_sender_and_counts() {
        let sent = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = sent.clone();
        let adapter = Arc::new(MemoryNetworkAdapter::new(
            true,
            Some(Arc::new(move |m: Message| sink.lock().push(m))),
        ));
        let network = NetworkSubsystem::new(PeerId::from("alice"));
        let mut events = network.subscribe();
        network.add_adapter(adapter.clone());
        adapter.peer_candidate(PeerId::from("bob"));
        next_event(&mut events).await;
        next_event(&mut events).await;

        for _ in 0..2 {
            network.send(MessageContents::Ephemeral {
                target_id: PeerId::from("bob"),
                document_id: DocumentId::from("doc-1"),
                data: vec![],
            });
        }
        network.send(MessageContents::Sync {
            target_id: PeerId::from("carol"),
            document_id: DocumentId::from("doc-1"),
            data: vec![],
        });

        let sent = sent.lock();
        assert_eq!(sent.len(), 2, "unroutable message must be dropped");
        for (expected, message) in (1..).zip(sent.iter()) {
            match message {
                Message::Ephemeral {
                    sender_id,
                    session_id,
                    count,
                    ..
                } => {
                    assert_eq!(sender_id.as_str(), "alice");
                    assert_eq!(session_id, network.session_id());
                    assert_eq!(*count, expected);
                }
                other => panic!("unexpected message: {:?}", other),
            }
        }
    }
}
