//! In-process network adapter
//!
//! [`MemoryNetworkAdapter`] carries messages inside one process. It is what
//! tests and the CLI demo run on: two repos joined by
//! [`MemoryNetworkAdapter::connected_pair`] behave like two peers on a real
//! link with a fixed latency.
//!
//! Peer discovery is explicit. Nothing is announced until
//! [`peer_candidate`](MemoryNetworkAdapter::peer_candidate) is called.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::adapter::{NetworkAdapter, NetworkAdapterEvent, PeerMetadata};
use crate::protocol::Message;
use crate::types::PeerId;

/// Capacity of the adapter event channel
/// Callback invoked for every outbound message
pub type SendFn = Arc<dyn Fn(Message) + Send + Sync>;

/// Network adapter backed by a caller-supplied send function
pub struct MemoryNetworkAdapter {
    peer_id: RwLock<Option<PeerId>>,
    start_ready: bool,
    send_fn: Option<SendFn>,
    closed: AtomicBool,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<NetworkAdapterEvent>>>,
}

impl MemoryNetworkAdapter {
    /// Create an adapter
    ///
    /// With `start_ready` the adapter reports `Ready` as soon as it is
    /// connected. Without a `send_fn`, outbound messages are discarded.
    pub fn new(start_ready: bool, send_fn: Option<SendFn>) -> Self {
        Self {
            peer_id: RwLock::new(None),
            start_ready,
            send_fn,
            closed: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Create two adapters wired to each other
    ///
    /// Each direction delivers in send order after `latency`. Must be called
    /// from within a tokio runtime.
    pub fn connected_pair(latency: Duration) -> (Arc<Self>, Arc<Self>) {
        let (send_to_second, second_slot) = delivery_link(latency);
        let (send_to_first, first_slot) = delivery_link(latency);

        let first = Arc::new(Self::new(true, Some(send_to_second)));
        let second = Arc::new(Self::new(true, Some(send_to_first)));

        // Slots are fresh, so these cannot already be set
        let _ = first_slot.set(Arc::downgrade(&first));
        let _ = second_slot.set(Arc::downgrade(&second));

        (first, second)
    }

    /// The peer id this adapter was connected as
    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer_id.read().clone()
    }

    /// Announce that `peer_id` is reachable through this adapter
    pub fn peer_candidate(&self, peer_id: PeerId) {
        self.peer_candidate_with(peer_id, PeerMetadata::default());
    }

    /// Announce a peer along with its metadata
    pub fn peer_candidate_with(&self, peer_id: PeerId, metadata: PeerMetadata) {
        if self.is_closed() {
            return;
        }
        debug!(%peer_id, "Peer candidate");
        self.emit(NetworkAdapterEvent::PeerCandidate { peer_id, metadata });
    }

    /// Announce that `peer_id` went away
    pub fn peer_disconnected(&self, peer_id: PeerId) {
        if self.is_closed() {
            return;
        }
        debug!(%peer_id, "Peer disconnected");
        self.emit(NetworkAdapterEvent::PeerDisconnected { peer_id });
    }

    /// Deliver an inbound message as if it came off the wire
    pub fn receive(&self, message: Message) {
        if self.is_closed() {
            return;
        }
        trace!(kind = %message.kind(), from = %message.sender_id(), "Received message");
        self.emit(NetworkAdapterEvent::Message(message));
    }

    /// Shut the adapter down
    ///
    /// Every later call becomes a silent no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Adapter closed");
        self.emit(NetworkAdapterEvent::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn emit(&self, event: NetworkAdapterEvent) {
        // Subscribers that hung up are dropped
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl NetworkAdapter for MemoryNetworkAdapter {
    fn connect(&self, peer_id: PeerId) {
        if self.is_closed() {
            return;
        }
        *self.peer_id.write() = Some(peer_id);
        if self.start_ready {
            self.emit(NetworkAdapterEvent::Ready);
        }
    }

    fn send(&self, message: Message) {
        if self.is_closed() {
            return;
        }
        if let Some(send_fn) = &self.send_fn {
            send_fn(message);
        }
    }

    fn disconnect(&self) {
        self.close();
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<NetworkAdapterEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// One direction of a connected pair
///
/// Messages go through a single queue drained by one task, so they arrive in
/// the order they were sent.
fn delivery_link(latency: Duration) -> (SendFn, Arc<OnceLock<Weak<MemoryNetworkAdapter>>>) {
    let slot: Arc<OnceLock<Weak<MemoryNetworkAdapter>>> = Arc::new(OnceLock::new());
    let (tx, mut rx) = mpsc::unbounded_channel::<(Instant, Message)>();

    let target = slot.clone();
    tokio::spawn(async move {
        while let Some((due, message)) = rx.recv().await {
            tokio::time::sleep_until(due).await;
            match target.get().and_then(Weak::upgrade) {
                Some(remote) => remote.receive(message),
                None => break,
            }
        }
    });

    let send_fn: SendFn = Arc::new(move |message: Message| {
        // The delivery task only stops once the remote adapter is gone
        let _ = tx.send((Instant::now() + latency, message));
    });
    (send_fn, slot)
}
