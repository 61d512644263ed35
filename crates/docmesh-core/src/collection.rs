//! Document registry
//!
//! [`DocCollection`] is the single source of truth mapping a `DocumentId` to
//! its [`DocHandle`]. It never holds two distinct handle objects for the same
//! id. Every `create`/`find`/`delete` publishes exactly one
//! [`CollectionEvent`]; the layer that wires up synchronizers and storage
//! reacts to those events instead of being called directly.
//!
//! That layer reads [`DocCollection::listen`], which is unbounded, so an
//! event burst cannot leave a document unwired. [`DocCollection::subscribe`]
//! is bounded and may lag.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::document::CrdtDocument;
use crate::handle::DocHandle;
use crate::types::{default_id_generator, DocumentId, IdGenerator};

/// Default capacity for the collection event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events published by a [`DocCollection`]
#[derive(Debug)]
pub enum CollectionEvent<D: CrdtDocument> {
    /// Interest in a document was announced by `create` or `find`
    Document { handle: DocHandle<D> },
    /// A document was deleted; the handle is no longer live
    DeleteDocument { document_id: DocumentId },
}

impl<D: CrdtDocument> Clone for CollectionEvent<D> {
    fn clone(&self) -> Self {
        match self {
            CollectionEvent::Document { handle } => CollectionEvent::Document {
                handle: handle.clone(),
            },
            CollectionEvent::DeleteDocument { document_id } => CollectionEvent::DeleteDocument {
                document_id: document_id.clone(),
            },
        }
    }
}

/// Process-wide cache of document handles
pub struct DocCollection<D: CrdtDocument> {
    handles: Mutex<HashMap<DocumentId, DocHandle<D>>>,
    id_generator: IdGenerator,
    event_tx: broadcast::Sender<CollectionEvent<D>>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<CollectionEvent<D>>>>,
}

impl<D: CrdtDocument> DocCollection<D> {
    /// Create an empty collection using random document ids
    pub fn new() -> Self {
        Self::with_id_generator(default_id_generator())
    }

    /// Create an empty collection with an injected id generator
    pub fn with_id_generator(id_generator: IdGenerator) -> Self {
        Self::with_capacity(id_generator, EVENT_CHANNEL_CAPACITY)
    }

    pub(crate) fn with_capacity(id_generator: IdGenerator, capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            handles: Mutex::new(HashMap::new()),
            id_generator,
            event_tx,
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to collection events
    ///
    /// Only events emitted after subscribing are delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<CollectionEvent<D>> {
        self.event_tx.subscribe()
    }

    /// Receive every event from now on, in order and without loss
    pub fn listen(&self) -> mpsc::UnboundedReceiver<CollectionEvent<D>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().push(tx);
        rx
    }

    /// Create a new, locally authored document
    ///
    /// The handle is ready immediately; no storage or network round-trip is
    /// needed to resolve it.
    pub fn create(&self) -> DocHandle<D> {
        let document_id = (self.id_generator)();
        let handle = self.get_or_insert(document_id, true);
        debug!(document_id = %handle.document_id(), "Created document");
        self.emit(CollectionEvent::Document {
            handle: handle.clone(),
        });
        handle
    }

    /// Look up a document, announcing interest in it
    ///
    /// A cache miss creates a handle whose value must still be resolved by
    /// storage or the network. Repeated calls return the identical handle.
    pub fn find(&self, document_id: &DocumentId) -> DocHandle<D> {
        let handle = self.get_or_insert(document_id.clone(), false);
        self.emit(CollectionEvent::Document {
            handle: handle.clone(),
        });
        handle
    }

    /// Delete a document and evict it from the cache
    pub fn delete(&self, document_id: &DocumentId) {
        let handle = {
            let mut handles = self.handles.lock();
            handles
                .remove(document_id)
                .unwrap_or_else(|| DocHandle::new(document_id.clone(), false))
        };
        handle.delete();
        debug!(%document_id, "Deleted document");
        self.emit(CollectionEvent::DeleteDocument {
            document_id: document_id.clone(),
        });
    }

    /// Drop `handle` from the cache without deleting the document
    ///
    /// Nothing happens if the id now maps to a different handle. No event is
    /// published: the document still exists, this node just stops caching it.
    pub(crate) fn evict(&self, handle: &DocHandle<D>) -> bool {
        let mut handles = self.handles.lock();
        match handles.get(handle.document_id()) {
            Some(cached) if cached.ptr_eq(handle) => {
                handles.remove(handle.document_id());
                debug!(document_id = %handle.document_id(), "Evicted document");
                true
            }
            _ => false,
        }
    }

    /// Get a cached handle without announcing interest
    pub fn get(&self, document_id: &DocumentId) -> Option<DocHandle<D>> {
        self.handles.lock().get(document_id).cloned()
    }

    /// Snapshot of all cached handles
    pub fn handles(&self) -> Vec<DocHandle<D>> {
        self.handles.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    fn get_or_insert(&self, document_id: DocumentId, is_new: bool) -> DocHandle<D> {
        let mut handles = self.handles.lock();
        handles
            .entry(document_id)
            .or_insert_with_key(|id| DocHandle::new(id.clone(), is_new))
            .clone()
    }

    fn emit(&self, event: CollectionEvent<D>) {
        self.listeners
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }
}

impl<D: CrdtDocument> Default for DocCollection<D> {
    fn default() -> Self {
        Self::new()
    }
}
