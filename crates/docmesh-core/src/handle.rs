//! Document handles
//!
//! A [`DocHandle`] is the addressable, mutable reference to one document's
//! current value and lifecycle. It is cheap to clone; clones share state, and
//! [`DocHandle::ptr_eq`] tells whether two handles are the same object.
//!
//! ## Lifecycle
//!
//! ```text
//!   create() ──────────────────────────────► Ready
//!   find()  ──► Loading ──(storage hit)────► Ready
//!                  │
//!                  └─(storage miss)─► Requesting ──(sync brings data)──► Ready
//!                                        │
//!                                        └─(every peer said no)─► Unavailable
//!   any state ──delete()──► Deleted
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::document::CrdtDocument;
use crate::error::{RepoError, RepoResult};
use crate::types::DocumentId;

/// Capacity of the per-handle change notification channel
const HANDLE_EVENT_CAPACITY: usize = 256;

/// Lifecycle state of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Waiting for storage to be consulted
    Loading,
    /// Not in storage; asking peers for it
    Requesting,
    /// A value is available locally
    Ready,
    /// Storage and every asked peer came up empty
    Unavailable,
    /// Terminal
    Deleted,
}

impl HandleState {
    fn is_terminal_for_reads(&self) -> bool {
        matches!(self, HandleState::Deleted | HandleState::Unavailable)
    }
}

/// Notifications published by a handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleEvent {
    /// The document value changed
    Changed,
    /// The handle was deleted; no further events follow
    Deleted,
}

struct HandleInner<D> {
    document_id: DocumentId,
    is_new: bool,
    doc: Mutex<D>,
    state: watch::Sender<HandleState>,
    events: broadcast::Sender<HandleEvent>,
}

/// Shared handle to one document
pub struct DocHandle<D: CrdtDocument> {
    inner: Arc<HandleInner<D>>,
}

impl<D: CrdtDocument> Clone for DocHandle<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: CrdtDocument> std::fmt::Debug for DocHandle<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocHandle")
            .field("document_id", &self.inner.document_id)
            .field("is_new", &self.inner.is_new)
            .field("state", &self.state())
            .finish()
    }
}

impl<D: CrdtDocument> DocHandle<D> {
    /// Create a handle
    ///
    /// A new handle is locally authored and ready immediately. Any other
    /// handle starts out loading and must be resolved by storage or network.
    pub fn new(document_id: DocumentId, is_new: bool) -> Self {
        let initial = if is_new {
            HandleState::Ready
        } else {
            HandleState::Loading
        };
        let (state, _) = watch::channel(initial);
        let (events, _) = broadcast::channel(HANDLE_EVENT_CAPACITY);
        Self {
            inner: Arc::new(HandleInner {
                document_id,
                is_new,
                doc: Mutex::new(D::new_document()),
                state,
                events,
            }),
        }
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.inner.document_id
    }

    /// Whether the handle was produced by `create()`
    pub fn is_new(&self) -> bool {
        self.inner.is_new
    }

    pub fn state(&self) -> HandleState {
        *self.inner.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == HandleState::Ready
    }

    pub fn is_deleted(&self) -> bool {
        self.state() == HandleState::Deleted
    }

    /// Whether both handles refer to the same underlying object
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Subscribe to change and deletion notifications
    pub fn subscribe(&self) -> broadcast::Receiver<HandleEvent> {
        self.inner.events.subscribe()
    }

    /// Current heads of the document, without waiting for readiness
    pub fn heads(&self) -> D::Heads {
        self.inner.doc.lock().heads()
    }

    /// Run `f` against the current document under the handle lock
    ///
    /// Does not wait for readiness.
    pub fn with_doc<R>(&self, f: impl FnOnce(&D) -> R) -> R {
        f(&self.inner.doc.lock())
    }

    /// Read the current value, waiting until the document is ready
    ///
    /// # Errors
    ///
    /// `DocumentDeleted` or `DocumentUnavailable` if the handle reaches one of
    /// those states instead.
    pub async fn value(&self) -> RepoResult<D> {
        let state = self
            .wait_for(|s| s == HandleState::Ready || s.is_terminal_for_reads())
            .await;
        match state {
            HandleState::Ready => Ok(self.inner.doc.lock().clone()),
            HandleState::Unavailable => {
                Err(RepoError::DocumentUnavailable(self.document_id().clone()))
            }
            _ => Err(RepoError::DocumentDeleted(self.document_id().clone())),
        }
    }

    /// Read a value suitable for starting a sync exchange
    ///
    /// Unlike [`value`](Self::value) this also resolves while the document is
    /// being requested from peers (or was declared unavailable), returning
    /// whatever is held locally, usually nothing.
    pub async fn sync_value(&self) -> RepoResult<D> {
        let state = self.wait_for(|s| s != HandleState::Loading).await;
        match state {
            HandleState::Deleted => Err(RepoError::DocumentDeleted(self.document_id().clone())),
            _ => Ok(self.inner.doc.lock().clone()),
        }
    }

    /// Wait until the handle settles as ready, unavailable or deleted
    pub async fn resolved(&self) -> HandleState {
        self.wait_for(|s| {
            matches!(
                s,
                HandleState::Ready | HandleState::Unavailable | HandleState::Deleted
            )
        })
        .await
    }

    async fn wait_for(&self, accept: impl Fn(HandleState) -> bool) -> HandleState {
        let mut rx = self.inner.state.subscribe();
        let result = rx.wait_for(|s| accept(*s)).await.map(|s| *s);
        // The sender lives as long as `self`, so the channel cannot close
        result.unwrap_or(HandleState::Deleted)
    }

    /// Atomically apply `mutator` to the current value
    ///
    /// Mutations on one handle are serialized. If the document changed, a
    /// handle that was still loading or requesting becomes ready, and a
    /// [`HandleEvent::Changed`] is published.
    pub fn update_doc<F, R>(&self, mutator: F) -> RepoResult<R>
    where
        F: FnOnce(&mut D) -> RepoResult<R>,
    {
        if self.is_deleted() {
            return Err(RepoError::DocumentDeleted(self.document_id().clone()));
        }

        let (result, changed, empty) = {
            let mut doc = self.inner.doc.lock();
            let before = doc.heads();
            let result = mutator(&mut doc)?;
            (result, doc.heads() != before, doc.is_empty())
        };

        if changed {
            if !empty {
                self.promote_to_ready();
            }
            let _ = self.inner.events.send(HandleEvent::Changed);
        }
        Ok(result)
    }

    /// Merge bytes loaded from storage
    ///
    /// The handle becomes ready if the snapshot held any changes.
    pub fn load(&self, bytes: &[u8]) -> RepoResult<()> {
        self.update_doc(|doc| doc.merge_saved(bytes))
    }

    /// Storage had nothing; start asking peers
    pub fn request(&self) {
        self.inner.state.send_if_modified(|state| {
            if *state == HandleState::Loading {
                *state = HandleState::Requesting;
                true
            } else {
                false
            }
        });
    }

    /// Every source was exhausted while requesting
    pub fn unavailable(&self) {
        let modified = self.inner.state.send_if_modified(|state| {
            if *state == HandleState::Requesting {
                *state = HandleState::Unavailable;
                true
            } else {
                false
            }
        });
        if modified {
            debug!(document_id = %self.document_id(), "Document unavailable");
        }
    }

    /// Mark the handle deleted
    ///
    /// Terminal: readers waiting on the value are released with an error and
    /// subscribers receive [`HandleEvent::Deleted`].
    pub fn delete(&self) {
        let previous = self.inner.state.send_replace(HandleState::Deleted);
        if previous != HandleState::Deleted {
            let _ = self.inner.events.send(HandleEvent::Deleted);
        }
    }

    /// Mark a loading or requested document ready with whatever it holds
    ///
    /// A peer that answers with sync data has the document, even when it is
    /// empty.
    pub(crate) fn promote_to_ready(&self) {
        self.inner.state.send_if_modified(|state| match state {
            HandleState::Loading | HandleState::Requesting | HandleState::Unavailable => {
                *state = HandleState::Ready;
                true
            }
            _ => false,
        });
    }
}
