//! Per-document synchronization
//!
//! A [`DocSynchronizer`] keeps one document converged with every peer it
//! knows about. It never computes diffs: the CRDT's resumable sync protocol
//! decides what a peer is missing, given the document and that peer's
//! cursor. The synchronizer only schedules and fans out that exchange.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  DocSynchronizer (one per document)                             │
//! │  ├── handle: DocHandle                                          │
//! │  ├── peers: IndexSet<PeerId>        tracked, insertion ordered  │
//! │  ├── sync_states: PeerId -> cursor  kept after end_sync         │
//! │  ├── unavailable: peers that said doc-unavailable               │
//! │  └── outbound: mpsc -> network subsystem                        │
//! │                                                                 │
//! │  Actor task (spawn)                                             │
//! │  ├── inbox: BeginSync / EndSync / Receive                       │
//! │  └── handle events: Changed -> sync_with_peers, Deleted -> stop │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The cursor table lock is held from reading a cursor until the advanced
//! cursor is stored back, which serializes cursor updates per
//! (document, peer). Lock order is cursor table, then document.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::document::CrdtDocument;
use crate::error::{RepoError, RepoResult};
use crate::handle::{DocHandle, HandleEvent, HandleState};
use crate::protocol::{Message, MessageContents, RepoMessage};
use crate::types::{DocumentId, PeerId};

/// Work items processed by a synchronizer's actor task
#[derive(Debug, Clone)]
pub enum SynchronizerCommand {
    /// A peer became reachable and may want this document
    BeginSync(PeerId),
    /// A peer went away
    EndSync(PeerId),
    /// A validated inbound message for this document
    Receive(RepoMessage),
}

struct PeerTable<C> {
    peers: IndexSet<PeerId>,
    sync_states: HashMap<PeerId, C>,
    unavailable: HashSet<PeerId>,
}

impl<C> PeerTable<C> {
    fn new() -> Self {
        Self {
            peers: IndexSet::new(),
            sync_states: HashMap::new(),
            unavailable: HashSet::new(),
        }
    }

    /// True when every tracked peer other than `except` has said it cannot
    /// supply the document
    fn exhausted_except(&self, except: &PeerId) -> bool {
        self.peers
            .iter()
            .filter(|p| *p != except)
            .all(|p| self.unavailable.contains(p))
    }
}

/// Drives convergence of one document with all of its peers
pub struct DocSynchronizer<D: CrdtDocument> {
    handle: DocHandle<D>,
    table: Mutex<PeerTable<D::Cursor>>,
    outbound: mpsc::UnboundedSender<MessageContents>,
}

impl<D: CrdtDocument> DocSynchronizer<D> {
    /// Create a synchronizer for `handle`, emitting outbound messages on
    /// `outbound`
    pub fn new(handle: DocHandle<D>, outbound: mpsc::UnboundedSender<MessageContents>) -> Self {
        Self {
            handle,
            table: Mutex::new(PeerTable::new()),
            outbound,
        }
    }

    pub fn handle(&self) -> &DocHandle<D> {
        &self.handle
    }

    pub fn document_id(&self) -> &DocumentId {
        self.handle.document_id()
    }

    /// Peers currently tracked, in the order they were first seen
    pub fn peers(&self) -> Vec<PeerId> {
        self.table.lock().peers.iter().cloned().collect()
    }

    pub fn has_peer(&self, peer_id: &PeerId) -> bool {
        self.table.lock().peers.contains(peer_id)
    }

    /// Get the cursor for `peer_id`, creating an initial one if needed
    ///
    /// The peer is added to the tracked set if it is not already there.
    ///
    /// # Errors
    ///
    /// Returns `RepoError::InvalidPeerId` for an empty peer id.
    pub fn get_sync_state(&self, peer_id: &PeerId) -> RepoResult<D::Cursor> {
        validate_peer(peer_id)?;
        let mut table = self.table.lock();
        Ok(Self::cursor_entry(&mut table, peer_id).clone())
    }

    /// Replace the stored cursor for `peer_id`
    pub fn set_sync_state(&self, peer_id: &PeerId, cursor: D::Cursor) -> RepoResult<()> {
        validate_peer(peer_id)?;
        self.table.lock().sync_states.insert(peer_id.clone(), cursor);
        Ok(())
    }

    /// Start the handshake with a peer that newly has or wants the document
    ///
    /// Waits until the handle can be read for sync, then sends the first step
    /// if there is one. Sends nothing if both sides are believed equal.
    pub async fn begin_sync(&self, peer_id: &PeerId) -> RepoResult<()> {
        validate_peer(peer_id)?;
        debug!(document_id = %self.document_id(), %peer_id, "Beginning sync");

        let doc = self.handle.sync_value().await?;

        let mut table = self.table.lock();
        if !table.peers.contains(peer_id) {
            if let Some(cursor) = table.sync_states.get(peer_id) {
                trace!(document_id = %self.document_id(), %peer_id, "Resuming stored cursor");
                let resumed = D::resume_cursor(cursor);
                table.sync_states.insert(peer_id.clone(), resumed);
            }
        }
        table.unavailable.remove(peer_id);
        self.send_step(&mut table, peer_id, &doc);
        Ok(())
    }

    /// Stop tracking a peer
    ///
    /// The peer's cursor is kept so a reconnect resumes instead of restarting.
    pub fn end_sync(&self, peer_id: &PeerId) {
        let removed = self.table.lock().peers.shift_remove(peer_id);
        if removed {
            debug!(document_id = %self.document_id(), %peer_id, "Ended sync");
        }
    }

    /// Apply an incoming sync step from `peer_id`
    ///
    /// The merge runs under the handle's atomic update, with the peer's
    /// cursor advanced in the same critical section. Afterwards the sender
    /// gets our next step, if any.
    ///
    /// Only a peer that holds the document sends sync steps, so a requested
    /// handle becomes ready once it has everything that peer has, even if
    /// that is nothing.
    ///
    /// # Errors
    ///
    /// Malformed payloads are returned as errors and leave the cursor as it
    /// was.
    pub fn on_sync_message(&self, peer_id: &PeerId, data: &[u8]) -> RepoResult<()> {
        validate_peer(peer_id)?;
        debug!(
            document_id = %self.document_id(),
            %peer_id,
            bytes = data.len(),
            "Received sync step"
        );

        let mut table = self.table.lock();
        self.apply_step(&mut table, peer_id, data)?;
        if matches!(
            self.handle.state(),
            HandleState::Requesting | HandleState::Unavailable
        ) {
            let cursor = Self::cursor_entry(&mut table, peer_id);
            if self.handle.with_doc(|doc| doc.in_sync_with(cursor)) {
                debug!(document_id = %self.document_id(), %peer_id, "Caught up with peer");
                self.handle.promote_to_ready();
            }
        }
        self.reply(&mut table, peer_id);
        Ok(())
    }

    /// Apply a request from a peer that does not have the document yet
    ///
    /// If we cannot supply the document either, and no other tracked peer is
    /// still a possible source, the requester is told `doc-unavailable`.
    pub fn on_request_message(&self, peer_id: &PeerId, data: &[u8]) -> RepoResult<()> {
        validate_peer(peer_id)?;
        debug!(
            document_id = %self.document_id(),
            %peer_id,
            bytes = data.len(),
            "Received request"
        );

        let mut table = self.table.lock();
        self.apply_step(&mut table, peer_id, data)?;

        if !self.handle.is_ready() && table.exhausted_except(peer_id) {
            debug!(document_id = %self.document_id(), %peer_id, "Document unavailable here");
            self.send(MessageContents::DocUnavailable {
                target_id: peer_id.clone(),
                document_id: self.document_id().clone(),
            });
        } else {
            self.reply(&mut table, peer_id);
        }
        Ok(())
    }

    /// Record that `peer_id` cannot supply the document
    ///
    /// Once every tracked peer has said so while we are still requesting, the
    /// handle is marked unavailable so readers stop waiting.
    pub fn on_doc_unavailable(&self, peer_id: &PeerId) -> RepoResult<()> {
        validate_peer(peer_id)?;
        debug!(document_id = %self.document_id(), %peer_id, "Peer reports document unavailable");

        let mut table = self.table.lock();
        table.unavailable.insert(peer_id.clone());
        let exhausted = !table.peers.is_empty()
            && table.peers.iter().all(|p| table.unavailable.contains(p));
        drop(table);

        if exhausted && self.handle.state() == HandleState::Requesting {
            self.handle.unavailable();
        }
        Ok(())
    }

    /// Dispatch a validated inbound message
    ///
    /// Waits until storage has been consulted, so stored changes are merged
    /// before remote ones and a peer is never told `doc-unavailable` for a
    /// document we are still loading.
    pub async fn receive_message(&self, message: &RepoMessage) -> RepoResult<()> {
        self.handle.sync_value().await?;
        match message.as_message() {
            Message::Sync {
                sender_id, data, ..
            } => self.on_sync_message(sender_id, data),
            Message::Request {
                sender_id, data, ..
            } => self.on_request_message(sender_id, data),
            Message::DocUnavailable { sender_id, .. } => self.on_doc_unavailable(sender_id),
            Message::Ephemeral { .. } | Message::Auth { .. } => {
                trace!(
                    document_id = %self.document_id(),
                    kind = %message.kind(),
                    "Ignoring message not meant for a synchronizer"
                );
                Ok(())
            }
        }
    }

    /// Send the next step to every tracked peer
    ///
    /// Reads the document once, then generates a step per peer. Runs after
    /// every change of the handle.
    pub async fn sync_with_peers(&self) -> RepoResult<()> {
        // Peers are reached through begin_sync until the document is ready
        if !self.handle.is_ready() {
            return Ok(());
        }
        let doc = self.handle.value().await?;
        let mut table = self.table.lock();
        let peers: Vec<PeerId> = table.peers.iter().cloned().collect();
        trace!(document_id = %self.document_id(), peers = peers.len(), "Syncing with peers");
        for peer_id in &peers {
            self.send_step(&mut table, peer_id, &doc);
        }
        Ok(())
    }

    /// Spawn the actor task that serializes all work for this document
    ///
    /// The task ends when the inbox closes or the handle is deleted.
    pub fn spawn(
        self: Arc<Self>,
        mut inbox: mpsc::UnboundedReceiver<SynchronizerCommand>,
    ) -> JoinHandle<()> {
        let mut events = self.handle.subscribe();
        tokio::spawn(async move {
            debug!(document_id = %self.document_id(), "Synchronizer started");
            loop {
                tokio::select! {
                    command = inbox.recv() => {
                        let Some(command) = command else { break };
                        if let Err(e) = self.handle_command(command).await {
                            error!(
                                document_id = %self.document_id(),
                                error = %e,
                                "Synchronizer command failed"
                            );
                        }
                    }
                    event = events.recv() => {
                        match event {
                            Ok(HandleEvent::Changed) | Err(RecvError::Lagged(_)) => {
                                if let Err(e) = self.sync_with_peers().await {
                                    warn!(
                                        document_id = %self.document_id(),
                                        error = %e,
                                        "Failed to sync with peers"
                                    );
                                }
                            }
                            Ok(HandleEvent::Deleted) | Err(RecvError::Closed) => break,
                        }
                    }
                }
            }
            debug!(document_id = %self.document_id(), "Synchronizer stopped");
        })
    }

    async fn handle_command(&self, command: SynchronizerCommand) -> RepoResult<()> {
        match command {
            SynchronizerCommand::BeginSync(peer_id) => self.begin_sync(&peer_id).await,
            SynchronizerCommand::EndSync(peer_id) => {
                self.end_sync(&peer_id);
                Ok(())
            }
            SynchronizerCommand::Receive(message) => self.receive_message(&message).await,
        }
    }

    fn cursor_entry<'a>(
        table: &'a mut PeerTable<D::Cursor>,
        peer_id: &PeerId,
    ) -> &'a mut D::Cursor {
        table.peers.insert(peer_id.clone());
        table
            .sync_states
            .entry(peer_id.clone())
            .or_insert_with(D::new_cursor)
    }

    fn apply_step(
        &self,
        table: &mut PeerTable<D::Cursor>,
        peer_id: &PeerId,
        data: &[u8],
    ) -> RepoResult<()> {
        let cursor = Self::cursor_entry(table, peer_id);
        // Work on a copy so a failed merge leaves the stored cursor untouched
        let mut next = cursor.clone();
        self.handle
            .update_doc(|doc| doc.receive_sync_step(&mut next, data))?;
        *cursor = next;
        Ok(())
    }

    fn reply(&self, table: &mut PeerTable<D::Cursor>, peer_id: &PeerId) {
        let cursor = Self::cursor_entry(table, peer_id);
        let step = self.handle.with_doc(|doc| doc.generate_sync_step(cursor));
        if let Some(data) = step {
            self.send_sync_step(peer_id, data);
        }
    }

    fn send_step(&self, table: &mut PeerTable<D::Cursor>, peer_id: &PeerId, doc: &D) {
        let cursor = Self::cursor_entry(table, peer_id);
        if let Some(data) = doc.generate_sync_step(cursor) {
            self.send_sync_step(peer_id, data);
        }
    }

    fn send_sync_step(&self, peer_id: &PeerId, data: Vec<u8>) {
        let target_id = peer_id.clone();
        let document_id = self.document_id().clone();
        let contents = if self.handle.is_ready() {
            MessageContents::Sync {
                target_id,
                document_id,
                data,
            }
        } else {
            MessageContents::Request {
                target_id,
                document_id,
                data,
            }
        };
        self.send(contents);
    }

    fn send(&self, contents: MessageContents) {
        debug!(
            document_id = %self.document_id(),
            peer_id = %contents.target_id(),
            kind = %contents.kind(),
            "Sending message"
        );
        if self.outbound.send(contents).is_err() {
            debug!(document_id = %self.document_id(), "Outbound channel closed, dropping message");
        }
    }
}

fn validate_peer(peer_id: &PeerId) -> RepoResult<()> {
    if peer_id.is_empty() {
        return Err(RepoError::InvalidPeerId(peer_id.to_string()));
    }
    Ok(())
}
