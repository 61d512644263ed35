//! docmesh Core Library
//!
//! Replication control plane for Automerge documents.
//!
//! ## Overview
//!
//! docmesh keeps a set of CRDT documents converged across peers. It does not
//! merge anything itself: the CRDT's resumable sync protocol does that. This
//! crate decides who talks to whom about which document, carries the
//! per-peer sync cursors, and reacts to peers and documents coming and going.
//!
//! ## Core Pieces
//!
//! - **DocCollection**: one handle per document id, events on create/find/delete
//! - **DocSynchronizer**: per-document actor driving the sync handshake with
//!   every peer
//! - **NetworkSubsystem**: adapters in, validated messages out; ephemeral
//!   gossip deduplicated per (sender, session)
//! - **StorageSubsystem**: snapshots loaded on first interest, saved on change
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::time::Duration;
//! use docmesh_core::{MemoryNetworkAdapter, PeerId, Repo, RepoConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let alice = Repo::new(RepoConfig::with_peer_id("alice"), None);
//!     let bob = Repo::new(RepoConfig::with_peer_id("bob"), None);
//!
//!     let handle = alice.create();
//!     handle.change(|tx| tx.put(automerge::ROOT, "count", 1_i64))?;
//!
//!     let (a, b) = MemoryNetworkAdapter::connected_pair(Duration::from_millis(10));
//!     alice.add_network_adapter(a.clone());
//!     bob.add_network_adapter(b.clone());
//!     a.peer_candidate(PeerId::from("bob"));
//!     b.peer_candidate(PeerId::from("alice"));
//!
//!     let found = bob.find(handle.document_id());
//!     println!("{}", found.to_json().await?);
//!     Ok(())
//! }
//! ```

pub mod collection;
pub mod document;
pub mod error;
pub mod handle;
pub mod network;
pub mod protocol;
pub mod repo;
pub mod storage;
pub mod synchronizer;
pub mod types;

// Re-exports
pub use collection::{CollectionEvent, DocCollection};
pub use document::{put_root_value, to_json, CrdtDocument};
pub use error::{RepoError, RepoResult};
pub use handle::{DocHandle, HandleEvent, HandleState};
pub use network::{
    EphemeralDeduplicator, EphemeralMessage, MemoryNetworkAdapter, NetworkAdapter,
    NetworkAdapterEvent, NetworkEvent, NetworkSubsystem, PeerMetadata,
};
pub use protocol::{Message, MessageContents, MessageKind, RepoMessage, WireMessage};
pub use repo::{Repo, RepoBuilder, RepoConfig, SharePolicy};
pub use storage::{MemoryStorageAdapter, RedbStorageAdapter, StorageAdapter, StorageSubsystem};
pub use synchronizer::{DocSynchronizer, SynchronizerCommand};
pub use types::*;
