//! Networking for docmesh
//!
//! - [`adapter`]: the transport contract every adapter implements
//! - [`memory`]: an in-process adapter for tests and demos
//! - [`ephemeral`]: deduplication of unpersisted gossip
//! - [`subsystem`]: fan-in/fan-out of adapters for the repo

pub mod adapter;
pub mod ephemeral;
pub mod memory;
pub mod subsystem;

pub use adapter::{NetworkAdapter, NetworkAdapterEvent, PeerMetadata};
pub use ephemeral::{EphemeralDeduplicator, EphemeralMessage};
pub use memory::MemoryNetworkAdapter;
pub use subsystem::{NetworkEvent, NetworkSubsystem};
