//! SyncWatch - Core Library
//!
//! Keeps media playback aligned across the members of a watch session.
//! Peers estimate the host's clock, exchange playback state over a WebRTC
//! data-channel mesh, and correct drift locally. A session registry handles
//! membership, host election and connection setup.

pub mod checkpoint;
pub mod clock;
pub mod ffi;
pub mod network;
pub mod runtime;
pub mod sync;

// Re-exports for convenience
pub use checkpoint::{CheckpointRecord, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use clock::{ClockOffsetEstimator, TimeSource};
pub use runtime::{JoinRequest, PeerRuntime, RuntimeEvent, RuntimeHandle};
pub use sync::{PeerMessage, PlaybackState, PlaybackSyncCoordinator, SyncConfig};

// Setup uniffi scaffolding
uniffi::setup_scaffolding!();
