//! Sync Engine
//!
//! Keeps local playback aligned with the session host.

mod coordinator;
pub mod drift;
mod media;
mod protocol;
mod scheduler;

pub use coordinator::*;
pub use drift::DriftStrategy;
pub use media::MediaPlayer;
pub use protocol::*;
pub use scheduler::{Scheduler, TimerKind};
