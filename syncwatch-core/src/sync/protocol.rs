//! Sync Protocol Messages
//!
//! Everything exchanged over the peer data channels. Messages are JSON objects
//! discriminated by a kebab-case `type` field with camelCase payload fields.

use serde::{Deserialize, Serialize};

/// Playback state at an instant
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlaybackState {
    /// Whether media is playing
    pub playing: bool,
    /// Media position in seconds
    pub position: f64,
    /// Host-clock epoch milliseconds when this state was captured
    pub timestamp: u64,
}

impl PlaybackState {
    pub fn paused_at(position: f64, timestamp: u64) -> Self {
        Self {
            playing: false,
            position,
            timestamp,
        }
    }
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self::paused_at(0.0, 0)
    }
}

/// Periodic host broadcast of the authoritative playback state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub position: f64,
    pub playing: bool,
    pub timestamp: u64,
    pub version: u64,
}

impl SyncSnapshot {
    pub fn state(&self) -> PlaybackState {
        PlaybackState {
            playing: self.playing,
            position: self.position,
            timestamp: self.timestamp,
        }
    }
}

/// Versioned state change issued by the host
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub version: u64,
    pub state: PlaybackState,
}

/// Messages exchanged between peers over data channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PeerMessage {
    // === Clock Synchronization ===
    /// Probe sent to the reference peer
    ClockPing { timestamp: u64 },

    /// Reply carrying the responder's receive and send times
    #[serde(rename_all = "camelCase")]
    ClockPong {
        client_send_time: u64,
        server_receive_time: u64,
        server_send_time: u64,
    },

    // === Playback (from host) ===
    /// Periodic authoritative state
    SyncSnapshot(SyncSnapshot),

    /// Discrete play/pause/seek
    Command(Command),

    // === From viewers ===
    /// Ask the host to re-emit its current state as a fresh command
    RequestSync,
}

impl PeerMessage {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::ClockPing { .. } => "clock-ping",
            PeerMessage::ClockPong { .. } => "clock-pong",
            PeerMessage::SyncSnapshot(_) => "sync-snapshot",
            PeerMessage::Command(_) => "command",
            PeerMessage::RequestSync => "request-sync",
        }
    }

    /// Check if this message carries host authority
    pub fn is_from_host_only(&self) -> bool {
        matches!(self, PeerMessage::SyncSnapshot(_) | PeerMessage::Command(_))
    }
}
