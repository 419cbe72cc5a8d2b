//! FFI types exposed via uniffi

use crate::checkpoint::CheckpointRecord;
use crate::runtime::RuntimeStatus;
use crate::sync::{DriftStrategy as InternalDriftStrategy, PlaybackState as InternalPlaybackState};

/// Error types exposed via FFI
#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum CoreError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Not in a session")]
    NotInSession,

    #[error("Already in a session")]
    AlreadyInSession,
}

/// Playback state exposed via FFI
#[derive(Debug, Clone, uniffi::Record)]
pub struct PlaybackState {
    pub playing: bool,
    /// Seconds into the media
    pub position: f64,
    /// Host-clock milliseconds at which the state was sampled
    pub timestamp_ms: u64,
}

impl From<InternalPlaybackState> for PlaybackState {
    fn from(s: InternalPlaybackState) -> Self {
        Self {
            playing: s.playing,
            position: s.position,
            timestamp_ms: s.timestamp,
        }
    }
}

/// How a viewer is reacting to its drift
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum DriftStrategy {
    Locked,
    SoftConvergence,
    /// Out of sync enough that the user should be offered a resync
    ShowUi,
    ForceResync,
}

impl From<InternalDriftStrategy> for DriftStrategy {
    fn from(s: InternalDriftStrategy) -> Self {
        match s {
            InternalDriftStrategy::Locked => DriftStrategy::Locked,
            InternalDriftStrategy::SoftConvergence => DriftStrategy::SoftConvergence,
            InternalDriftStrategy::ShowUi => DriftStrategy::ShowUi,
            InternalDriftStrategy::ForceResync => DriftStrategy::ForceResync,
        }
    }
}

/// A locally saved position that can be resumed
#[derive(Debug, Clone, uniffi::Record)]
pub struct SavedPosition {
    pub position: f64,
    pub media_id: Option<String>,
    pub saved_at_ms: u64,
}

impl From<&CheckpointRecord> for SavedPosition {
    fn from(r: &CheckpointRecord) -> Self {
        Self {
            position: r.state.position,
            media_id: r.media_id.clone(),
            saved_at_ms: r.saved_at,
        }
    }
}

/// Sync status for debug display
#[derive(Debug, Clone, uniffi::Record)]
pub struct SyncStatus {
    pub is_host: bool,
    pub host_peer_id: Option<String>,
    pub peers: Vec<String>,
    /// Last applied (viewer) or issued (host) command version
    pub version: u64,
    /// Seconds; positive = ahead of host
    pub drift: Option<f64>,
    /// Clock estimate reliability, 0..1
    pub confidence: f64,
    pub sync_enabled: bool,
}

impl From<RuntimeStatus> for SyncStatus {
    fn from(s: RuntimeStatus) -> Self {
        Self {
            is_host: s.is_host,
            host_peer_id: s.host,
            peers: s.peers,
            version: s.version,
            drift: s.last_drift,
            confidence: s.confidence,
            sync_enabled: s.sync_enabled,
        }
    }
}

/// The native media element the session drives
#[uniffi::export(callback_interface)]
pub trait MediaBackend: Send + Sync {
    fn position(&self) -> f64;
    fn is_playing(&self) -> bool;
    fn playback_rate(&self) -> f64;
    /// Seconds buffered ahead of the playhead
    fn buffered_ahead(&self) -> f64;
    fn play(&self);
    fn pause(&self);
    fn seek(&self, position: f64);
    fn set_playback_rate(&self, rate: f64);
}

/// Callback interface for session events
#[uniffi::export(callback_interface)]
pub trait SessionCallback: Send + Sync {
    fn on_joined(&self, session_id: String, host_peer_id: String, is_host: bool, peers: Vec<String>);
    fn on_role_changed(&self, is_host: bool);
    fn on_peers_changed(&self, peers: Vec<String>);
    fn on_peer_connected(&self, peer_id: String);
    fn on_peer_disconnected(&self, peer_id: String);
    /// Called on every drift check (viewers only)
    fn on_drift(&self, drift: f64, strategy: DriftStrategy, confidence: f64);
    fn on_state_applied(&self, state: PlaybackState);
    fn on_command_issued(&self, version: u64, state: PlaybackState);
    fn on_buffering(&self, active: bool);
    fn on_buffer_timeout(&self);
    fn on_buffer_health(&self, ratio: f64);
    fn on_resume_available(&self, saved: SavedPosition);
    fn on_password_required(&self, message: String);
    fn on_media_changed(&self, media_id: String);
    fn on_error(&self, message: String);
    fn on_disconnected(&self);
}
