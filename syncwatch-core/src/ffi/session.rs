//! Session implementation for FFI

use std::sync::{Arc, Once};

use parking_lot::RwLock;
use tokio::runtime::Runtime;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::checkpoint::FileCheckpointStore;
use crate::clock::SystemClock;
use crate::network::NetworkConfig;
use crate::runtime::{JoinRequest, PeerRuntime, RuntimeHandle};
use crate::sync::{MediaPlayer, SyncConfig};

use super::handlers::{handle_runtime_event, SharedCallback};
use super::types::*;

static TRACING_INIT: Once = Once::new();

const DEFAULT_LOG_FILTER: &str = "syncwatch_core=debug,webrtc=warn,webrtc_ice=warn,webrtc_sctp=warn,webrtc_dtls=warn";

/// Main session interface
#[derive(uniffi::Object)]
pub struct Session {
    runtime: Runtime,
    store: Arc<FileCheckpointStore>,
    callback: SharedCallback,
    handle: Arc<RwLock<Option<RuntimeHandle>>>,
}

#[uniffi::export]
impl Session {
    /// Create a new session; local checkpoints are kept under `checkpoint_dir`
    #[uniffi::constructor]
    pub fn new(checkpoint_dir: String) -> Result<Arc<Self>, CoreError> {
        // Initialize tracing once
        TRACING_INIT.call_once(|| {
            let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
            let _ = tracing_subscriber::fmt()
                .with_ansi(false) // Disable colors for IDE consoles
                .with_target(false)
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init();
        });

        info!("Initializing syncwatch session");

        let runtime = Runtime::new().map_err(|e| CoreError::NetworkError(format!("Failed to create runtime: {}", e)))?;
        std::fs::create_dir_all(&checkpoint_dir).map_err(|e| CoreError::StorageError(e.to_string()))?;

        Ok(Arc::new(Self {
            runtime,
            store: Arc::new(FileCheckpointStore::new(checkpoint_dir)),
            callback: Arc::new(RwLock::new(None)),
            handle: Arc::new(RwLock::new(None)),
        }))
    }

    /// Set the event callback
    pub fn set_callback(&self, callback: Box<dyn SessionCallback>) {
        *self.callback.write() = Some(Arc::from(callback));
    }

    /// Join (or create) a session. An empty peer id gets a random one.
    pub fn join(
        &self,
        server_url: String,
        session_id: String,
        peer_id: String,
        password: Option<String>,
        media_id: Option<String>,
        player: Box<dyn MediaBackend>,
    ) -> Result<String, CoreError> {
        if self.handle.read().is_some() {
            return Err(CoreError::AlreadyInSession);
        }

        let peer_id = if peer_id.is_empty() { random_peer_id() } else { peer_id };
        let join = JoinRequest {
            session_id: session_id.clone(),
            peer_id: peer_id.clone(),
            password,
            media_id,
        };
        let peer_runtime = PeerRuntime::new(
            NetworkConfig::default().with_signaling_url(server_url),
            SyncConfig::default(),
            self.store.clone(),
            Arc::new(SystemClock),
        );
        let media = Box::new(ForeignPlayer(Arc::from(player)));

        let (handle, mut event_rx) = self
            .runtime
            .block_on(peer_runtime.start(join, media))
            .map_err(|e| CoreError::NetworkError(e.to_string()))?;
        *self.handle.write() = Some(handle);

        // Spawn event handler task
        let callback = Arc::clone(&self.callback);
        let handle_slot = Arc::clone(&self.handle);
        self.runtime.spawn(async move {
            while let Some(event) = event_rx.recv().await {
                handle_runtime_event(event, &callback, &handle_slot);
            }
        });

        info!("Joining session {} as {}", session_id, peer_id);
        Ok(peer_id)
    }

    /// Resend the join with a password after a password-required rejection
    pub fn retry_join(&self, password: Option<String>) -> Result<(), CoreError> {
        self.with_handle(|h| h.rejoin(password))
    }

    /// Leave the current session
    pub fn leave(&self) -> Result<(), CoreError> {
        let handle = self.handle.write().take().ok_or(CoreError::NotInSession)?;
        handle.shutdown();

        if let Some(cb) = self.callback.read().clone() {
            cb.on_disconnected();
        }
        info!("Left session");
        Ok(())
    }

    pub fn play(&self) -> Result<(), CoreError> {
        self.with_handle(|h| h.play())
    }

    pub fn pause(&self) -> Result<(), CoreError> {
        self.with_handle(|h| h.pause())
    }

    /// Seek to `position` seconds
    pub fn seek(&self, position: f64) -> Result<(), CoreError> {
        self.with_handle(|h| h.seek(position))
    }

    pub fn request_resync(&self) -> Result<(), CoreError> {
        self.with_handle(|h| h.request_resync())
    }

    pub fn set_sync_enabled(&self, enabled: bool) -> Result<(), CoreError> {
        self.with_handle(|h| h.set_sync_enabled(enabled))
    }

    /// Host only: announce different media to the session
    pub fn change_media(&self, media_id: String) -> Result<(), CoreError> {
        self.with_handle(|h| h.change_media(&media_id))
    }

    /// Saved position for the current session, if younger than a day
    pub fn saved_position(&self) -> Result<Option<SavedPosition>, CoreError> {
        let handle = self.current_handle()?;
        let record = self
            .runtime
            .block_on(handle.saved_position())
            .map_err(|e| CoreError::NetworkError(e.to_string()))?;
        Ok(record.as_ref().map(SavedPosition::from))
    }

    pub fn clear_saved_position(&self) -> Result<(), CoreError> {
        self.with_handle(|h| h.clear_saved_position())
    }

    /// Seek to the saved position. Returns false if there was none.
    pub fn resume_saved_position(&self) -> Result<bool, CoreError> {
        let handle = self.current_handle()?;
        self.runtime
            .block_on(handle.resume_saved_position())
            .map_err(|e| CoreError::NetworkError(e.to_string()))
    }

    /// Check if we are the host
    pub fn is_host(&self) -> bool {
        self.handle.read().as_ref().map(|h| h.is_host()).unwrap_or(false)
    }

    pub fn is_in_session(&self) -> bool {
        self.handle.read().as_ref().map(|h| h.status().joined).unwrap_or(false)
    }

    /// Current sync status (for debug display)
    pub fn sync_status(&self) -> Option<SyncStatus> {
        self.handle.read().as_ref().map(|h| SyncStatus::from(h.status()))
    }
}

impl Session {
    fn current_handle(&self) -> Result<RuntimeHandle, CoreError> {
        self.handle.read().clone().ok_or(CoreError::NotInSession)
    }

    fn with_handle<F>(&self, f: F) -> Result<(), CoreError>
    where
        F: FnOnce(&RuntimeHandle) -> Result<(), crate::network::NetworkError>,
    {
        let handle = self.current_handle()?;
        f(&handle).map_err(|e| {
            warn!("Session command failed: {}", e);
            CoreError::NetworkError(e.to_string())
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.write().take() {
            handle.shutdown();
        }
    }
}

fn random_peer_id() -> String {
    format!("peer-{:08x}", rand::random::<u32>())
}

/// Media element implemented on the foreign side
struct ForeignPlayer(Arc<dyn MediaBackend>);

impl MediaPlayer for ForeignPlayer {
    fn position(&self) -> f64 {
        self.0.position()
    }

    fn is_playing(&self) -> bool {
        self.0.is_playing()
    }

    fn playback_rate(&self) -> f64 {
        self.0.playback_rate()
    }

    fn buffered_ahead(&self) -> f64 {
        self.0.buffered_ahead()
    }

    fn play(&mut self) {
        self.0.play()
    }

    fn pause(&mut self) {
        self.0.pause()
    }

    fn seek(&mut self, position: f64) {
        self.0.seek(position)
    }

    fn set_playback_rate(&mut self, rate: f64) {
        self.0.set_playback_rate(rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_peer_ids() {
        let a = random_peer_id();
        assert!(a.starts_with("peer-"));
        assert_eq!(a.len(), "peer-".len() + 8);
    }

    #[test]
    fn test_commands_need_a_session() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(dir.path().to_string_lossy().into_owned()).unwrap();

        assert!(!session.is_host());
        assert!(!session.is_in_session());
        assert!(session.sync_status().is_none());
        assert!(matches!(session.play(), Err(CoreError::NotInSession)));
        assert!(matches!(session.leave(), Err(CoreError::NotInSession)));
        assert!(matches!(session.saved_position(), Err(CoreError::NotInSession)));
    }
}
