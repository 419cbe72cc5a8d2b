//! Runtime event handlers

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::runtime::{RuntimeEvent, RuntimeHandle};
use crate::sync::SyncEvent;

use super::types::{PlaybackState, SavedPosition, SessionCallback};

pub type SharedCallback = Arc<RwLock<Option<Arc<dyn SessionCallback>>>>;

/// Forward a runtime event to the UI callback
pub fn handle_runtime_event(event: RuntimeEvent, callback: &SharedCallback, runtime: &Arc<RwLock<Option<RuntimeHandle>>>) {
    // Take the callback out of the lock so UI code never runs under it
    let Some(cb) = callback.read().clone() else {
        debug!("No callback registered, dropping {:?}", event);
        return;
    };

    match event {
        RuntimeEvent::Joined {
            session_id,
            host,
            is_host,
            peers,
            ..
        } => {
            info!("Joined {} ({} peers)", session_id, peers.len());
            cb.on_joined(session_id, host, is_host, peers);
        }

        RuntimeEvent::PasswordRequired { message } => cb.on_password_required(message),

        RuntimeEvent::PeersChanged { peers } => cb.on_peers_changed(peers),

        RuntimeEvent::PeerConnected { peer_id } => cb.on_peer_connected(peer_id),

        RuntimeEvent::PeerDisconnected { peer_id } => cb.on_peer_disconnected(peer_id),

        RuntimeEvent::MediaChanged { media_id } => cb.on_media_changed(media_id),

        RuntimeEvent::Sync(event) => handle_sync_event(event, cb.as_ref()),

        RuntimeEvent::Error { message } => {
            warn!("Session error: {}", message);
            cb.on_error(message);
        }

        RuntimeEvent::Disconnected => {
            // The runtime has stopped; a new join is allowed
            runtime.write().take();
            cb.on_disconnected();
        }
    }
}

fn handle_sync_event(event: SyncEvent, cb: &dyn SessionCallback) {
    match event {
        SyncEvent::RoleChanged { is_host } => cb.on_role_changed(is_host),
        SyncEvent::Drift {
            drift,
            strategy,
            confidence,
        } => cb.on_drift(drift, strategy.into(), confidence),
        SyncEvent::StateApplied(state) => cb.on_state_applied(PlaybackState::from(state)),
        SyncEvent::CommandIssued(command) => cb.on_command_issued(command.version, PlaybackState::from(command.state)),
        SyncEvent::Buffering { active } => cb.on_buffering(active),
        SyncEvent::BufferTimeout => cb.on_buffer_timeout(),
        SyncEvent::BufferHealth(ratio) => cb.on_buffer_health(ratio),
        SyncEvent::ResumeAvailable(record) => cb.on_resume_available(SavedPosition::from(&record)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::types::DriftStrategy;
    use crate::sync::{Command, DriftStrategy as InternalDriftStrategy, PlaybackState as InternalPlaybackState};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl Recorder {
        fn push(&self, entry: String) {
            self.0.lock().push(entry);
        }
    }

    impl SessionCallback for Recorder {
        fn on_joined(&self, session_id: String, host_peer_id: String, is_host: bool, peers: Vec<String>) {
            self.push(format!("joined {session_id} {host_peer_id} {is_host} {}", peers.len()));
        }
        fn on_role_changed(&self, is_host: bool) {
            self.push(format!("role {is_host}"));
        }
        fn on_peers_changed(&self, peers: Vec<String>) {
            self.push(format!("peers {}", peers.join(",")));
        }
        fn on_peer_connected(&self, peer_id: String) {
            self.push(format!("connected {peer_id}"));
        }
        fn on_peer_disconnected(&self, peer_id: String) {
            self.push(format!("disconnected {peer_id}"));
        }
        fn on_drift(&self, drift: f64, strategy: DriftStrategy, _confidence: f64) {
            self.push(format!("drift {drift} {strategy:?}"));
        }
        fn on_state_applied(&self, state: PlaybackState) {
            self.push(format!("applied {} {}", state.playing, state.position));
        }
        fn on_command_issued(&self, version: u64, _state: PlaybackState) {
            self.push(format!("command {version}"));
        }
        fn on_buffering(&self, active: bool) {
            self.push(format!("buffering {active}"));
        }
        fn on_buffer_timeout(&self) {
            self.push("timeout".into());
        }
        fn on_buffer_health(&self, ratio: f64) {
            self.push(format!("health {ratio}"));
        }
        fn on_resume_available(&self, saved: SavedPosition) {
            self.push(format!("resume {}", saved.position));
        }
        fn on_password_required(&self, _message: String) {
            self.push("password".into());
        }
        fn on_media_changed(&self, media_id: String) {
            self.push(format!("media {media_id}"));
        }
        fn on_error(&self, message: String) {
            self.push(format!("error {message}"));
        }
        fn on_disconnected(&self) {
            self.push("gone".into());
        }
    }

    #[test]
    fn test_events_reach_callback() {
        let recorder = Arc::new(Recorder::default());
        let callback: SharedCallback = Arc::new(RwLock::new(Some(recorder.clone() as Arc<dyn SessionCallback>)));
        let runtime = Arc::new(RwLock::new(None));

        let events = vec![
            RuntimeEvent::Joined {
                session_id: "s".into(),
                host: "b".into(),
                is_host: false,
                peers: vec!["a".into(), "b".into()],
                media_id: None,
            },
            RuntimeEvent::Sync(SyncEvent::Drift {
                drift: -2.0,
                strategy: InternalDriftStrategy::ShowUi,
                confidence: 0.9,
            }),
            RuntimeEvent::Sync(SyncEvent::CommandIssued(Command {
                version: 4,
                state: InternalPlaybackState::default(),
            })),
            RuntimeEvent::PasswordRequired { message: "locked".into() },
            RuntimeEvent::Disconnected,
        ];
        for event in events {
            handle_runtime_event(event, &callback, &runtime);
        }

        assert_eq!(
            *recorder.0.lock(),
            vec![
                "joined s b false 2".to_string(),
                "drift -2 ShowUi".to_string(),
                "command 4".to_string(),
                "password".to_string(),
                "gone".to_string(),
            ]
        );
    }

    #[test]
    fn test_no_callback_is_fine() {
        let callback: SharedCallback = Arc::new(RwLock::new(None));
        let runtime = Arc::new(RwLock::new(None));
        handle_runtime_event(RuntimeEvent::Disconnected, &callback, &runtime);
    }
}
