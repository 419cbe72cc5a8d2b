//! Playback synchronization coordinator
//!
//! One coordinator per joined session. It owns the local media element while
//! correcting drift, runs the host or viewer loop depending on role, and applies
//! versioned commands. All entry points are called from a single dispatch loop,
//! so nothing in here needs locking.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::drift::{self, DriftStrategy, SoftConvergence};
use super::media::MediaPlayer;
use super::protocol::{Command, PeerMessage, PlaybackState, SyncSnapshot};
use super::scheduler::{Scheduler, TimerKind};
use crate::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::clock::{ClockOffsetEstimator, TimeSource};

/// Timing and thresholds for the sync loops
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub clock_probe_interval: Duration,
    pub snapshot_interval: Duration,
    pub drift_check_interval: Duration,
    pub buffer_health_interval: Duration,
    pub checkpoint_interval: Duration,
    pub ramp_step_interval: Duration,
    pub buffer_poll_interval: Duration,
    pub buffer_timeout: Duration,
    /// Seconds buffered ahead required before playback starts
    pub required_buffer_secs: f64,
    /// Buffered-ahead seconds that count as full health
    pub buffer_health_window_secs: f64,
    /// Below this estimator confidence, rate corrections are suppressed
    pub min_confidence: f64,
    /// Position error (seconds) that warrants a seek when applying state
    pub seek_tolerance_secs: f64,
    /// Drift (seconds) above which a play/pause mismatch is corrected immediately
    pub mismatch_escalation_secs: f64,
    pub resume_max_age: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            clock_probe_interval: Duration::from_secs(2),
            snapshot_interval: Duration::from_millis(500),
            drift_check_interval: Duration::from_millis(500),
            buffer_health_interval: Duration::from_millis(500),
            checkpoint_interval: Duration::from_secs(5),
            ramp_step_interval: Duration::from_millis(50),
            buffer_poll_interval: Duration::from_millis(100),
            buffer_timeout: Duration::from_secs(10),
            required_buffer_secs: 3.0,
            buffer_health_window_secs: 5.0,
            min_confidence: 0.5,
            seek_tolerance_secs: 0.5,
            mismatch_escalation_secs: 1.0,
            resume_max_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Viewer,
}

/// Notifications for the UI layer
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    RoleChanged { is_host: bool },
    /// Result of a drift evaluation; ShowUi/ForceResync mean the user should be offered a resync
    Drift {
        drift: f64,
        strategy: DriftStrategy,
        confidence: f64,
    },
    /// A command or escalation changed local playback
    StateApplied(PlaybackState),
    /// The host issued a command from local input
    CommandIssued(Command),
    Buffering { active: bool },
    BufferTimeout,
    BufferHealth(f64),
    ResumeAvailable(CheckpointRecord),
}

/// Where the coordinator's outbound traffic goes
pub trait SyncOutbound: Send + Sync {
    fn broadcast(&self, message: &PeerMessage);
    fn send_to(&self, peer_id: &str, message: &PeerMessage);
    /// Hand the host's current state to the registry for persistence
    fn publish_checkpoint(&self, record: &CheckpointRecord);
}

/// Injected collaborators
pub struct CoordinatorContext {
    pub session_id: String,
    pub local_peer_id: String,
    pub media: Box<dyn MediaPlayer>,
    pub clock: Arc<dyn TimeSource>,
    pub outbound: Arc<dyn SyncOutbound>,
    pub store: Arc<dyn CheckpointStore>,
    pub events: mpsc::UnboundedSender<SyncEvent>,
    pub ticks: mpsc::UnboundedSender<TimerKind>,
}

/// A play held back until enough media is buffered
#[derive(Debug, Clone, Copy)]
struct PlayGate {
    started_at_ms: u64,
    /// Broadcast a command once playback starts (host-initiated play)
    announce: bool,
}

pub struct PlaybackSyncCoordinator {
    config: SyncConfig,
    session_id: String,
    local_peer_id: String,
    role: Option<Role>,
    host_peer_id: Option<String>,
    media_id: Option<String>,
    sync_enabled: bool,

    media: Box<dyn MediaPlayer>,
    clock: Arc<dyn TimeSource>,
    outbound: Arc<dyn SyncOutbound>,
    store: Arc<dyn CheckpointStore>,
    events: mpsc::UnboundedSender<SyncEvent>,
    scheduler: Scheduler,
    estimator: ClockOffsetEstimator,

    /// Host: last issued. Viewer: last applied.
    version: u64,
    latest_snapshot: Option<SyncSnapshot>,
    last_drift: Option<f64>,
    convergence: SoftConvergence,
    play_gate: Option<PlayGate>,
    /// A gated play timed out; escalation waits for the next command or resync
    buffer_stalled: bool,
}

impl PlaybackSyncCoordinator {
    pub fn new(config: SyncConfig, ctx: CoordinatorContext) -> Self {
        Self {
            config,
            session_id: ctx.session_id,
            local_peer_id: ctx.local_peer_id,
            role: None,
            host_peer_id: None,
            media_id: None,
            sync_enabled: true,
            media: ctx.media,
            clock: ctx.clock,
            outbound: ctx.outbound,
            store: ctx.store,
            events: ctx.events,
            scheduler: Scheduler::new(ctx.ticks),
            estimator: ClockOffsetEstimator::new(),
            version: 0,
            latest_snapshot: None,
            last_drift: None,
            convergence: SoftConvergence::new(),
            play_gate: None,
            buffer_stalled: false,
        }
    }

    // === Accessors ===

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn is_host(&self) -> bool {
        self.role == Some(Role::Host)
    }

    pub fn host_peer_id(&self) -> Option<&str> {
        self.host_peer_id.as_deref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn last_drift(&self) -> Option<f64> {
        self.last_drift
    }

    pub fn estimator(&self) -> &ClockOffsetEstimator {
        &self.estimator
    }

    pub fn is_sync_enabled(&self) -> bool {
        self.sync_enabled
    }

    pub fn set_media_id(&mut self, media_id: Option<String>) {
        self.media_id = media_id;
    }

    /// Current local playback state, stamped with the host clock estimate
    pub fn local_state(&self) -> PlaybackState {
        PlaybackState {
            playing: self.media.is_playing(),
            position: self.media.position(),
            timestamp: self.estimated_host_time(),
        }
    }

    fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    fn estimated_host_time(&self) -> u64 {
        if self.is_host() {
            self.now()
        } else {
            self.estimator.estimated_remote_time(self.now())
        }
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    // === Role ===

    /// Switch role. Cancels the previous role's timers and starts the new loop.
    pub fn set_role(&mut self, is_host: bool, host_peer_id: &str) {
        let role = if is_host { Role::Host } else { Role::Viewer };
        let host_changed = self.host_peer_id.as_deref() != Some(host_peer_id);
        if self.role == Some(role) && !host_changed {
            return;
        }

        info!(
            "Session {}: {} is now {:?} (host {})",
            self.session_id, self.local_peer_id, role, host_peer_id
        );

        self.stop_role_loops();
        self.role = Some(role);
        self.host_peer_id = Some(host_peer_id.to_string());
        self.latest_snapshot = None;
        self.last_drift = None;

        match role {
            Role::Host => {
                self.estimator.reset();
                self.scheduler.start(TimerKind::Snapshot, self.config.snapshot_interval);
            }
            Role::Viewer => {
                self.estimator.set_reference(host_peer_id);
                self.scheduler.start(TimerKind::ClockProbe, self.config.clock_probe_interval);
                if self.sync_enabled {
                    self.scheduler.start(TimerKind::DriftCheck, self.config.drift_check_interval);
                }
                self.send_probe();
            }
        }

        self.scheduler.ensure(TimerKind::BufferHealth, self.config.buffer_health_interval);
        self.scheduler.ensure(TimerKind::Checkpoint, self.config.checkpoint_interval);

        self.emit(SyncEvent::RoleChanged { is_host });
    }

    fn stop_role_loops(&mut self) {
        for kind in [
            TimerKind::ClockProbe,
            TimerKind::Snapshot,
            TimerKind::DriftCheck,
        ] {
            self.scheduler.cancel(kind);
        }
        self.cancel_convergence();
        self.abandon_play_gate();
        self.buffer_stalled = false;
    }

    /// Stop everything. The coordinator is inert afterwards.
    pub fn teardown(&mut self) {
        debug!("Tearing down coordinator for session {}", self.session_id);
        self.write_checkpoint();
        self.cancel_convergence();
        self.abandon_play_gate();
        self.scheduler.cancel_all();
        self.role = None;
        self.latest_snapshot = None;
    }

    // === Timers ===

    pub fn on_tick(&mut self, kind: TimerKind) {
        if !self.scheduler.is_active(kind) {
            return;
        }
        match kind {
            TimerKind::ClockProbe => self.send_probe(),
            TimerKind::Snapshot => self.broadcast_snapshot(),
            TimerKind::DriftCheck => self.check_drift(),
            TimerKind::BufferHealth => self.update_buffer_health(),
            TimerKind::Checkpoint => self.write_checkpoint(),
            TimerKind::RateRamp => self.step_ramp(),
            TimerKind::BufferPoll => self.poll_play_gate(),
        }
    }

    /// Probe the host clock right away, e.g. once its channel opens
    pub fn send_probe(&self) {
        if self.role != Some(Role::Viewer) {
            return;
        }
        if let Some(host) = &self.host_peer_id {
            self.outbound
                .send_to(host, &PeerMessage::ClockPing { timestamp: self.now() });
        }
    }

    fn broadcast_snapshot(&self) {
        if !self.is_host() {
            return;
        }
        let state = self.local_state();
        self.outbound.broadcast(&PeerMessage::SyncSnapshot(SyncSnapshot {
            position: state.position,
            playing: state.playing,
            timestamp: state.timestamp,
            version: self.version,
        }));
    }

    fn update_buffer_health(&self) {
        let ratio = (self.media.buffered_ahead() / self.config.buffer_health_window_secs).clamp(0.0, 1.0);
        self.emit(SyncEvent::BufferHealth(ratio));
    }

    // === Inbound ===

    pub fn handle_peer_message(&mut self, from: &str, message: PeerMessage) {
        debug!("Received {} from {}", message.kind(), from);

        match message {
            PeerMessage::ClockPing { timestamp } => {
                let received = self.now();
                self.outbound.send_to(
                    from,
                    &PeerMessage::ClockPong {
                        client_send_time: timestamp,
                        server_receive_time: received,
                        server_send_time: self.now(),
                    },
                );
            }
            PeerMessage::ClockPong {
                client_send_time,
                server_receive_time,
                server_send_time,
            } => {
                if self.estimator.reference() == Some(from) {
                    let now = self.now();
                    self.estimator
                        .on_probe_reply(client_send_time, server_receive_time, server_send_time, now);
                } else {
                    debug!("Ignoring clock-pong from non-reference peer {}", from);
                }
            }
            PeerMessage::SyncSnapshot(snapshot) => self.handle_snapshot(from, snapshot),
            PeerMessage::Command(command) => {
                self.apply_command(command);
            }
            PeerMessage::RequestSync => {
                if self.is_host() {
                    info!("Resync requested by {}", from);
                    self.issue_command();
                }
            }
        }
    }

    fn handle_snapshot(&mut self, from: &str, snapshot: SyncSnapshot) {
        if self.role != Some(Role::Viewer) {
            return;
        }
        if self.host_peer_id.as_deref() != Some(from) {
            debug!("Ignoring snapshot from non-host {}", from);
            return;
        }
        if snapshot.version < self.version {
            debug!("Dropping stale snapshot v{} (applied v{})", snapshot.version, self.version);
            return;
        }

        self.latest_snapshot = Some(snapshot);
        if !self.sync_enabled {
            return;
        }

        let expected = drift::expected_position(&snapshot, self.estimated_host_time());
        let drift = self.media.position() - expected;
        self.last_drift = Some(drift);

        // A pending or timed-out gate already answered this mismatch
        let gate_settled = self.play_gate.is_none() && !self.buffer_stalled;
        if gate_settled
            && snapshot.playing != self.media.is_playing()
            && drift.abs() > self.config.mismatch_escalation_secs
        {
            info!(
                "Play state mismatch with drift {:.2}s, applying host state (playing={})",
                drift, snapshot.playing
            );
            self.version = self.version.max(snapshot.version);
            self.apply_state(PlaybackState {
                playing: snapshot.playing,
                position: expected,
                timestamp: snapshot.timestamp,
            });
        }
    }

    /// Apply a versioned command. Returns false if it was stale.
    pub fn apply_command(&mut self, command: Command) -> bool {
        if command.version <= self.version {
            debug!("Dropping stale command v{} (applied v{})", command.version, self.version);
            return false;
        }
        debug!("Applying command v{}: {:?}", command.version, command.state);
        self.version = command.version;
        self.buffer_stalled = false;
        self.apply_state(command.state);
        true
    }

    fn apply_state(&mut self, state: PlaybackState) {
        self.cancel_convergence();

        let was_playing = self.media.is_playing();
        match (was_playing, state.playing) {
            (true, false) => {
                self.abandon_play_gate();
                self.media.pause();
                self.correct_position(state.position);
            }
            (false, true) => {
                self.correct_position(state.position);
                self.gated_play(false);
            }
            _ => {
                if !state.playing {
                    self.abandon_play_gate();
                }
                self.correct_position(state.position);
            }
        }

        self.emit(SyncEvent::StateApplied(state));
    }

    fn correct_position(&mut self, target: f64) {
        let error = (self.media.position() - target).abs();
        if error > self.config.seek_tolerance_secs {
            debug!("Seeking {:.2}s -> {:.2}s", self.media.position(), target);
            self.media.seek(target);
        }
    }

    // === Drift ===

    fn check_drift(&mut self) {
        let Some(snapshot) = self.latest_snapshot else {
            return;
        };
        if !self.sync_enabled {
            return;
        }

        let now = self.now();
        let expected = drift::expected_position(&snapshot, self.estimated_host_time());
        let drift = self.media.position() - expected;
        let strategy = DriftStrategy::classify(drift);
        let confidence = self.estimator.confidence();
        self.last_drift = Some(drift);

        match strategy {
            DriftStrategy::SoftConvergence if confidence < self.config.min_confidence => {
                debug!(
                    "Drift {:.2}s but clock confidence {:.2} too low, not correcting",
                    drift, confidence
                );
                self.cancel_convergence();
            }
            DriftStrategy::SoftConvergence => {
                let rate = self.media.playback_rate();
                let started = if self.convergence.is_idle() {
                    self.convergence.engage(drift, rate, now)
                } else {
                    self.convergence.maybe_release(drift, rate, now)
                };
                if started {
                    debug!("Rate ramp started for drift {:.2}s", drift);
                    self.step_ramp();
                    if self.convergence.is_ramping() {
                        self.scheduler.start(TimerKind::RateRamp, self.config.ramp_step_interval);
                    }
                }
            }
            DriftStrategy::Locked | DriftStrategy::ShowUi | DriftStrategy::ForceResync => {
                self.cancel_convergence();
            }
        }

        self.emit(SyncEvent::Drift {
            drift,
            strategy,
            confidence,
        });
    }

    fn step_ramp(&mut self) {
        if let Some(rate) = self.convergence.step(self.now()) {
            self.media.set_playback_rate(rate);
        }
        if !self.convergence.is_ramping() {
            self.scheduler.cancel(TimerKind::RateRamp);
        }
    }

    fn cancel_convergence(&mut self) {
        self.scheduler.cancel(TimerKind::RateRamp);
        if self.convergence.cancel() {
            self.media.set_playback_rate(1.0);
        }
    }

    // === Buffer gate ===

    fn gated_play(&mut self, announce: bool) {
        // Keep the original deadline
        if let Some(gate) = self.play_gate.as_mut() {
            gate.announce |= announce;
            return;
        }
        if self.media.buffered_ahead() >= self.config.required_buffer_secs {
            self.start_playback(announce);
            return;
        }

        debug!(
            "Only {:.1}s buffered, holding play until {:.1}s",
            self.media.buffered_ahead(),
            self.config.required_buffer_secs
        );
        self.play_gate = Some(PlayGate {
            started_at_ms: self.now(),
            announce,
        });
        self.scheduler.start(TimerKind::BufferPoll, self.config.buffer_poll_interval);
        self.emit(SyncEvent::Buffering { active: true });
    }

    fn poll_play_gate(&mut self) {
        let Some(gate) = self.play_gate else {
            self.scheduler.cancel(TimerKind::BufferPoll);
            return;
        };

        if self.media.buffered_ahead() >= self.config.required_buffer_secs {
            self.play_gate = None;
            self.scheduler.cancel(TimerKind::BufferPoll);
            self.emit(SyncEvent::Buffering { active: false });
            self.start_playback(gate.announce);
        } else if self.now().saturating_sub(gate.started_at_ms) >= self.config.buffer_timeout.as_millis() as u64 {
            warn!(
                "Buffer gate timed out with {:.1}s buffered, staying paused",
                self.media.buffered_ahead()
            );
            self.play_gate = None;
            self.buffer_stalled = true;
            self.scheduler.cancel(TimerKind::BufferPoll);
            if self.media.is_playing() {
                self.media.pause();
            }
            self.emit(SyncEvent::BufferTimeout);
        }
    }

    fn abandon_play_gate(&mut self) {
        if self.play_gate.take().is_some() {
            self.scheduler.cancel(TimerKind::BufferPoll);
            self.emit(SyncEvent::Buffering { active: false });
        }
    }

    fn start_playback(&mut self, announce: bool) {
        self.media.play();
        if announce {
            self.issue_command();
        }
    }

    // === Local controls ===

    /// Local play. As host this is gated on buffering and then broadcast.
    pub fn local_play(&mut self) {
        self.cancel_convergence();
        self.buffer_stalled = false;
        if self.play_gate.is_some() {
            return;
        }
        if self.is_host() {
            self.gated_play(true);
        } else {
            self.media.play();
        }
    }

    pub fn local_pause(&mut self) {
        self.cancel_convergence();
        self.abandon_play_gate();
        self.media.pause();
        if self.is_host() {
            self.issue_command();
        }
    }

    pub fn local_seek(&mut self, position: f64) {
        self.cancel_convergence();
        self.media.seek(position.max(0.0));
        if self.is_host() {
            self.issue_command();
        }
    }

    /// Host: broadcast a fresh command. Viewer: ask the host for one.
    pub fn request_resync(&mut self) {
        self.buffer_stalled = false;
        if self.is_host() {
            self.issue_command();
        } else if let Some(host) = &self.host_peer_id {
            info!("Requesting resync from host {}", host);
            self.outbound.send_to(host, &PeerMessage::RequestSync);
        }
    }

    pub fn set_sync_enabled(&mut self, enabled: bool) {
        if enabled == self.sync_enabled {
            return;
        }
        self.sync_enabled = enabled;
        info!("Sync {}", if enabled { "enabled" } else { "disabled" });

        if enabled {
            if self.role == Some(Role::Viewer) {
                self.scheduler.start(TimerKind::DriftCheck, self.config.drift_check_interval);
            }
            self.request_resync();
        } else {
            self.scheduler.cancel(TimerKind::DriftCheck);
            self.cancel_convergence();
            self.last_drift = None;
        }
    }

    fn issue_command(&mut self) {
        self.version += 1;
        let command = Command {
            version: self.version,
            state: self.local_state(),
        };
        info!("Issuing command v{}: {:?}", command.version, command.state);
        self.outbound.broadcast(&PeerMessage::Command(command));
        self.outbound.publish_checkpoint(&self.checkpoint_record());
        self.emit(SyncEvent::CommandIssued(command));
    }

    // === Checkpoints ===

    fn checkpoint_record(&self) -> CheckpointRecord {
        CheckpointRecord {
            version: self.version,
            state: self.local_state(),
            media_id: self.media_id.clone(),
            saved_at: self.now(),
        }
    }

    fn write_checkpoint(&self) {
        if self.role.is_none() {
            return;
        }
        let record = self.checkpoint_record();
        if let Err(e) = self.store.put(&self.session_id, &record) {
            warn!("Failed to save checkpoint for {}: {}", self.session_id, e);
        }
        if self.is_host() {
            self.outbound.publish_checkpoint(&record);
        }
    }

    /// A resumable local checkpoint, if one younger than the max age exists.
    /// Older ones are discarded.
    pub fn saved_position(&self) -> Option<CheckpointRecord> {
        let record = match self.store.get(&self.session_id) {
            Ok(record) => record?,
            Err(e) => {
                warn!("Failed to read checkpoint for {}: {}", self.session_id, e);
                return None;
            }
        };

        if record.age_ms(self.now()) < self.config.resume_max_age.as_millis() as u64 {
            Some(record)
        } else {
            debug!("Discarding expired checkpoint for {}", self.session_id);
            self.clear_saved_position();
            None
        }
    }

    /// Emit a resume offer for a fresh checkpoint
    pub fn offer_resume(&self) -> Option<CheckpointRecord> {
        let record = self.saved_position()?;
        self.emit(SyncEvent::ResumeAvailable(record.clone()));
        Some(record)
    }

    pub fn clear_saved_position(&self) {
        if let Err(e) = self.store.remove(&self.session_id) {
            warn!("Failed to remove checkpoint for {}: {}", self.session_id, e);
        }
    }

    /// Seek to the saved position, if any
    pub fn resume_saved_position(&mut self) -> bool {
        match self.saved_position() {
            Some(record) => {
                self.local_seek(record.state.position);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::clock::ManualClock;
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct PlayerState {
        position: f64,
        playing: bool,
        rate: f64,
        buffered: f64,
        calls: Vec<String>,
    }

    #[derive(Clone, Default)]
    struct FakePlayer(Arc<Mutex<PlayerState>>);

    impl FakePlayer {
        fn new(position: f64, playing: bool) -> Self {
            let player = FakePlayer::default();
            {
                let mut s = player.0.lock();
                s.position = position;
                s.playing = playing;
                s.rate = 1.0;
                s.buffered = 10.0;
            }
            player
        }
    }

    impl MediaPlayer for FakePlayer {
        fn position(&self) -> f64 {
            self.0.lock().position
        }
        fn is_playing(&self) -> bool {
            self.0.lock().playing
        }
        fn playback_rate(&self) -> f64 {
            self.0.lock().rate
        }
        fn buffered_ahead(&self) -> f64 {
            self.0.lock().buffered
        }
        fn play(&mut self) {
            let mut s = self.0.lock();
            s.playing = true;
            s.calls.push("play".into());
        }
        fn pause(&mut self) {
            let mut s = self.0.lock();
            s.playing = false;
            s.calls.push("pause".into());
        }
        fn seek(&mut self, position: f64) {
            let mut s = self.0.lock();
            s.position = position;
            s.calls.push(format!("seek {position}"));
        }
        fn set_playback_rate(&mut self, rate: f64) {
            self.0.lock().rate = rate;
        }
    }

    #[derive(Default)]
    struct RecordingOutbound {
        broadcasts: Mutex<Vec<PeerMessage>>,
        direct: Mutex<Vec<(String, PeerMessage)>>,
        checkpoints: Mutex<Vec<CheckpointRecord>>,
    }

    impl SyncOutbound for RecordingOutbound {
        fn broadcast(&self, message: &PeerMessage) {
            self.broadcasts.lock().push(message.clone());
        }
        fn send_to(&self, peer_id: &str, message: &PeerMessage) {
            self.direct.lock().push((peer_id.to_string(), message.clone()));
        }
        fn publish_checkpoint(&self, record: &CheckpointRecord) {
            self.checkpoints.lock().push(record.clone());
        }
    }

    struct Harness {
        coordinator: PlaybackSyncCoordinator,
        player: FakePlayer,
        clock: Arc<ManualClock>,
        outbound: Arc<RecordingOutbound>,
        store: Arc<MemoryCheckpointStore>,
        events: mpsc::UnboundedReceiver<SyncEvent>,
        _ticks: mpsc::UnboundedReceiver<TimerKind>,
    }

    impl Harness {
        fn new(position: f64, playing: bool) -> Self {
            let player = FakePlayer::new(position, playing);
            let clock = Arc::new(ManualClock::new(1_000_000));
            let outbound = Arc::new(RecordingOutbound::default());
            let store = Arc::new(MemoryCheckpointStore::new());
            let (events_tx, events) = mpsc::unbounded_channel();
            let (ticks_tx, ticks) = mpsc::unbounded_channel();

            let coordinator = PlaybackSyncCoordinator::new(
                SyncConfig::default(),
                CoordinatorContext {
                    session_id: "room".into(),
                    local_peer_id: "viewer".into(),
                    media: Box::new(player.clone()),
                    clock: clock.clone(),
                    outbound: outbound.clone(),
                    store: store.clone(),
                    events: events_tx,
                    ticks: ticks_tx,
                },
            );

            Self {
                coordinator,
                player,
                clock,
                outbound,
                store,
                events,
                _ticks: ticks,
            }
        }

        fn drain_events(&mut self) -> Vec<SyncEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        /// Give the estimator `n` samples with zero offset and RTTs alternating 40/60ms
        fn calibrate(&mut self, n: usize) {
            let rtts: Vec<u64> = (0..n).map(|i| if i % 2 == 0 { 40 } else { 60 }).collect();
            self.clock_replies(&rtts);
        }

        /// Feed zero-offset clock-pongs with the given RTTs
        fn clock_replies(&mut self, rtts: &[u64]) {
            for &rtt in rtts {
                let send = self.clock.now_ms();
                let remote = send + rtt / 2;
                self.clock.advance(rtt);
                self.coordinator.handle_peer_message(
                    "host",
                    PeerMessage::ClockPong {
                        client_send_time: send,
                        server_receive_time: remote,
                        server_send_time: remote,
                    },
                );
            }
        }

        fn snapshot(&mut self, position: f64, playing: bool, version: u64) {
            let snapshot = SyncSnapshot {
                position,
                playing,
                timestamp: self.clock.now_ms(),
                version,
            };
            self.coordinator
                .handle_peer_message("host", PeerMessage::SyncSnapshot(snapshot));
        }
    }

    fn command(version: u64, playing: bool, position: f64) -> Command {
        Command {
            version,
            state: PlaybackState {
                playing,
                position,
                timestamp: 0,
            },
        }
    }

    #[tokio::test]
    async fn test_commands_converge_to_highest_version() {
        let orders: [[u64; 4]; 3] = [[1, 2, 3, 4], [4, 3, 2, 1], [2, 4, 1, 3]];
        for order in orders {
            let mut h = Harness::new(0.0, false);
            h.coordinator.set_role(false, "host");
            for v in order {
                h.coordinator
                    .apply_command(command(v, v % 2 == 0, v as f64 * 10.0));
            }
            assert_eq!(h.coordinator.version(), 4);
            assert_eq!(h.player.position(), 40.0);
            assert!(h.player.is_playing());
        }
    }

    #[tokio::test]
    async fn test_stale_command_is_noop() {
        let mut h = Harness::new(0.0, false);
        h.coordinator.set_role(false, "host");

        assert!(h.coordinator.apply_command(command(5, false, 30.0)));
        let calls_before = h.player.0.lock().calls.len();

        assert!(!h.coordinator.apply_command(command(5, true, 90.0)));
        assert!(!h.coordinator.apply_command(command(2, true, 90.0)));
        assert_eq!(h.player.0.lock().calls.len(), calls_before);
        assert_eq!(h.player.position(), 30.0);
    }

    #[tokio::test]
    async fn test_pause_before_seek_when_stopping() {
        let mut h = Harness::new(10.0, true);
        h.coordinator.set_role(false, "host");

        h.coordinator.apply_command(command(1, false, 20.0));
        assert_eq!(h.player.0.lock().calls, vec!["pause", "seek 20"]);
    }

    #[tokio::test]
    async fn test_seek_before_play_when_starting() {
        let mut h = Harness::new(10.0, false);
        h.coordinator.set_role(false, "host");

        h.coordinator.apply_command(command(1, true, 20.0));
        assert_eq!(h.player.0.lock().calls, vec!["seek 20", "play"]);
    }

    #[tokio::test]
    async fn test_small_position_error_not_corrected() {
        let mut h = Harness::new(10.0, true);
        h.coordinator.set_role(false, "host");

        h.coordinator.apply_command(command(1, true, 10.4));
        assert!(h.player.0.lock().calls.is_empty());
    }

    #[tokio::test]
    async fn test_drift_show_ui_end_to_end() {
        let mut h = Harness::new(99.0, true);
        h.coordinator.set_role(false, "host");
        h.calibrate(10);
        assert!((h.coordinator.estimator().confidence() - 0.9).abs() < 1e-9);

        h.snapshot(100.0, true, 0);
        h.clock.advance(1_000);
        h.drain_events();

        h.coordinator.on_tick(TimerKind::DriftCheck);
        let events = h.drain_events();
        let drift_event = events
            .iter()
            .find_map(|e| match e {
                SyncEvent::Drift { drift, strategy, .. } => Some((*drift, *strategy)),
                _ => None,
            })
            .unwrap();

        assert!((drift_event.0 + 2.0).abs() < 1e-9);
        assert_eq!(drift_event.1, DriftStrategy::ShowUi);
        // No automatic seek
        assert!(!h.player.0.lock().calls.iter().any(|c| c.starts_with("seek")));
    }

    #[tokio::test]
    async fn test_soft_convergence_engages_with_confidence() {
        let mut h = Harness::new(100.8, true);
        h.coordinator.set_role(false, "host");
        h.calibrate(10);

        h.snapshot(100.0, true, 0);
        h.coordinator.on_tick(TimerKind::DriftCheck);

        // Ahead of the host, so slow down once the ramp completes
        h.clock.advance(500);
        h.coordinator.on_tick(TimerKind::RateRamp);
        let rate = h.player.playback_rate();
        assert!((rate - 0.97).abs() < 1e-9);
        assert!((rate - 1.0).abs() <= 0.03 + 1e-12);

        // Back in lock restores the normal rate
        let caught_up = h.player.position() - 0.8;
        h.player.0.lock().position = caught_up;
        h.snapshot(caught_up, true, 0);
        h.coordinator.on_tick(TimerKind::DriftCheck);
        assert_eq!(h.player.playback_rate(), 1.0);
    }

    #[tokio::test]
    async fn test_engaged_ramp_released_when_confidence_drops() {
        let mut h = Harness::new(100.8, true);
        h.coordinator.set_role(false, "host");
        h.calibrate(10);

        h.snapshot(100.0, true, 0);
        h.coordinator.on_tick(TimerKind::DriftCheck);
        h.clock.advance(500);
        h.coordinator.on_tick(TimerKind::RateRamp);
        assert!((h.player.playback_rate() - 0.97).abs() < 1e-9);

        // Wildly varying RTTs: offset unchanged, confidence gone
        h.clock_replies(&[0, 400, 0, 400, 0, 400, 0, 400, 0, 400]);
        assert!(h.coordinator.estimator().confidence() < 0.5);

        h.snapshot(100.0, true, 0);
        h.coordinator.on_tick(TimerKind::DriftCheck);
        assert_eq!(h.player.playback_rate(), 1.0);
    }

    #[tokio::test]
    async fn test_soft_convergence_suppressed_without_confidence() {
        let mut h = Harness::new(100.8, true);
        h.coordinator.set_role(false, "host");
        h.calibrate(3);

        h.snapshot(100.0, true, 0);
        h.coordinator.on_tick(TimerKind::DriftCheck);
        h.clock.advance(500);
        h.coordinator.on_tick(TimerKind::RateRamp);

        assert_eq!(h.player.playback_rate(), 1.0);
    }

    #[tokio::test]
    async fn test_state_mismatch_escalates() {
        let mut h = Harness::new(50.0, false);
        h.coordinator.set_role(false, "host");

        h.snapshot(52.0, true, 3);
        let calls = h.player.0.lock().calls.clone();
        assert_eq!(calls, vec!["seek 52", "play"]);
        assert_eq!(h.coordinator.version(), 3);

        // Small mismatch is left to the periodic loop
        let mut h = Harness::new(50.0, false);
        h.coordinator.set_role(false, "host");
        h.snapshot(50.5, true, 1);
        assert!(h.player.0.lock().calls.is_empty());
    }

    #[tokio::test]
    async fn test_stale_snapshot_dropped() {
        let mut h = Harness::new(50.0, false);
        h.coordinator.set_role(false, "host");
        h.coordinator.apply_command(command(4, false, 50.0));

        h.snapshot(80.0, true, 2);
        assert!(!h.player.is_playing());
        assert_eq!(h.player.position(), 50.0);
    }

    #[tokio::test]
    async fn test_buffer_gate_succeeds() {
        let mut h = Harness::new(0.0, false);
        h.coordinator.set_role(true, "viewer");
        h.player.0.lock().buffered = 1.0;

        h.coordinator.local_play();
        assert!(!h.player.is_playing());
        assert!(h.drain_events().contains(&SyncEvent::Buffering { active: true }));

        for step in 1..=20 {
            h.clock.advance(100);
            // Buffer grows 1s -> 3.5s over two seconds
            h.player.0.lock().buffered = 1.0 + 2.5 * step as f64 / 20.0;
            h.coordinator.on_tick(TimerKind::BufferPoll);
        }

        assert!(h.player.is_playing());
        let issued = h
            .outbound
            .broadcasts
            .lock()
            .iter()
            .any(|m| matches!(m, PeerMessage::Command(c) if c.state.playing));
        assert!(issued);
        assert!(!h.drain_events().contains(&SyncEvent::BufferTimeout));
    }

    #[tokio::test]
    async fn test_buffer_gate_times_out() {
        let mut h = Harness::new(0.0, false);
        h.coordinator.set_role(true, "viewer");
        h.player.0.lock().buffered = 2.0;

        h.coordinator.local_play();
        for _ in 0..100 {
            h.clock.advance(100);
            h.coordinator.on_tick(TimerKind::BufferPoll);
        }

        assert!(!h.player.is_playing());
        assert!(h.drain_events().contains(&SyncEvent::BufferTimeout));
        assert!(h.outbound.broadcasts.lock().iter().all(|m| !matches!(m, PeerMessage::Command(_))));

        // Later polls are ignored
        h.clock.advance(100);
        h.coordinator.on_tick(TimerKind::BufferPoll);
        assert!(!h.player.is_playing());
    }

    #[tokio::test]
    async fn test_viewer_buffer_gate_not_rearmed_by_snapshots() {
        let mut h = Harness::new(0.0, false);
        h.coordinator.set_role(false, "host");
        h.player.0.lock().buffered = 1.0;
        h.coordinator.apply_command(command(1, true, 50.0));
        h.drain_events();

        // 30s of a stuck buffer while the host keeps playing
        for step in 1..=60 {
            for _ in 0..5 {
                h.clock.advance(100);
                h.coordinator.on_tick(TimerKind::BufferPoll);
            }
            h.snapshot(50.0 + 0.5 * step as f64, true, 1);
        }

        let events = h.drain_events();
        let timeouts = events.iter().filter(|e| **e == SyncEvent::BufferTimeout).count();
        let gate_starts = events
            .iter()
            .filter(|e| **e == SyncEvent::Buffering { active: true })
            .count();
        let seeks = h.player.0.lock().calls.iter().filter(|c| c.starts_with("seek")).count();
        assert_eq!(timeouts, 1);
        assert_eq!(gate_starts, 0);
        assert_eq!(seeks, 1);
        assert!(!h.player.is_playing());

        // The next command is honoured again
        h.player.0.lock().buffered = 5.0;
        assert!(h.coordinator.apply_command(command(2, true, 80.0)));
        assert!(h.player.is_playing());
        assert_eq!(h.player.position(), 80.0);
    }

    #[tokio::test]
    async fn test_host_commands_increment_version() {
        let mut h = Harness::new(10.0, true);
        h.coordinator.set_role(true, "viewer");

        h.coordinator.local_pause();
        h.coordinator.local_seek(42.0);
        h.coordinator.request_resync();

        let versions: Vec<u64> = h
            .outbound
            .broadcasts
            .lock()
            .iter()
            .filter_map(|m| match m {
                PeerMessage::Command(c) => Some(c.version),
                _ => None,
            })
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(h.outbound.checkpoints.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_responds_to_clock_ping() {
        let mut h = Harness::new(0.0, false);
        h.coordinator.set_role(true, "viewer");
        h.coordinator
            .handle_peer_message("viewer-2", PeerMessage::ClockPing { timestamp: 5 });

        let direct = h.outbound.direct.lock();
        assert_eq!(direct.len(), 1);
        assert_eq!(direct[0].0, "viewer-2");
        assert!(matches!(
            direct[0].1,
            PeerMessage::ClockPong { client_send_time: 5, server_receive_time: 1_000_000, .. }
        ));
    }

    #[tokio::test]
    async fn test_viewer_requests_sync_from_host() {
        let mut h = Harness::new(0.0, false);
        h.coordinator.set_role(false, "host");
        h.coordinator.set_sync_enabled(false);
        h.coordinator.set_sync_enabled(true);

        let direct = h.outbound.direct.lock();
        assert!(direct
            .iter()
            .any(|(peer, m)| peer == "host" && *m == PeerMessage::RequestSync));
    }

    #[tokio::test]
    async fn test_role_switch_resets_estimator() {
        let mut h = Harness::new(0.0, false);
        h.coordinator.set_role(false, "host");
        h.calibrate(5);
        assert_eq!(h.coordinator.estimator().sample_count(), 5);

        h.coordinator.set_role(false, "host-2");
        assert_eq!(h.coordinator.estimator().sample_count(), 0);
        assert_eq!(h.coordinator.estimator().reference(), Some("host-2"));

        h.coordinator.set_role(true, "viewer");
        assert!(h.coordinator.is_host());
        assert!(h.drain_events().contains(&SyncEvent::RoleChanged { is_host: true }));
    }

    #[tokio::test]
    async fn test_checkpoint_resume_window() {
        let mut h = Harness::new(321.0, false);
        h.coordinator.set_role(false, "host");
        h.coordinator.on_tick(TimerKind::Checkpoint);

        let saved = h.coordinator.saved_position().unwrap();
        assert_eq!(saved.state.position, 321.0);

        h.clock.advance(23 * 60 * 60 * 1000);
        assert!(h.coordinator.offer_resume().is_some());

        h.clock.advance(2 * 60 * 60 * 1000);
        assert!(h.coordinator.saved_position().is_none());
        // Expired checkpoints are discarded
        assert!(h.store.get("room").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_buffer_health_ratio() {
        let mut h = Harness::new(0.0, false);
        h.coordinator.set_role(false, "host");
        h.drain_events();

        h.player.0.lock().buffered = 2.5;
        h.coordinator.on_tick(TimerKind::BufferHealth);
        h.player.0.lock().buffered = 30.0;
        h.coordinator.on_tick(TimerKind::BufferHealth);

        let ratios: Vec<f64> = h
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                SyncEvent::BufferHealth(r) => Some(r),
                _ => None,
            })
            .collect();
        assert_eq!(ratios, vec![0.5, 1.0]);
    }

    #[tokio::test]
    async fn test_ticks_ignored_after_teardown() {
        let mut h = Harness::new(0.0, false);
        h.coordinator.set_role(true, "viewer");
        h.coordinator.teardown();
        h.outbound.broadcasts.lock().clear();

        h.coordinator.on_tick(TimerKind::Snapshot);
        assert!(h.outbound.broadcasts.lock().is_empty());
    }
}
