//! Per-peer runtime
//!
//! Connects to the registry, builds the mesh, and drives the coordinator from a
//! single dispatch loop. Everything that touches the coordinator happens on
//! that loop: signaling events, data-channel messages, timer ticks and local
//! controls.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::clock::TimeSource;
use crate::network::{
    NetworkConfig, NetworkError, SignalMessage, SignalingClient, SignalingEvent, SignalingHandle, TopologyEvent,
    TopologyHandle, TopologyManager, PASSWORD_REQUIRED,
};
use crate::sync::{
    Command, CoordinatorContext, MediaPlayer, PeerMessage, PlaybackSyncCoordinator, SyncConfig, SyncEvent,
    SyncOutbound, TimerKind,
};

/// What to join
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub session_id: String,
    pub peer_id: String,
    pub password: Option<String>,
    pub media_id: Option<String>,
}

/// Events for the embedding application
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    /// Admitted to the session
    Joined {
        session_id: String,
        host: String,
        is_host: bool,
        peers: Vec<String>,
        media_id: Option<String>,
    },
    /// The registry wants a (different) password
    PasswordRequired { message: String },
    PeersChanged { peers: Vec<String> },
    PeerConnected { peer_id: String },
    PeerDisconnected { peer_id: String },
    MediaChanged { media_id: String },
    Sync(SyncEvent),
    Error { message: String },
    /// Signaling connection lost; the runtime has stopped
    Disconnected,
}

/// Snapshot of runtime state readable without going through the loop
#[derive(Debug, Clone, Default)]
pub struct RuntimeStatus {
    pub joined: bool,
    pub is_host: bool,
    pub host: Option<String>,
    pub peers: Vec<String>,
    pub version: u64,
    pub last_drift: Option<f64>,
    pub confidence: f64,
    pub sync_enabled: bool,
}

enum Control {
    Play,
    Pause,
    Seek(f64),
    RequestResync,
    SetSyncEnabled(bool),
    ChangeMedia(String),
    SavedPosition(oneshot::Sender<Option<CheckpointRecord>>),
    ResumeSaved(oneshot::Sender<bool>),
    ClearSaved,
    Rejoin { password: Option<String> },
    Shutdown,
}

/// Handle to a running peer runtime
#[derive(Clone)]
pub struct RuntimeHandle {
    control_tx: mpsc::UnboundedSender<Control>,
    status: Arc<RwLock<RuntimeStatus>>,
}

impl RuntimeHandle {
    fn send(&self, control: Control) -> Result<(), NetworkError> {
        self.control_tx
            .send(control)
            .map_err(|_| NetworkError::Closed("Runtime task closed".to_string()))
    }

    pub fn play(&self) -> Result<(), NetworkError> {
        self.send(Control::Play)
    }

    pub fn pause(&self) -> Result<(), NetworkError> {
        self.send(Control::Pause)
    }

    pub fn seek(&self, position: f64) -> Result<(), NetworkError> {
        self.send(Control::Seek(position))
    }

    pub fn request_resync(&self) -> Result<(), NetworkError> {
        self.send(Control::RequestResync)
    }

    pub fn set_sync_enabled(&self, enabled: bool) -> Result<(), NetworkError> {
        self.send(Control::SetSyncEnabled(enabled))
    }

    /// Host only: switch the session to another media reference
    pub fn change_media(&self, media_id: &str) -> Result<(), NetworkError> {
        self.send(Control::ChangeMedia(media_id.to_string()))
    }

    pub async fn saved_position(&self) -> Result<Option<CheckpointRecord>, NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.send(Control::SavedPosition(tx))?;
        rx.await
            .map_err(|_| NetworkError::Closed("Runtime task closed".to_string()))
    }

    pub async fn resume_saved_position(&self) -> Result<bool, NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.send(Control::ResumeSaved(tx))?;
        rx.await
            .map_err(|_| NetworkError::Closed("Runtime task closed".to_string()))
    }

    pub fn clear_saved_position(&self) -> Result<(), NetworkError> {
        self.send(Control::ClearSaved)
    }

    /// Retry the join, e.g. after a password prompt
    pub fn rejoin(&self, password: Option<String>) -> Result<(), NetworkError> {
        self.send(Control::Rejoin { password })
    }

    pub fn shutdown(&self) {
        let _ = self.control_tx.send(Control::Shutdown);
    }

    pub fn status(&self) -> RuntimeStatus {
        self.status.read().clone()
    }

    pub fn is_host(&self) -> bool {
        self.status.read().is_host
    }
}

/// Coordinator traffic routed onto the mesh and the registry
struct MeshOutbound {
    topology: TopologyHandle,
    signaling: SignalingHandle,
}

impl SyncOutbound for MeshOutbound {
    fn broadcast(&self, message: &PeerMessage) {
        if let Err(e) = self.topology.broadcast(message.clone()) {
            warn!("Broadcast of {} failed: {}", message.kind(), e);
        }
    }

    fn send_to(&self, peer_id: &str, message: &PeerMessage) {
        if let Err(e) = self.topology.send_to(peer_id, message.clone()) {
            warn!("Send of {} to {} failed: {}", message.kind(), peer_id, e);
        }
    }

    fn publish_checkpoint(&self, record: &CheckpointRecord) {
        let message = SignalMessage::Checkpoint {
            version: record.version,
            state: record.state,
            media_id: record.media_id.clone(),
        };
        if let Err(e) = self.signaling.send(message) {
            debug!("Checkpoint not published: {}", e);
        }
    }
}

/// Builds and starts peer runtimes
pub struct PeerRuntime {
    network: NetworkConfig,
    sync: SyncConfig,
    store: Arc<dyn CheckpointStore>,
    clock: Arc<dyn TimeSource>,
}

impl PeerRuntime {
    pub fn new(
        network: NetworkConfig,
        sync: SyncConfig,
        store: Arc<dyn CheckpointStore>,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            network,
            sync,
            store,
            clock,
        }
    }

    /// Connect to the registry, send the join, and spawn the dispatch loop
    pub async fn start(
        self,
        join: JoinRequest,
        media: Box<dyn MediaPlayer>,
    ) -> Result<(RuntimeHandle, mpsc::UnboundedReceiver<RuntimeEvent>), NetworkError> {
        let (signaling, signal_rx) =
            SignalingClient::new(&self.network.signaling_url, self.network.heartbeat_interval)
                .connect()
                .await?;

        let (topology, topology_rx) =
            TopologyManager::new(&join.peer_id, self.network.clone(), signaling.clone()).start()?;

        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let (sync_tx, sync_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let outbound = Arc::new(MeshOutbound {
            topology: topology.clone(),
            signaling: signaling.clone(),
        });
        let coordinator = PlaybackSyncCoordinator::new(
            self.sync,
            CoordinatorContext {
                session_id: join.session_id.clone(),
                local_peer_id: join.peer_id.clone(),
                media,
                clock: self.clock,
                outbound,
                store: self.store,
                events: sync_tx,
                ticks: tick_tx,
            },
        );

        let status = Arc::new(RwLock::new(RuntimeStatus {
            sync_enabled: true,
            ..Default::default()
        }));
        let mut dispatcher = Dispatcher {
            join,
            coordinator,
            topology,
            signaling,
            events: event_tx,
            status: Arc::clone(&status),
            peers: Vec::new(),
        };
        dispatcher.send_join();

        tokio::spawn(async move {
            dispatcher.run(control_rx, signal_rx, topology_rx, tick_rx, sync_rx).await;
        });

        Ok((RuntimeHandle { control_tx, status }, event_rx))
    }
}

struct Dispatcher {
    join: JoinRequest,
    coordinator: PlaybackSyncCoordinator,
    topology: TopologyHandle,
    signaling: SignalingHandle,
    events: mpsc::UnboundedSender<RuntimeEvent>,
    status: Arc<RwLock<RuntimeStatus>>,
    peers: Vec<String>,
}

impl Dispatcher {
    async fn run(
        &mut self,
        mut control_rx: mpsc::UnboundedReceiver<Control>,
        mut signal_rx: mpsc::UnboundedReceiver<SignalingEvent>,
        mut topology_rx: mpsc::UnboundedReceiver<TopologyEvent>,
        mut tick_rx: mpsc::UnboundedReceiver<TimerKind>,
        mut sync_rx: mpsc::UnboundedReceiver<SyncEvent>,
    ) {
        info!("Peer runtime started for {}", self.join.peer_id);

        loop {
            tokio::select! {
                control = control_rx.recv() => {
                    match control {
                        Some(Control::Shutdown) | None => break,
                        Some(control) => self.handle_control(control),
                    }
                }
                event = signal_rx.recv() => {
                    match event {
                        Some(SignalingEvent::Message(message)) => self.handle_signal(message),
                        Some(SignalingEvent::Disconnected) | None => {
                            warn!("Lost connection to the registry");
                            self.emit(RuntimeEvent::Disconnected);
                            break;
                        }
                    }
                }
                Some(event) = topology_rx.recv() => self.handle_topology(event),
                Some(kind) = tick_rx.recv() => self.coordinator.on_tick(kind),
                Some(event) = sync_rx.recv() => self.emit(RuntimeEvent::Sync(event)),
            }
            self.refresh_status();
        }

        self.coordinator.teardown();
        self.topology.shutdown();
        self.signaling.close();
        self.status.write().joined = false;
        info!("Peer runtime stopped for {}", self.join.peer_id);
    }

    fn emit(&self, event: RuntimeEvent) {
        let _ = self.events.send(event);
    }

    fn send_join(&self) {
        let join = SignalMessage::Join {
            session_id: self.join.session_id.clone(),
            peer_id: self.join.peer_id.clone(),
            password: self.join.password.clone(),
            media_id: self.join.media_id.clone(),
        };
        if let Err(e) = self.signaling.send(join) {
            warn!("Failed to send join: {}", e);
        }
    }

    fn refresh_status(&self) {
        let mut status = self.status.write();
        status.is_host = self.coordinator.is_host();
        status.host = self.coordinator.host_peer_id().map(str::to_string);
        status.peers = self.peers.clone();
        status.version = self.coordinator.version();
        status.last_drift = self.coordinator.last_drift();
        status.confidence = self.coordinator.estimator().confidence();
        status.sync_enabled = self.coordinator.is_sync_enabled();
    }

    fn set_peers(&mut self, peers: Vec<String>) {
        if peers != self.peers {
            self.peers = peers.clone();
            self.emit(RuntimeEvent::PeersChanged { peers });
        }
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::Play => self.coordinator.local_play(),
            Control::Pause => self.coordinator.local_pause(),
            Control::Seek(position) => self.coordinator.local_seek(position),
            Control::RequestResync => self.coordinator.request_resync(),
            Control::SetSyncEnabled(enabled) => self.coordinator.set_sync_enabled(enabled),
            Control::ChangeMedia(media_id) => {
                if !self.coordinator.is_host() {
                    warn!("Ignoring media change: not the host");
                    return;
                }
                info!("Changing media to {}", media_id);
                self.coordinator.set_media_id(Some(media_id.clone()));
                if let Err(e) = self.signaling.send(SignalMessage::MediaChanged { media_id }) {
                    warn!("Failed to announce media change: {}", e);
                }
            }
            Control::SavedPosition(reply) => {
                let _ = reply.send(self.coordinator.saved_position());
            }
            Control::ResumeSaved(reply) => {
                let _ = reply.send(self.coordinator.resume_saved_position());
            }
            Control::ClearSaved => self.coordinator.clear_saved_position(),
            Control::Rejoin { password } => {
                self.join.password = password;
                self.send_join();
            }
            Control::Shutdown => {}
        }
    }

    fn handle_signal(&mut self, message: SignalMessage) {
        match message {
            SignalMessage::SessionState {
                session_id,
                host,
                is_host,
                peers,
                media_id,
                version,
                state,
            } => {
                info!(
                    "Joined session {} as {} (host {}, {} peers, v{})",
                    session_id,
                    if is_host { "host" } else { "viewer" },
                    host,
                    peers.len(),
                    version
                );
                self.coordinator.set_media_id(media_id.clone());
                self.coordinator.set_role(is_host, &host);
                if version > 0 {
                    self.coordinator.apply_command(Command { version, state });
                }

                let others: Vec<String> = peers
                    .iter()
                    .filter(|peer| **peer != self.join.peer_id)
                    .cloned()
                    .collect();
                if let Err(e) = self.topology.add_members(others) {
                    warn!("Failed to start mesh: {}", e);
                }

                self.status.write().joined = true;
                self.peers = peers.clone();
                self.emit(RuntimeEvent::Joined {
                    session_id,
                    host,
                    is_host,
                    peers,
                    media_id,
                });
                self.coordinator.offer_resume();
            }
            SignalMessage::PeerJoined { peer_id, peers } => {
                info!("Peer {} joined", peer_id);
                if let Err(e) = self.topology.peer_joined(&peer_id) {
                    warn!("Failed to add {} to mesh: {}", peer_id, e);
                }
                self.set_peers(peers);
            }
            SignalMessage::PeerLeft { peer_id, peers } => {
                info!("Peer {} left", peer_id);
                if let Err(e) = self.topology.peer_left(&peer_id) {
                    warn!("Failed to remove {} from mesh: {}", peer_id, e);
                }
                self.set_peers(peers);
            }
            SignalMessage::HostChanged { new_host, peers } => {
                info!("Host is now {}", new_host);
                let is_host = new_host == self.join.peer_id;
                self.coordinator.set_role(is_host, &new_host);
                self.set_peers(peers);
            }
            message @ (SignalMessage::WebrtcOffer(_)
            | SignalMessage::WebrtcAnswer(_)
            | SignalMessage::WebrtcIceCandidate(_)) => {
                if let Err(e) = self.topology.handle_signal(message) {
                    warn!("Failed to route connection setup: {}", e);
                }
            }
            SignalMessage::MediaChanged { media_id } => {
                info!("Media changed to {}", media_id);
                self.coordinator.set_media_id(Some(media_id.clone()));
                self.emit(RuntimeEvent::MediaChanged { media_id });
            }
            SignalMessage::Error { code, message } => {
                if code == PASSWORD_REQUIRED {
                    warn!("Session {} requires a password", self.join.session_id);
                    self.emit(RuntimeEvent::PasswordRequired { message });
                } else {
                    warn!("Registry error {}: {}", code, message);
                    self.emit(RuntimeEvent::Error { message });
                }
            }
            SignalMessage::HeartbeatAck => {}
            other => debug!("Ignoring {} from registry", other.kind()),
        }
    }

    fn handle_topology(&mut self, event: TopologyEvent) {
        match event {
            TopologyEvent::ChannelOpen { peer_id } => {
                if self.coordinator.host_peer_id() == Some(peer_id.as_str()) {
                    self.coordinator.send_probe();
                }
                self.emit(RuntimeEvent::PeerConnected { peer_id });
            }
            TopologyEvent::PeerClosed { peer_id } => {
                self.emit(RuntimeEvent::PeerDisconnected { peer_id });
            }
            TopologyEvent::Message { from, message } => {
                if message.is_from_host_only() && self.coordinator.host_peer_id() != Some(from.as_str()) {
                    debug!("Ignoring {} from non-host {}", message.kind(), from);
                    return;
                }
                self.coordinator.handle_peer_message(&from, message);
            }
        }
    }
}
