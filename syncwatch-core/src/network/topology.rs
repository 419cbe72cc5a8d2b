//! WebRTC mesh topology
//!
//! Builds a full mesh of data channels among session members. Offers, answers
//! and ICE candidates travel over the signaling connection; once a channel is
//! open, peer messages go directly over it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::mesh::MeshState;
use super::signaling::{RelayedSignal, SignalMessage, SignalingHandle};
use crate::sync::PeerMessage;

/// Default STUN servers
const DEFAULT_ICE_SERVERS: &[&str] = &["stun:stun.l.google.com:19302", "stun:stun1.l.google.com:19302"];

/// Default signaling server URL
const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:3001";

/// Network configuration
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Registry WebSocket URL
    pub signaling_url: String,
    /// STUN/TURN URLs handed to ICE
    pub ice_servers: Vec<String>,
    /// Label of the sync data channel
    pub channel_label: String,
    /// Retransmissions before a message is dropped
    pub max_retransmits: u16,
    /// Keep-alive period on the signaling connection
    pub heartbeat_interval: Duration,
    /// Gather loopback ICE candidates (same-host sessions)
    pub include_loopback: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            channel_label: "sync".to_string(),
            max_retransmits: 3,
            heartbeat_interval: Duration::from_secs(30),
            include_loopback: false,
        }
    }
}

impl NetworkConfig {
    pub fn with_signaling_url(mut self, url: impl Into<String>) -> Self {
        self.signaling_url = url.into();
        self
    }
}

/// Network-related errors
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Failed to connect: {0}")]
    Connection(String),

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("Invalid signaling payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("No open channel to {0}")]
    NoChannel(String),

    #[error("{0}")]
    Closed(String),
}

/// Events emitted by the topology manager
#[derive(Debug, Clone)]
pub enum TopologyEvent {
    /// Data channel to a peer is usable
    ChannelOpen { peer_id: String },
    /// Peer link failed or closed and was discarded
    PeerClosed { peer_id: String },
    /// Message received on a data channel
    Message { from: String, message: PeerMessage },
}

/// Commands sent to the topology manager
#[derive(Debug)]
enum TopologyCommand {
    AddMembers(Vec<String>),
    PeerJoined(String),
    PeerLeft(String),
    Signal(SignalMessage),
    Broadcast(PeerMessage),
    SendTo { peer_id: String, message: PeerMessage },
    Shutdown,
}

/// Callbacks from webrtc tasks, funneled back into the manager loop.
/// `link` identifies the connection that raised it so events from a
/// replaced connection are ignored.
enum LinkEvent {
    LocalCandidate { peer_id: String, link: u64, candidate: RTCIceCandidateInit },
    StateChanged { peer_id: String, link: u64, state: RTCPeerConnectionState },
    IncomingChannel { peer_id: String, link: u64, channel: Arc<RTCDataChannel> },
    ChannelOpen { peer_id: String, link: u64 },
    ChannelClosed { peer_id: String },
    Inbound { peer_id: String, data: Vec<u8> },
}

/// Handle to communicate with the running topology manager
#[derive(Clone)]
pub struct TopologyHandle {
    command_tx: mpsc::UnboundedSender<TopologyCommand>,
}

impl TopologyHandle {
    fn send(&self, command: TopologyCommand) -> Result<(), NetworkError> {
        self.command_tx
            .send(command)
            .map_err(|_| NetworkError::Closed("Topology task closed".to_string()))
    }

    /// Admit the members listed at join time
    pub fn add_members(&self, peers: Vec<String>) -> Result<(), NetworkError> {
        self.send(TopologyCommand::AddMembers(peers))
    }

    pub fn peer_joined(&self, peer_id: &str) -> Result<(), NetworkError> {
        self.send(TopologyCommand::PeerJoined(peer_id.to_string()))
    }

    pub fn peer_left(&self, peer_id: &str) -> Result<(), NetworkError> {
        self.send(TopologyCommand::PeerLeft(peer_id.to_string()))
    }

    /// Feed an offer/answer/candidate received over signaling
    pub fn handle_signal(&self, message: SignalMessage) -> Result<(), NetworkError> {
        self.send(TopologyCommand::Signal(message))
    }

    pub fn broadcast(&self, message: PeerMessage) -> Result<(), NetworkError> {
        self.send(TopologyCommand::Broadcast(message))
    }

    pub fn send_to(&self, peer_id: &str, message: PeerMessage) -> Result<(), NetworkError> {
        self.send(TopologyCommand::SendTo {
            peer_id: peer_id.to_string(),
            message,
        })
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(TopologyCommand::Shutdown);
    }
}

struct PeerLink {
    id: u64,
    connection: Arc<RTCPeerConnection>,
    channel: Option<Arc<RTCDataChannel>>,
}

/// Manages peer connections - runs in a background task
pub struct TopologyManager {
    config: NetworkConfig,
    signaling: SignalingHandle,
    mesh: MeshState,
    links: HashMap<String, PeerLink>,
    /// Remote candidates that arrived before the remote description
    pending_candidates: HashMap<String, Vec<RTCIceCandidateInit>>,
    next_link: u64,
}

impl TopologyManager {
    pub fn new(local_peer_id: &str, config: NetworkConfig, signaling: SignalingHandle) -> Self {
        Self {
            config,
            signaling,
            mesh: MeshState::new(local_peer_id),
            links: HashMap::new(),
            pending_candidates: HashMap::new(),
            next_link: 0,
        }
    }

    /// Start the manager and return a handle for communication
    pub fn start(self) -> Result<(TopologyHandle, mpsc::UnboundedReceiver<TopologyEvent>), NetworkError> {
        let api = build_api(&self.config)?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            self.run(api, event_tx, command_rx).await;
        });

        Ok((TopologyHandle { command_tx }, event_rx))
    }

    async fn run(
        mut self,
        api: API,
        event_tx: mpsc::UnboundedSender<TopologyEvent>,
        mut command_rx: mpsc::UnboundedReceiver<TopologyCommand>,
    ) {
        let (link_tx, mut link_rx) = mpsc::unbounded_channel::<LinkEvent>();
        info!("Topology manager started for {}", self.mesh.local_peer_id());

        loop {
            tokio::select! {
                Some(event) = link_rx.recv() => {
                    self.handle_link_event(event, &link_tx, &event_tx).await;
                }
                cmd = command_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        TopologyCommand::AddMembers(peers) => {
                            let offers = self.mesh.add_members(peers.iter().map(String::as_str));
                            for peer_id in offers {
                                self.offer(&api, &peer_id, &link_tx, &event_tx).await;
                            }
                        }
                        TopologyCommand::PeerJoined(peer_id) => {
                            if self.mesh.peer_joined(&peer_id) {
                                self.offer(&api, &peer_id, &link_tx, &event_tx).await;
                            }
                        }
                        TopologyCommand::PeerLeft(peer_id) => {
                            self.mesh.peer_left(&peer_id);
                            self.close_link(&peer_id).await;
                        }
                        TopologyCommand::Signal(message) => {
                            self.handle_signal(&api, message, &link_tx, &event_tx).await;
                        }
                        TopologyCommand::Broadcast(message) => {
                            self.broadcast(&message).await;
                        }
                        TopologyCommand::SendTo { peer_id, message } => {
                            if let Err(e) = self.send_to(&peer_id, &message).await {
                                debug!("Send of {} to {} failed: {}", message.kind(), peer_id, e);
                            }
                        }
                        TopologyCommand::Shutdown => {
                            info!("Topology shutting down");
                            break;
                        }
                    }
                }
            }
        }

        let peers: Vec<String> = self.links.keys().cloned().collect();
        for peer_id in peers {
            self.close_link(&peer_id).await;
        }
    }

    // === Connection setup ===

    async fn create_connection(
        &mut self,
        api: &API,
        peer_id: &str,
        link_tx: &mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<(u64, Arc<RTCPeerConnection>), NetworkError> {
        self.next_link += 1;
        let link = self.next_link;

        let ice_servers = if self.config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let connection = Arc::new(api.new_peer_connection(rtc_config).await?);

        let tx = link_tx.clone();
        let peer = peer_id.to_string();
        connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(candidate) => {
                        let _ = tx.send(LinkEvent::LocalCandidate {
                            peer_id: peer.clone(),
                            link,
                            candidate,
                        });
                    }
                    Err(e) => warn!("Failed to serialize ICE candidate for {}: {}", peer, e),
                }
            }
            Box::pin(async {})
        }));

        let tx = link_tx.clone();
        let peer = peer_id.to_string();
        connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let _ = tx.send(LinkEvent::StateChanged {
                peer_id: peer.clone(),
                link,
                state,
            });
            Box::pin(async {})
        }));

        let tx = link_tx.clone();
        let peer = peer_id.to_string();
        connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let _ = tx.send(LinkEvent::IncomingChannel {
                peer_id: peer.clone(),
                link,
                channel,
            });
            Box::pin(async {})
        }));

        Ok((link, connection))
    }

    async fn offer(
        &mut self,
        api: &API,
        peer_id: &str,
        link_tx: &mpsc::UnboundedSender<LinkEvent>,
        event_tx: &mpsc::UnboundedSender<TopologyEvent>,
    ) {
        if let Err(e) = self.try_offer(api, peer_id, link_tx).await {
            warn!("Offer to {} failed: {}", peer_id, e);
            self.fail_link(peer_id, event_tx).await;
        }
    }

    async fn try_offer(
        &mut self,
        api: &API,
        peer_id: &str,
        link_tx: &mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<(), NetworkError> {
        info!("Offering connection to {}", peer_id);
        let (link, connection) = self.create_connection(api, peer_id, link_tx).await?;

        let init = RTCDataChannelInit {
            ordered: Some(false),
            max_retransmits: Some(self.config.max_retransmits),
            ..Default::default()
        };
        let channel = connection
            .create_data_channel(&self.config.channel_label, Some(init))
            .await?;
        wire_channel(peer_id, link, &channel, link_tx);

        self.links.insert(
            peer_id.to_string(),
            PeerLink {
                id: link,
                connection: Arc::clone(&connection),
                channel: Some(channel),
            },
        );

        let offer = connection.create_offer(None).await?;
        connection.set_local_description(offer.clone()).await?;

        self.signaling.send(SignalMessage::WebrtcOffer(RelayedSignal::to(
            peer_id,
            serde_json::to_value(&offer)?,
        )))
    }

    async fn handle_signal(
        &mut self,
        api: &API,
        message: SignalMessage,
        link_tx: &mpsc::UnboundedSender<LinkEvent>,
        event_tx: &mpsc::UnboundedSender<TopologyEvent>,
    ) {
        let Some(from) = message.relayed().and_then(|s| s.from_peer_id.clone()) else {
            debug!("Ignoring {} without sender", message.kind());
            return;
        };

        let result = match message {
            SignalMessage::WebrtcOffer(signal) => self.handle_offer(api, &from, signal.payload, link_tx).await,
            SignalMessage::WebrtcAnswer(signal) => self.handle_answer(&from, signal.payload).await,
            SignalMessage::WebrtcIceCandidate(signal) => self.handle_candidate(&from, signal.payload).await,
            _ => Ok(()),
        };

        if let Err(e) = result {
            warn!("Connection setup with {} failed: {}", from, e);
            self.fail_link(&from, event_tx).await;
        }
    }

    async fn handle_offer(
        &mut self,
        api: &API,
        from: &str,
        payload: serde_json::Value,
        link_tx: &mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<(), NetworkError> {
        if !self.mesh.on_offer(from) {
            warn!("Ignoring offer from {}: we initiate toward that peer", from);
            return Ok(());
        }
        info!("Answering connection from {}", from);

        // A re-offer replaces whatever was there; candidates that beat the offer belong to it
        let early = self.pending_candidates.remove(from);
        self.close_link(from).await;
        if let Some(early) = early {
            self.pending_candidates.insert(from.to_string(), early);
        }

        let offer: RTCSessionDescription = serde_json::from_value(payload)?;
        let (link, connection) = self.create_connection(api, from, link_tx).await?;
        self.links.insert(
            from.to_string(),
            PeerLink {
                id: link,
                connection: Arc::clone(&connection),
                channel: None,
            },
        );

        connection.set_remote_description(offer).await?;
        let answer = connection.create_answer(None).await?;
        connection.set_local_description(answer.clone()).await?;
        self.flush_candidates(from).await?;

        self.signaling.send(SignalMessage::WebrtcAnswer(RelayedSignal::to(
            from,
            serde_json::to_value(&answer)?,
        )))
    }

    async fn handle_answer(&mut self, from: &str, payload: serde_json::Value) -> Result<(), NetworkError> {
        if !self.mesh.on_answer(from) {
            debug!("Ignoring unexpected answer from {}", from);
            return Ok(());
        }
        let Some(link) = self.links.get(from) else {
            return Ok(());
        };

        let answer: RTCSessionDescription = serde_json::from_value(payload)?;
        link.connection.set_remote_description(answer).await?;
        self.flush_candidates(from).await
    }

    async fn handle_candidate(&mut self, from: &str, payload: serde_json::Value) -> Result<(), NetworkError> {
        let candidate: RTCIceCandidateInit = serde_json::from_value(payload)?;

        let ready = match self.links.get(from) {
            Some(link) => link.connection.remote_description().await.is_some(),
            None => false,
        };

        if ready {
            if let Some(link) = self.links.get(from) {
                link.connection.add_ice_candidate(candidate).await?;
            }
        } else {
            debug!("Queueing ICE candidate from {}", from);
            self.pending_candidates
                .entry(from.to_string())
                .or_default()
                .push(candidate);
        }
        Ok(())
    }

    async fn flush_candidates(&mut self, peer_id: &str) -> Result<(), NetworkError> {
        let Some(candidates) = self.pending_candidates.remove(peer_id) else {
            return Ok(());
        };
        if let Some(link) = self.links.get(peer_id) {
            for candidate in candidates {
                link.connection.add_ice_candidate(candidate).await?;
            }
        }
        Ok(())
    }

    // === Link events ===

    async fn handle_link_event(
        &mut self,
        event: LinkEvent,
        link_tx: &mpsc::UnboundedSender<LinkEvent>,
        event_tx: &mpsc::UnboundedSender<TopologyEvent>,
    ) {
        match event {
            LinkEvent::LocalCandidate { peer_id, link, candidate } => {
                if !self.is_current(&peer_id, link) {
                    debug!("Dropping candidate from a replaced connection to {}", peer_id);
                    return;
                }
                match serde_json::to_value(&candidate) {
                    Ok(payload) => {
                        let message = SignalMessage::WebrtcIceCandidate(RelayedSignal::to(&peer_id, payload));
                        if let Err(e) = self.signaling.send(message) {
                            warn!("Failed to send ICE candidate to {}: {}", peer_id, e);
                        }
                    }
                    Err(e) => warn!("Failed to encode ICE candidate: {}", e),
                }
            }
            LinkEvent::StateChanged { peer_id, link, state } => {
                if !self.is_current(&peer_id, link) {
                    return;
                }
                debug!("Peer connection {} state: {}", peer_id, state);
                match state {
                    RTCPeerConnectionState::Failed => self.fail_link(&peer_id, event_tx).await,
                    RTCPeerConnectionState::Closed => {
                        if self.mesh.on_terminated(&peer_id, false).is_some() {
                            self.close_link(&peer_id).await;
                            let _ = event_tx.send(TopologyEvent::PeerClosed { peer_id });
                        }
                    }
                    _ => {}
                }
            }
            LinkEvent::IncomingChannel { peer_id, link, channel } => {
                let Some(entry) = self.links.get_mut(&peer_id).filter(|entry| entry.id == link) else {
                    return;
                };
                info!("Data channel '{}' from {}", channel.label(), peer_id);
                wire_channel(&peer_id, link, &channel, link_tx);
                let open = channel.ready_state() == RTCDataChannelState::Open;
                entry.channel = Some(channel);
                if open {
                    self.mark_open(&peer_id, event_tx);
                }
            }
            LinkEvent::ChannelOpen { peer_id, link } => {
                if self.is_current(&peer_id, link) {
                    self.mark_open(&peer_id, event_tx);
                }
            }
            LinkEvent::ChannelClosed { peer_id } => {
                debug!("Data channel to {} closed", peer_id);
            }
            LinkEvent::Inbound { peer_id, data } => match serde_json::from_slice::<PeerMessage>(&data) {
                Ok(message) => {
                    let _ = event_tx.send(TopologyEvent::Message {
                        from: peer_id,
                        message,
                    });
                }
                Err(e) => warn!("Dropping malformed message from {}: {}", peer_id, e),
            },
        }
    }

    fn is_current(&self, peer_id: &str, link: u64) -> bool {
        self.links.get(peer_id).is_some_and(|entry| entry.id == link)
    }

    fn mark_open(&mut self, peer_id: &str, event_tx: &mpsc::UnboundedSender<TopologyEvent>) {
        if self.mesh.state(peer_id) == super::mesh::LinkState::Connected {
            return;
        }
        info!("Data channel to {} open", peer_id);
        self.mesh.on_connected(peer_id);
        let _ = event_tx.send(TopologyEvent::ChannelOpen {
            peer_id: peer_id.to_string(),
        });
    }

    async fn fail_link(&mut self, peer_id: &str, event_tx: &mpsc::UnboundedSender<TopologyEvent>) {
        if self.mesh.on_terminated(peer_id, true).is_some() || self.links.contains_key(peer_id) {
            self.close_link(peer_id).await;
            let _ = event_tx.send(TopologyEvent::PeerClosed {
                peer_id: peer_id.to_string(),
            });
        }
    }

    async fn close_link(&mut self, peer_id: &str) {
        self.pending_candidates.remove(peer_id);
        if let Some(link) = self.links.remove(peer_id) {
            if let Err(e) = link.connection.close().await {
                debug!("Error closing connection to {}: {}", peer_id, e);
            }
        }
    }

    // === Delivery ===

    /// Send to every open channel; one failure does not stop the rest
    async fn broadcast(&self, message: &PeerMessage) {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode {}: {}", message.kind(), e);
                return;
            }
        };

        for (peer_id, link) in &self.links {
            let Some(channel) = open_channel(link) else {
                continue;
            };
            if let Err(e) = channel.send_text(text.clone()).await {
                warn!("Failed to send {} to {}: {}", message.kind(), peer_id, e);
            }
        }
    }

    async fn send_to(&self, peer_id: &str, message: &PeerMessage) -> Result<(), NetworkError> {
        let channel = self
            .links
            .get(peer_id)
            .and_then(open_channel)
            .ok_or_else(|| NetworkError::NoChannel(peer_id.to_string()))?;
        channel.send_text(serde_json::to_string(message)?).await?;
        Ok(())
    }
}

fn open_channel(link: &PeerLink) -> Option<&Arc<RTCDataChannel>> {
    link.channel
        .as_ref()
        .filter(|channel| channel.ready_state() == RTCDataChannelState::Open)
}

fn build_api(config: &NetworkConfig) -> Result<API, NetworkError> {
    let mut media_engine = MediaEngine::default();
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
    let mut settings = SettingEngine::default();
    settings.set_include_loopback_candidate(config.include_loopback);
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(settings)
        .build())
}

/// Route a channel's callbacks into the manager loop
fn wire_channel(peer_id: &str, link: u64, channel: &Arc<RTCDataChannel>, link_tx: &mpsc::UnboundedSender<LinkEvent>) {
    let tx = link_tx.clone();
    let peer = peer_id.to_string();
    channel.on_open(Box::new(move || {
        let _ = tx.send(LinkEvent::ChannelOpen { peer_id: peer, link });
        Box::pin(async {})
    }));

    let tx = link_tx.clone();
    let peer = peer_id.to_string();
    channel.on_close(Box::new(move || {
        let _ = tx.send(LinkEvent::ChannelClosed { peer_id: peer.clone() });
        Box::pin(async {})
    }));

    let tx = link_tx.clone();
    let peer = peer_id.to_string();
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let _ = tx.send(LinkEvent::Inbound {
            peer_id: peer.clone(),
            data: msg.data.to_vec(),
        });
        Box::pin(async {})
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(15);

    #[test]
    fn test_default_config() {
        let config = NetworkConfig::default().with_signaling_url("ws://relay:9000");
        assert_eq!(config.signaling_url, "ws://relay:9000");
        assert_eq!(config.max_retransmits, 3);
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert!(!config.include_loopback);
    }

    #[tokio::test]
    async fn test_handle_reports_closed_task() {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        drop(command_rx);
        let handle = TopologyHandle { command_tx };

        assert!(matches!(
            handle.broadcast(PeerMessage::RequestSync),
            Err(NetworkError::Closed(_))
        ));
    }

    struct Node {
        handle: TopologyHandle,
        events: mpsc::UnboundedReceiver<TopologyEvent>,
    }

    /// Stand-in for the registry: forwards each peer's offers, answers and
    /// candidates to the target with the sender stamped. The first offer is
    /// held back until one of its sender's candidates has gone ahead of it.
    fn spawn_registry(
        outgoing: Vec<(String, mpsc::UnboundedReceiver<SignalMessage>)>,
        handles: HashMap<String, TopologyHandle>,
    ) {
        let (routed_tx, mut routed_rx) = mpsc::unbounded_channel::<(String, SignalMessage)>();
        for (peer_id, mut rx) in outgoing {
            let tx = routed_tx.clone();
            tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    let _ = tx.send((peer_id.clone(), message));
                }
            });
        }

        tokio::spawn(async move {
            let deliver = |from: &str, message: &SignalMessage| {
                let Some(relayed) = message.relayed() else { return };
                let Some(target) = relayed.target_peer_id.clone() else { return };
                if let (Some(handle), Some(forwarded)) = (
                    handles.get(&target),
                    message.with_relayed(relayed.clone().forwarded_from(from)),
                ) {
                    let _ = handle.handle_signal(forwarded);
                }
            };

            let mut held: Option<(String, SignalMessage)> = None;
            let mut holding_done = false;
            loop {
                let next = if held.is_some() {
                    match timeout(Duration::from_millis(500), routed_rx.recv()).await {
                        Ok(next) => next,
                        Err(_) => {
                            if let Some((from, offer)) = held.take() {
                                deliver(&from, &offer);
                            }
                            continue;
                        }
                    }
                } else {
                    routed_rx.recv().await
                };
                let Some((from, message)) = next else { break };

                if !holding_done && matches!(message, SignalMessage::WebrtcOffer(_)) {
                    holding_done = true;
                    held = Some((from, message));
                    continue;
                }
                deliver(&from, &message);

                let releases = matches!(message, SignalMessage::WebrtcIceCandidate(_))
                    && held.as_ref().is_some_and(|(holder, _)| *holder == from);
                if releases {
                    if let Some((holder, offer)) = held.take() {
                        deliver(&holder, &offer);
                    }
                }
            }
        });
    }

    fn start_mesh(peers: &[&str]) -> HashMap<String, Node> {
        let config = NetworkConfig {
            ice_servers: Vec::new(),
            include_loopback: true,
            ..Default::default()
        };

        let mut nodes = HashMap::new();
        let mut outgoing = Vec::new();
        let mut handles = HashMap::new();
        for peer_id in peers {
            let (signaling, rx) = SignalingHandle::loopback();
            let (handle, events) = TopologyManager::new(peer_id, config.clone(), signaling)
                .start()
                .unwrap();
            outgoing.push((peer_id.to_string(), rx));
            handles.insert(peer_id.to_string(), handle.clone());
            nodes.insert(peer_id.to_string(), Node { handle, events });
        }
        spawn_registry(outgoing, handles);

        let members: Vec<String> = peers.iter().map(|p| p.to_string()).collect();
        for node in nodes.values() {
            node.handle.add_members(members.clone()).unwrap();
        }
        nodes
    }

    async fn next_event(node: &mut Node) -> TopologyEvent {
        timeout(WAIT, node.events.recv())
            .await
            .expect("timed out waiting for topology event")
            .expect("topology stopped")
    }

    async fn next_message(node: &mut Node) -> (String, PeerMessage) {
        loop {
            if let TopologyEvent::Message { from, message } = next_event(node).await {
                return (from, message);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_three_peer_mesh_over_loopback() {
        let peers = ["a", "b", "c"];
        let mut nodes = start_mesh(&peers);

        for peer_id in peers {
            let node = nodes.get_mut(peer_id).unwrap();
            let mut opened = Vec::new();
            while opened.len() < 2 {
                match next_event(node).await {
                    TopologyEvent::ChannelOpen { peer_id } => opened.push(peer_id),
                    TopologyEvent::PeerClosed { peer_id: lost } => panic!("{peer_id} lost {lost}"),
                    TopologyEvent::Message { .. } => {}
                }
            }
            let distinct: HashSet<&String> = opened.iter().collect();
            assert_eq!(distinct.len(), 2, "{peer_id} opened {opened:?}");
            assert!(!opened.iter().any(|p| p == peer_id));
        }

        // Directed send reaches only the named peer
        nodes["c"].handle.send_to("a", PeerMessage::RequestSync).unwrap();
        let (from, message) = next_message(nodes.get_mut("a").unwrap()).await;
        assert_eq!((from.as_str(), message), ("c", PeerMessage::RequestSync));

        // Broadcast reaches everyone else
        nodes["a"].handle.broadcast(PeerMessage::ClockPing { timestamp: 7 }).unwrap();
        for peer_id in ["b", "c"] {
            let (from, message) = next_message(nodes.get_mut(peer_id).unwrap()).await;
            assert_eq!(from, "a");
            assert_eq!(message, PeerMessage::ClockPing { timestamp: 7 });
        }

        // b saw nothing but the broadcast: no stray RequestSync, no extra ChannelOpen
        let b = nodes.get_mut("b").unwrap();
        while let Ok(event) = b.events.try_recv() {
            assert!(
                !matches!(event, TopologyEvent::ChannelOpen { .. } | TopologyEvent::Message { .. }),
                "unexpected {event:?}"
            );
        }

        // A peer that went away does not stop delivery to the rest
        nodes["c"].handle.shutdown();
        tokio::time::sleep(Duration::from_millis(200)).await;
        nodes["a"].handle.broadcast(PeerMessage::ClockPing { timestamp: 8 }).unwrap();
        let (from, message) = next_message(nodes.get_mut("b").unwrap()).await;
        assert_eq!(from, "a");
        assert_eq!(message, PeerMessage::ClockPing { timestamp: 8 });

        for node in nodes.values() {
            node.handle.shutdown();
        }
    }
}
