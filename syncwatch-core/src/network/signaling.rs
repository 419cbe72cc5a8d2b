//! Signaling via the session registry
//!
//! A WebSocket connection to the relay carries session membership events and
//! the offer/answer/ICE metadata needed to open peer data channels. Once a
//! channel is open, playback traffic never goes through here.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::NetworkError;
use crate::sync::PlaybackState;

/// Error code for a join that needs (a different) password
pub const PASSWORD_REQUIRED: &str = "password-required";

/// Connection-setup metadata relayed verbatim between two peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedSignal {
    /// Set by the sender
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_peer_id: Option<String>,
    /// Set by the registry when forwarding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_peer_id: Option<String>,
    pub payload: Value,
}

impl RelayedSignal {
    pub fn to(target_peer_id: impl Into<String>, payload: Value) -> Self {
        Self {
            target_peer_id: Some(target_peer_id.into()),
            from_peer_id: None,
            payload,
        }
    }

    /// The registry's rewrite before delivery: target stripped, sender stamped
    pub fn forwarded_from(self, from_peer_id: impl Into<String>) -> Self {
        Self {
            target_peer_id: None,
            from_peer_id: Some(from_peer_id.into()),
            payload: self.payload,
        }
    }
}

/// Messages exchanged with the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    // === Membership ===
    #[serde(rename_all = "camelCase")]
    Join {
        session_id: String,
        peer_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_id: Option<String>,
    },

    /// Admission reply
    #[serde(rename_all = "camelCase")]
    SessionState {
        session_id: String,
        host: String,
        is_host: bool,
        peers: Vec<String>,
        #[serde(default)]
        media_id: Option<String>,
        version: u64,
        state: PlaybackState,
    },

    #[serde(rename_all = "camelCase")]
    PeerJoined { peer_id: String, peers: Vec<String> },

    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: String, peers: Vec<String> },

    #[serde(rename_all = "camelCase")]
    HostChanged { new_host: String, peers: Vec<String> },

    // === Connection setup ===
    WebrtcOffer(RelayedSignal),
    WebrtcAnswer(RelayedSignal),
    WebrtcIceCandidate(RelayedSignal),

    // === Session state ===
    /// Host's latest state, persisted by the registry to seed rejoins
    #[serde(rename_all = "camelCase")]
    Checkpoint {
        version: u64,
        state: PlaybackState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    MediaChanged { media_id: String },

    Error { code: String, message: String },

    // === Keep-alive ===
    Heartbeat,
    HeartbeatAck,
}

impl SignalMessage {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Join { .. } => "join",
            SignalMessage::SessionState { .. } => "session-state",
            SignalMessage::PeerJoined { .. } => "peer-joined",
            SignalMessage::PeerLeft { .. } => "peer-left",
            SignalMessage::HostChanged { .. } => "host-changed",
            SignalMessage::WebrtcOffer(_) => "webrtc-offer",
            SignalMessage::WebrtcAnswer(_) => "webrtc-answer",
            SignalMessage::WebrtcIceCandidate(_) => "webrtc-ice-candidate",
            SignalMessage::Checkpoint { .. } => "checkpoint",
            SignalMessage::MediaChanged { .. } => "media-changed",
            SignalMessage::Error { .. } => "error",
            SignalMessage::Heartbeat => "heartbeat",
            SignalMessage::HeartbeatAck => "heartbeat-ack",
        }
    }

    /// The relayed part of an offer/answer/candidate
    pub fn relayed(&self) -> Option<&RelayedSignal> {
        match self {
            SignalMessage::WebrtcOffer(signal)
            | SignalMessage::WebrtcAnswer(signal)
            | SignalMessage::WebrtcIceCandidate(signal) => Some(signal),
            _ => None,
        }
    }

    /// Same kind of message carrying a different relayed part
    pub fn with_relayed(&self, signal: RelayedSignal) -> Option<SignalMessage> {
        match self {
            SignalMessage::WebrtcOffer(_) => Some(SignalMessage::WebrtcOffer(signal)),
            SignalMessage::WebrtcAnswer(_) => Some(SignalMessage::WebrtcAnswer(signal)),
            SignalMessage::WebrtcIceCandidate(_) => Some(SignalMessage::WebrtcIceCandidate(signal)),
            _ => None,
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        SignalMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Events from the signaling connection
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    Message(SignalMessage),
    Disconnected,
}

#[derive(Debug)]
enum Outgoing {
    Message(SignalMessage),
    Close,
}

/// Handle to send on a running signaling connection
#[derive(Debug, Clone)]
pub struct SignalingHandle {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl SignalingHandle {
    pub fn send(&self, message: SignalMessage) -> Result<(), NetworkError> {
        self.tx
            .send(Outgoing::Message(message))
            .map_err(|_| NetworkError::Closed("Signaling task closed".to_string()))
    }

    /// Close the WebSocket; the registry treats this as leaving
    pub fn close(&self) {
        let _ = self.tx.send(Outgoing::Close);
    }

    /// A handle with no socket behind it; sent messages come out of the receiver
    #[cfg(test)]
    pub(crate) fn loopback() -> (Self, mpsc::UnboundedReceiver<SignalMessage>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(Outgoing::Message(message)) = rx.recv().await {
                if out_tx.send(message).is_err() {
                    break;
                }
            }
        });
        (Self { tx }, out_rx)
    }
}

/// WebSocket client for the session registry
pub struct SignalingClient {
    url: String,
    heartbeat_interval: Duration,
}

impl SignalingClient {
    pub fn new(url: impl Into<String>, heartbeat_interval: Duration) -> Self {
        Self {
            url: url.into(),
            heartbeat_interval,
        }
    }

    /// Connect and spawn the reader/writer tasks
    pub async fn connect(
        self,
    ) -> Result<(SignalingHandle, mpsc::UnboundedReceiver<SignalingEvent>), NetworkError> {
        info!("Connecting to signaling server {}", self.url);
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| NetworkError::Connection(e.to_string()))?;
        info!("Signaling connected");

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let heartbeat = self.heartbeat_interval;

        // Writer: outbound messages plus periodic heartbeat
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
            loop {
                let outgoing = tokio::select! {
                    msg = out_rx.recv() => msg.unwrap_or(Outgoing::Close),
                    _ = ticker.tick() => Outgoing::Message(SignalMessage::Heartbeat),
                };

                match outgoing {
                    Outgoing::Message(message) => {
                        let text = match serde_json::to_string(&message) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!("Failed to encode {}: {}", message.kind(), e);
                                continue;
                            }
                        };
                        debug!("Signaling -> {}", message.kind());
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            warn!("Signaling send failed: {}", e);
                            break;
                        }
                    }
                    Outgoing::Close => {
                        let _ = sink.close().await;
                        break;
                    }
                }
            }
        });

        // Reader
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<SignalMessage>(&text) {
                        Ok(message) => {
                            debug!("Signaling <- {}", message.kind());
                            if event_tx.send(SignalingEvent::Message(message)).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Ignoring malformed signaling message: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Signaling connection error: {}", e);
                        break;
                    }
                }
            }
            info!("Signaling connection closed");
            let _ = event_tx.send(SignalingEvent::Disconnected);
        });

        Ok((SignalingHandle { tx: out_tx }, event_rx))
    }
}
