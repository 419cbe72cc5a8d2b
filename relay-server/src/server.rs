//! WebSocket signaling server

use crate::config::RelayConfig;
use crate::metrics::{truncate_peer_id, LogLevel, Metrics, ServerStatus};
use crate::registry::{PeerSender, SessionRegistry};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use syncwatch_core::network::SignalMessage;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Bind and serve until the listener fails
pub async fn run(
    config: RelayConfig,
    registry: Arc<SessionRegistry>,
    metrics: Arc<RwLock<Metrics>>,
) -> Result<(), Box<dyn Error>> {
    info!("SyncWatch relay starting...");

    let listener = match TcpListener::bind(config.listen_addr()).await {
        Ok(listener) => listener,
        Err(e) => {
            let mut m = metrics.write();
            m.status = ServerStatus::Error;
            m.log(LogLevel::Error, format!("Bind {} failed: {}", config.listen_addr(), e));
            return Err(e.into());
        }
    };

    {
        let mut m = metrics.write();
        m.listen_addr = config.listen_addr();
        m.checkpoint_dir = config.checkpoint_dir.display().to_string();
        m.status = ServerStatus::Running;
        m.log(LogLevel::Info, format!("Listening on ws://{}", config.listen_addr()));
        m.log(LogLevel::Info, format!("Checkpoints in {}", config.checkpoint_dir.display()));
    }
    info!("Listening on ws://{}", config.listen_addr());

    serve(listener, registry, metrics).await
}

/// Accept loop
pub async fn serve(
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    metrics: Arc<RwLock<Metrics>>,
) -> Result<(), Box<dyn Error>> {
    loop {
        let (stream, addr) = listener.accept().await?;
        let registry = Arc::clone(&registry);
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            handle_connection(stream, addr, registry, metrics).await;
        });
    }
}

/// The session membership held by one connection
struct Membership {
    session_id: String,
    peer_id: String,
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    metrics: Arc<RwLock<Metrics>>,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };
    info!("Connection from {}", addr);
    metrics.write().connection_opened(&addr.to_string());

    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<SignalMessage>();

    // Writer: everything queued for this peer
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode {}: {}", message.kind(), e);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut membership: Option<Membership> = None;
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<SignalMessage>(&text) {
                Ok(message) => handle_message(message, &tx, &mut membership, &registry, &metrics),
                Err(e) => warn!("Ignoring malformed message from {}: {}", addr, e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Connection {} error: {}", addr, e);
                break;
            }
        }
    }

    if let Some(member) = membership.take() {
        if let Some(outcome) = registry.leave(&member.session_id, &member.peer_id, &tx) {
            info!("{} left {}", member.peer_id, member.session_id);
            let mut m = metrics.write();
            m.peer_left(
                &member.session_id,
                &member.peer_id,
                outcome.new_host.as_deref(),
                outcome.destroyed,
            );
            m.set_counts(registry.session_count(), registry.peer_count());
        }
    }

    drop(tx);
    let _ = writer.await;
    info!("Connection from {} closed", addr);
    metrics.write().connection_closed(&addr.to_string());
}

fn handle_message(
    message: SignalMessage,
    tx: &PeerSender,
    membership: &mut Option<Membership>,
    registry: &SessionRegistry,
    metrics: &RwLock<Metrics>,
) {
    match message {
        SignalMessage::Join {
            session_id,
            peer_id,
            password,
            media_id,
        } => {
            if let Some(member) = membership.as_ref() {
                warn!("{} sent a second join on one connection", member.peer_id);
                let _ = tx.send(SignalMessage::error("already-joined", "Connection is already in a session"));
                return;
            }

            match registry.join(&session_id, &peer_id, password, media_id, tx.clone()) {
                Ok(outcome) => {
                    info!(
                        "{} joined {}{}",
                        truncate_peer_id(&peer_id),
                        session_id,
                        if outcome.is_host { " as host" } else { "" }
                    );
                    let mut m = metrics.write();
                    m.peer_joined(&session_id, &peer_id, outcome.created);
                    m.set_counts(registry.session_count(), registry.peer_count());
                    *membership = Some(Membership { session_id, peer_id });
                }
                Err(e) => {
                    info!("Rejected {} from {}: {}", peer_id, session_id, e);
                    metrics.write().join_rejected(&session_id, &peer_id, e.code());
                    let _ = tx.send(SignalMessage::error(e.code(), e.to_string()));
                }
            }
        }

        SignalMessage::Heartbeat => {
            let _ = tx.send(SignalMessage::HeartbeatAck);
        }

        ref relayed @ (SignalMessage::WebrtcOffer(_)
        | SignalMessage::WebrtcAnswer(_)
        | SignalMessage::WebrtcIceCandidate(_)) => {
            let Some(member) = membership.as_ref() else {
                debug!("Dropping {} from a connection that has not joined", relayed.kind());
                return;
            };
            if registry.relay(&member.session_id, &member.peer_id, relayed) {
                metrics.write().signal_relayed();
            }
        }

        SignalMessage::Checkpoint {
            version,
            state,
            media_id,
        } => {
            let Some(member) = membership.as_ref() else {
                return;
            };
            if registry.checkpoint(&member.session_id, &member.peer_id, version, state, media_id) {
                metrics.write().checkpoint_saved();
            }
        }

        SignalMessage::MediaChanged { media_id } => {
            let Some(member) = membership.as_ref() else {
                return;
            };
            if registry.change_media(&member.session_id, &member.peer_id, &media_id) {
                metrics
                    .write()
                    .log(LogLevel::Session, format!("{} now plays {}", member.session_id, media_id));
            }
        }

        other => debug!("Ignoring {} from client", other.kind()),
    }
}

/// Run with plain logging (no dashboard)
pub async fn run_with_logging(
    config: RelayConfig,
    registry: Arc<SessionRegistry>,
    metrics: Arc<RwLock<Metrics>>,
) -> Result<(), Box<dyn Error>> {
    // Initialize tracing for logging mode
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("syncwatch_relay=info".parse()?)
                .add_directive("syncwatch_core=info".parse()?),
        )
        .init();

    run(config, registry, metrics).await
}
