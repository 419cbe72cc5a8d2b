//! Session registry
//!
//! Tracks who is in which session and who hosts it, relays connection-setup
//! messages between two named peers, and keeps the host's last checkpoint.
//! Each session sits behind its own lock; the map lock is only held for
//! lookup, insert and remove.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use syncwatch_core::checkpoint::{CheckpointRecord, CheckpointStore};
use syncwatch_core::clock::current_time_ms;
use syncwatch_core::network::{SignalMessage, PASSWORD_REQUIRED};
use syncwatch_core::sync::PlaybackState;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outbound queue of one connected peer
pub type PeerSender = mpsc::UnboundedSender<SignalMessage>;

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("Password required")]
    PasswordRequired,
}

impl RegistryError {
    /// Wire error code
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::PasswordRequired => PASSWORD_REQUIRED,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    pub created: bool,
    pub is_host: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub new_host: Option<String>,
    pub destroyed: bool,
}

/// Point-in-time view of one session for the dashboard
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub session_id: String,
    pub host: String,
    pub members: usize,
    pub version: u64,
    pub playing: bool,
    pub media_id: Option<String>,
    pub locked: bool,
}

struct SessionEntry {
    host: String,
    /// Ordered by peer id; the greatest id wins host elections
    members: BTreeMap<String, PeerSender>,
    version: u64,
    state: PlaybackState,
    media_id: Option<String>,
    password: Option<String>,
    /// Set once the last member leaves; a joiner racing with removal retries
    closed: bool,
}

impl SessionEntry {
    fn new(seed: Option<CheckpointRecord>) -> Self {
        let (version, state, media_id) = match seed {
            Some(record) => (record.version, record.state, record.media_id),
            None => (0, PlaybackState::default(), None),
        };
        Self {
            host: String::new(),
            members: BTreeMap::new(),
            version,
            state,
            media_id,
            password: None,
            closed: false,
        }
    }

    fn peers(&self) -> Vec<String> {
        self.members.keys().cloned().collect()
    }

    /// Send to every member except `skip`
    fn broadcast(&self, message: &SignalMessage, skip: Option<&str>) {
        for (peer_id, tx) in &self.members {
            if Some(peer_id.as_str()) == skip {
                continue;
            }
            if tx.send(message.clone()).is_err() {
                debug!("Dropping {} for disconnected peer {}", message.kind(), peer_id);
            }
        }
    }
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionEntry>>>>,
    store: Arc<dyn CheckpointStore>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            store,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn peer_count(&self) -> usize {
        let sessions: Vec<_> = self.sessions.read().values().cloned().collect();
        sessions.iter().map(|s| s.lock().members.len()).sum()
    }

    /// Sessions ordered by id
    pub fn summaries(&self) -> Vec<SessionSummary> {
        let sessions: Vec<_> = self
            .sessions
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
            .collect();
        let mut out: Vec<SessionSummary> = sessions
            .into_iter()
            .map(|(session_id, entry)| {
                let entry = entry.lock();
                SessionSummary {
                    session_id,
                    host: entry.host.clone(),
                    members: entry.members.len(),
                    version: entry.version,
                    playing: entry.state.playing,
                    media_id: entry.media_id.clone(),
                    locked: entry.password.is_some(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        out
    }

    fn get(&self, session_id: &str) -> Option<Arc<Mutex<SessionEntry>>> {
        self.sessions.read().get(session_id).cloned()
    }

    fn load_seed(&self, session_id: &str) -> Option<CheckpointRecord> {
        match self.store.get(session_id) {
            Ok(record) => record,
            Err(e) => {
                warn!("Ignoring unreadable checkpoint for {}: {}", session_id, e);
                None
            }
        }
    }

    /// Admit a peer. The first joiner creates the session and hosts it.
    /// On success the joiner gets `session-state` and the others `peer-joined`.
    pub fn join(
        &self,
        session_id: &str,
        peer_id: &str,
        password: Option<String>,
        media_id: Option<String>,
        sender: PeerSender,
    ) -> Result<JoinOutcome, RegistryError> {
        let password = password.filter(|p| !p.is_empty());
        let mut seed = if self.get(session_id).is_none() {
            self.load_seed(session_id)
        } else {
            None
        };

        loop {
            let entry = {
                let mut sessions = self.sessions.write();
                let entry = sessions
                    .entry(session_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(SessionEntry::new(seed.take()))));
                Arc::clone(entry)
            };

            let mut session = entry.lock();
            if session.closed {
                continue;
            }

            let created = session.members.is_empty();
            if created {
                session.host = peer_id.to_string();
                session.password = password.clone();
                if media_id.is_some() {
                    session.media_id = media_id.clone();
                }
                info!("Session {} created by {}", session_id, peer_id);
            } else if let Some(expected) = &session.password {
                if password.as_ref() != Some(expected) {
                    info!("Rejecting {} from {}: password mismatch", peer_id, session_id);
                    return Err(RegistryError::PasswordRequired);
                }
            }

            if session.members.insert(peer_id.to_string(), sender.clone()).is_some() {
                debug!("{} rejoined {} on a new connection", peer_id, session_id);
            }
            let peers = session.peers();
            let is_host = session.host == peer_id;

            let _ = sender.send(SignalMessage::SessionState {
                session_id: session_id.to_string(),
                host: session.host.clone(),
                is_host,
                peers: peers.clone(),
                media_id: session.media_id.clone(),
                version: session.version,
                state: session.state,
            });
            session.broadcast(
                &SignalMessage::PeerJoined {
                    peer_id: peer_id.to_string(),
                    peers,
                },
                Some(peer_id),
            );

            return Ok(JoinOutcome { created, is_host });
        }
    }

    /// Remove a peer's membership. `sender` must be the connection that joined,
    /// so a stale connection closing cannot evict a newer one.
    pub fn leave(&self, session_id: &str, peer_id: &str, sender: &PeerSender) -> Option<LeaveOutcome> {
        let entry = self.get(session_id)?;
        let mut session = entry.lock();

        match session.members.get(peer_id) {
            Some(current) if current.same_channel(sender) => {}
            _ => return None,
        }
        session.members.remove(peer_id);

        if session.members.is_empty() {
            session.closed = true;
            drop(session);

            let mut sessions = self.sessions.write();
            if sessions.get(session_id).is_some_and(|s| Arc::ptr_eq(s, &entry)) {
                sessions.remove(session_id);
            }
            info!("Session {} destroyed", session_id);
            return Some(LeaveOutcome {
                new_host: None,
                destroyed: true,
            });
        }

        let mut new_host = None;
        if session.host == peer_id {
            if let Some(elected) = session.members.keys().next_back().cloned() {
                info!("Host {} left {}, electing {}", peer_id, session_id, elected);
                session.host = elected.clone();
                session.broadcast(
                    &SignalMessage::HostChanged {
                        new_host: elected.clone(),
                        peers: session.peers(),
                    },
                    None,
                );
                new_host = Some(elected);
            }
        }

        session.broadcast(
            &SignalMessage::PeerLeft {
                peer_id: peer_id.to_string(),
                peers: session.peers(),
            },
            None,
        );

        Some(LeaveOutcome {
            new_host,
            destroyed: false,
        })
    }

    /// Forward an offer/answer/candidate to its target only. Returns false if
    /// the message could not be delivered.
    pub fn relay(&self, session_id: &str, from: &str, message: &SignalMessage) -> bool {
        let Some(signal) = message.relayed() else {
            return false;
        };
        let Some(target) = signal.target_peer_id.clone() else {
            debug!("Dropping {} from {} without target", message.kind(), from);
            return false;
        };
        let Some(forwarded) = message.with_relayed(signal.clone().forwarded_from(from)) else {
            return false;
        };
        let Some(entry) = self.get(session_id) else {
            return false;
        };

        let session = entry.lock();
        if !session.members.contains_key(from) {
            return false;
        }
        match session.members.get(&target) {
            Some(tx) => tx.send(forwarded).is_ok(),
            None => {
                debug!("Dropping {} for unknown peer {}", message.kind(), target);
                false
            }
        }
    }

    /// Accept the host's checkpoint if it is not older than what we have,
    /// then persist it.
    pub fn checkpoint(
        &self,
        session_id: &str,
        from: &str,
        version: u64,
        state: PlaybackState,
        media_id: Option<String>,
    ) -> bool {
        let Some(entry) = self.get(session_id) else {
            return false;
        };

        let record = {
            let mut session = entry.lock();
            if session.host != from {
                debug!("Ignoring checkpoint from non-host {}", from);
                return false;
            }
            if version < session.version {
                debug!("Ignoring stale checkpoint v{} (have v{})", version, session.version);
                return false;
            }
            session.version = version;
            session.state = state;
            if media_id.is_some() {
                session.media_id = media_id;
            }
            CheckpointRecord {
                version,
                state,
                media_id: session.media_id.clone(),
                saved_at: current_time_ms(),
            }
        };

        if let Err(e) = self.store.put(session_id, &record) {
            warn!("Failed to persist checkpoint for {}: {}", session_id, e);
        }
        true
    }

    /// Host switches media; everyone else is told
    pub fn change_media(&self, session_id: &str, from: &str, media_id: &str) -> bool {
        let Some(entry) = self.get(session_id) else {
            return false;
        };
        let mut session = entry.lock();
        if session.host != from {
            debug!("Ignoring media change from non-host {}", from);
            return false;
        }
        session.media_id = Some(media_id.to_string());
        session.broadcast(
            &SignalMessage::MediaChanged {
                media_id: media_id.to_string(),
            },
            Some(from),
        );
        true
    }
}
