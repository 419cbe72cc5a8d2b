//! Metrics tracking for the relay server

use chrono::{DateTime, Local};
use std::collections::VecDeque;

/// Maximum number of log entries to keep
const MAX_LOG_ENTRIES: usize = 100;

/// A log entry for the dashboard
#[derive(Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Connection,
    Session,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Connection => "CONN",
            LogLevel::Session => "SESSION",
        }
    }
}

/// Server metrics
pub struct Metrics {
    /// Server start time
    pub start_time: DateTime<Local>,

    /// Address the WebSocket listener is bound to
    pub listen_addr: String,

    /// Where session checkpoints are written
    pub checkpoint_dir: String,

    /// Open WebSocket connections
    pub connections: usize,

    /// Current number of sessions
    pub active_sessions: usize,

    /// Peak simultaneous sessions
    pub peak_sessions: usize,

    /// Peers admitted to a session
    pub connected_peers: usize,

    /// Peak simultaneous peers
    pub peak_peers: usize,

    /// Admissions since start
    pub total_joins: u64,

    /// Joins refused (wrong or missing password)
    pub rejected_joins: u64,

    /// Host re-elections after a host left
    pub host_elections: u64,

    /// Offers, answers and candidates forwarded
    pub signals_relayed: u64,

    /// Host checkpoints accepted
    pub checkpoints_saved: u64,

    /// Log entries
    pub logs: VecDeque<LogEntry>,

    /// Server status
    pub status: ServerStatus,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum ServerStatus {
    Starting,
    Running,
    Error,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Local::now(),
            listen_addr: String::new(),
            checkpoint_dir: String::new(),
            connections: 0,
            active_sessions: 0,
            peak_sessions: 0,
            connected_peers: 0,
            peak_peers: 0,
            total_joins: 0,
            rejected_joins: 0,
            host_elections: 0,
            signals_relayed: 0,
            checkpoints_saved: 0,
            logs: VecDeque::with_capacity(MAX_LOG_ENTRIES),
            status: ServerStatus::Starting,
        }
    }

    /// Add a log entry
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        if self.logs.len() >= MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry {
            timestamp: Local::now(),
            level,
            message: message.into(),
        });
    }

    pub fn connection_opened(&mut self, addr: &str) {
        self.connections += 1;
        self.log(LogLevel::Connection, format!("Connected: {}", addr));
    }

    pub fn connection_closed(&mut self, addr: &str) {
        self.connections = self.connections.saturating_sub(1);
        self.log(LogLevel::Connection, format!("Disconnected: {}", addr));
    }

    /// Refresh session/peer gauges from the registry
    pub fn set_counts(&mut self, sessions: usize, peers: usize) {
        self.active_sessions = sessions;
        self.connected_peers = peers;
        self.peak_sessions = self.peak_sessions.max(sessions);
        self.peak_peers = self.peak_peers.max(peers);
    }

    pub fn peer_joined(&mut self, session_id: &str, peer_id: &str, created: bool) {
        self.total_joins += 1;
        let peer = truncate_peer_id(peer_id);
        if created {
            self.log(LogLevel::Session, format!("{} created {} (host)", peer, session_id));
        } else {
            self.log(LogLevel::Session, format!("{} joined {}", peer, session_id));
        }
    }

    pub fn join_rejected(&mut self, session_id: &str, peer_id: &str, reason: &str) {
        self.rejected_joins += 1;
        self.log(
            LogLevel::Warning,
            format!("Rejected {} from {}: {}", truncate_peer_id(peer_id), session_id, reason),
        );
    }

    pub fn peer_left(&mut self, session_id: &str, peer_id: &str, new_host: Option<&str>, destroyed: bool) {
        let peer = truncate_peer_id(peer_id);
        self.log(LogLevel::Session, format!("{} left {}", peer, session_id));
        if let Some(host) = new_host {
            self.host_elections += 1;
            self.log(
                LogLevel::Session,
                format!("{} is now host of {}", truncate_peer_id(host), session_id),
            );
        }
        if destroyed {
            self.log(LogLevel::Session, format!("Session {} closed", session_id));
        }
    }

    pub fn signal_relayed(&mut self) {
        self.signals_relayed += 1;
    }

    pub fn checkpoint_saved(&mut self) {
        self.checkpoints_saved += 1;
    }

    /// Get uptime as formatted string
    pub fn uptime(&self) -> String {
        let duration = Local::now().signed_duration_since(self.start_time);
        let secs = duration.num_seconds();

        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else {
            let hours = secs / 3600;
            let mins = (secs % 3600) / 60;
            format!("{}h {}m", hours, mins)
        }
    }
}

/// Truncate peer ID for display (show first and last few chars)
pub fn truncate_peer_id(peer_id: &str) -> String {
    let chars: Vec<char> = peer_id.chars().collect();
    if chars.len() > 16 {
        let head: String = chars[..8].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    } else {
        peer_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_is_capped() {
        let mut m = Metrics::new();
        for i in 0..(MAX_LOG_ENTRIES + 20) {
            m.log(LogLevel::Info, format!("entry {}", i));
        }
        assert_eq!(m.logs.len(), MAX_LOG_ENTRIES);
        assert_eq!(m.logs.front().map(|e| e.message.as_str()), Some("entry 20"));
    }

    #[test]
    fn test_counters() {
        let mut m = Metrics::new();
        m.set_counts(2, 5);
        m.set_counts(1, 3);
        assert_eq!((m.active_sessions, m.peak_sessions), (1, 2));
        assert_eq!((m.connected_peers, m.peak_peers), (3, 5));

        m.peer_joined("s", "a", true);
        m.join_rejected("s", "b", "password-required");
        m.peer_left("s", "a", Some("c"), false);
        assert_eq!(m.total_joins, 1);
        assert_eq!(m.rejected_joins, 1);
        assert_eq!(m.host_elections, 1);
    }

    #[test]
    fn test_truncate_peer_id() {
        assert_eq!(truncate_peer_id("short"), "short");
        assert_eq!(truncate_peer_id("0123456789abcdefXYZ"), "01234567...fXYZ");
    }
}
