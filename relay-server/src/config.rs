//! Relay configuration from the environment

use std::path::PathBuf;

/// Default checkpoint directory name
const CHECKPOINT_DIR_NAME: &str = "checkpoints";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
    pub port: u16,
    pub checkpoint_dir: PathBuf,
}

impl RelayConfig {
    /// `BIND_ADDR`, `PORT` and `CHECKPOINT_DIR`, with defaults for anything unset
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let bind_addr = lookup("BIND_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = lookup("PORT").and_then(|p| p.parse().ok()).unwrap_or(3001u16);
        let checkpoint_dir = lookup("CHECKPOINT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_checkpoint_dir);

        Self {
            bind_addr,
            port,
            checkpoint_dir,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

/// Same directory as the executable, or the current dir
fn default_checkpoint_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CHECKPOINT_DIR_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::from_lookup(|_| None);
        assert_eq!(config.listen_addr(), "0.0.0.0:3001");
        assert!(config.checkpoint_dir.ends_with(CHECKPOINT_DIR_NAME));
    }

    #[test]
    fn test_overrides_and_bad_port() {
        let config = RelayConfig::from_lookup(|key| match key {
            "BIND_ADDR" => Some("127.0.0.1".into()),
            "PORT" => Some("not-a-port".into()),
            "CHECKPOINT_DIR" => Some("/var/lib/syncwatch".into()),
            _ => None,
        });
        assert_eq!(config.listen_addr(), "127.0.0.1:3001");
        assert_eq!(config.checkpoint_dir, PathBuf::from("/var/lib/syncwatch"));
    }
}
