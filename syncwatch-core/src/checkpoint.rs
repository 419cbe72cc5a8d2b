//! Persisted playback checkpoints
//!
//! Peers keep a local checkpoint per session so a reload can offer to resume.
//! The relay keeps the host's last command per session to seed later rejoins.
//! Both use the same record and the same key-value store interface.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::sync::PlaybackState;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Corrupt checkpoint: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// A saved playback state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRecord {
    pub version: u64,
    pub state: PlaybackState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_id: Option<String>,
    /// Local epoch milliseconds when the record was written
    pub saved_at: u64,
}

impl CheckpointRecord {
    /// Age of the record relative to `now_ms`
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.saved_at)
    }
}

/// Key-value persistence for checkpoints, keyed by session id
pub trait CheckpointStore: Send + Sync {
    fn put(&self, session_id: &str, record: &CheckpointRecord) -> Result<(), StoreError>;
    fn get(&self, session_id: &str) -> Result<Option<CheckpointRecord>, StoreError>;
    fn remove(&self, session_id: &str) -> Result<(), StoreError>;
}

/// One JSON file per session in a directory
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        let name: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn put(&self, session_id: &str, record: &CheckpointRecord) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(session_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(record)?)?;
        fs::rename(&tmp, &path)?;
        debug!("Saved checkpoint for {} to {:?}", session_id, path);
        Ok(())
    }

    fn get(&self, session_id: &str) -> Result<Option<CheckpointRecord>, StoreError> {
        match fs::read(self.path_for(session_id)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, session_id: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(session_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process store; nothing survives a restart
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    records: Mutex<HashMap<String, CheckpointRecord>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn put(&self, session_id: &str, record: &CheckpointRecord) -> Result<(), StoreError> {
        self.records.lock().insert(session_id.to_string(), record.clone());
        Ok(())
    }

    fn get(&self, session_id: &str) -> Result<Option<CheckpointRecord>, StoreError> {
        Ok(self.records.lock().get(session_id).cloned())
    }

    fn remove(&self, session_id: &str) -> Result<(), StoreError> {
        self.records.lock().remove(session_id);
        Ok(())
    }
}
