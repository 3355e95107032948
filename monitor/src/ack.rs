//! Persistence of the last acknowledged denial across restarts.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::fsutil::atomic_write;
use crate::model::RecordId;

#[derive(Debug, thiserror::Error)]
pub enum AckError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AckState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_acknowledged_record_id: Option<RecordId>,
}

/// Small JSON state file holding the last acknowledged record identity.
pub struct AckStore {
    path: PathBuf,
}

impl AckStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored identity; a missing or unreadable file means none.
    pub fn load(&self) -> Option<RecordId> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("Cannot read {}: {e}", self.path.display());
                return None;
            }
        };
        match serde_json::from_slice::<AckState>(&bytes) {
            Ok(state) => state.last_acknowledged_record_id,
            Err(e) => {
                tracing::warn!("Ignoring malformed {}: {e}", self.path.display());
                None
            }
        }
    }

    pub fn save(&self, id: &RecordId) -> Result<(), AckError> {
        let state = AckState {
            last_acknowledged_record_id: Some(id.clone()),
        };
        let json = serde_json::to_vec_pretty(&state)?;
        atomic_write(&self.path, &json)?;
        Ok(())
    }
}
