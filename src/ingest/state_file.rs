//! On-disk persistence of [`ClientState`].

use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::Result;
use crate::model::ClientState;

/// JSON file holding the scheduler's cadence between runs.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted state. Missing and unreadable files both mean
    /// "no prior state".
    pub async fn load(&self) -> Option<ClientState> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no saved poll state, starting fresh");
                return None;
            }
            Err(e) => {
                warn!(path = %self.path.display(), "cannot read poll state, starting fresh: {e}");
                return None;
            }
        };

        match serde_json::from_slice(&raw) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(path = %self.path.display(), "corrupt poll state, starting fresh: {e}");
                None
            }
        }
    }

    /// Replace the state file. Writes a sibling temp file and renames it over
    /// the old one so a crash never leaves a half-written document.
    pub async fn save(&self, state: &ClientState) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::new(dir.path().join("nested").join("state.json"));
        let state = ClientState {
            next_poll_time: Utc.timestamp_opt(1_700_000_120, 0).unwrap(),
            poll_interval_seconds: 120,
            last_successful_poll_time: Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap()),
        };

        file.save(&state).await.unwrap();
        assert_eq!(file.load().await, Some(state));
        assert!(!dir.path().join("nested").join("state.json.tmp").exists());
    }

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(StateFile::new(dir.path().join("absent.json")).load().await, None);
    }

    #[tokio::test]
    async fn corrupt_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, b"{\"next_poll_time_ts\": \"later\"}").await.unwrap();
        assert_eq!(StateFile::new(path).load().await, None);
    }
}
