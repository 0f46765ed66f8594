//! Snapshot Storage
//!
//! Reads and writes the list of desired tunnels. The file is a flat JSON
//! array, fully rewritten after every registry mutation.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Default snapshot file name, relative to the working directory
pub const DEFAULT_SNAPSHOT_FILE: &str = "saved-forwards.json";

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One persisted tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    /// `"alias:localPort:remotePort"`
    pub connection_key: String,
    /// Host alias
    pub host: String,
    pub local_port: u16,
    pub remote_port: u16,
    #[serde(default = "default_remote_host")]
    pub remote_host: String,
    pub start_time: DateTime<Utc>,
}

fn default_remote_host() -> String {
    "localhost".to_string()
}

/// Durable record of desired tunnels
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Replace the stored list with `entries`
    async fn save(&self, entries: &[SnapshotEntry]) -> Result<(), StorageError>;

    /// Load the stored list; empty when nothing was saved yet
    async fn load(&self) -> Result<Vec<SnapshotEntry>, StorageError>;
}

/// JSON file snapshot store
#[derive(Debug, Clone)]
pub struct JsonSnapshotStore {
    path: PathBuf,
}

impl JsonSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }

    /// Copy the current file aside with a timestamp suffix
    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        let backup_path = self.path.with_extension(format!(
            "json.backup.{}",
            Utc::now().format("%Y%m%d_%H%M%S")
        ));

        if fs::metadata(&self.path).await.is_ok() {
            fs::copy(&self.path, &backup_path).await?;
        }

        Ok(backup_path)
    }
}

impl Default for JsonSnapshotStore {
    fn default() -> Self {
        Self::new(DEFAULT_SNAPSHOT_FILE)
    }
}

#[async_trait]
impl SnapshotStore for JsonSnapshotStore {
    async fn save(&self, entries: &[SnapshotEntry]) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        // Write to temp file first, then rename (atomic write)
        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(entries)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;

        tracing::debug!("Saved {} forward(s) to {:?}", entries.len(), self.path);
        Ok(())
    }

    async fn load(&self) -> Result<Vec<SnapshotEntry>, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No saved forwards file at {:?}", self.path);
                return Ok(Vec::new());
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        match serde_json::from_str::<Vec<SnapshotEntry>>(&contents) {
            Ok(entries) => {
                tracing::info!("Loaded {} saved forward(s) from {:?}", entries.len(), self.path);
                Ok(entries)
            }
            Err(e) => {
                tracing::warn!("Saved forwards file corrupted: {}", e);
                match self.backup().await {
                    Ok(backup_path) => tracing::warn!(
                        "Corrupted snapshot backed up to {:?}, starting empty",
                        backup_path
                    ),
                    Err(backup_err) => {
                        tracing::error!("Failed to backup corrupted snapshot: {}", backup_err)
                    }
                }
                Ok(Vec::new())
            }
        }
    }
}
