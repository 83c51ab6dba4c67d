//! Checkpoint persistence for resuming replication after a restart.
//!
//! The standby loop publishes every position it acknowledges to the server.
//! [`CheckpointManager::follow`] writes those positions to a small JSON file
//! so the next run can ask the server to start from the same place.
//!
//! # Example
//!
//! ```rust,no_run
//! use pg_logrepl::checkpoint::{Checkpoint, CheckpointManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = CheckpointManager::new("checkpoint.json");
//!
//!     // Load existing checkpoint
//!     if let Some(checkpoint) = manager.load().await? {
//!         println!("Resuming from LSN: {}", checkpoint.lsn);
//!     }
//!
//!     // Save new checkpoint
//!     let checkpoint = Checkpoint::new("gizmo_slot", "16/B374D848".parse()?);
//!     manager.save(&checkpoint).await?;
//!
//!     Ok(())
//! }
//! ```

use crate::postgres::Lsn;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// The last position acknowledged to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Slot that acknowledged the position
    pub slot: String,
    /// Acknowledged LSN, in `X/Y` form
    pub lsn: Lsn,
    /// When this checkpoint was written
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Checkpoint {
    /// Creates a new checkpoint with the current timestamp.
    ///
    /// # Example
    ///
    /// ```rust
    /// use pg_logrepl::checkpoint::Checkpoint;
    /// use pg_logrepl::postgres::Lsn;
    ///
    /// let checkpoint = Checkpoint::new("gizmo_slot", Lsn(0x1234_0000_5678));
    /// assert_eq!(checkpoint.lsn.to_string(), "1234/5678");
    /// ```
    pub fn new(slot: impl Into<String>, lsn: Lsn) -> Self {
        Self {
            slot: slot.into(),
            lsn,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Manages checkpoint persistence to disk.
///
/// Writes go to a temporary file that is synced and then renamed over the
/// checkpoint, so a crash never leaves a partially written file behind.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    file_path: PathBuf,
}

impl CheckpointManager {
    pub fn new(checkpoint_path: impl AsRef<Path>) -> Self {
        Self {
            file_path: checkpoint_path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Loads the checkpoint if the file exists.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file exists but cannot be read or does not hold a
    /// valid checkpoint.
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        if !fs::try_exists(&self.file_path).await? {
            debug!("No checkpoint file found at {:?}", self.file_path);
            return Ok(None);
        }

        let content = fs::read_to_string(&self.file_path).await.map_err(|e| {
            error!("Failed to read checkpoint file: {}", e);
            Error::Io(e)
        })?;

        match serde_json::from_str::<Checkpoint>(&content) {
            Ok(checkpoint) => {
                info!(
                    "Loaded checkpoint: slot={}, LSN={}, timestamp={}",
                    checkpoint.slot, checkpoint.lsn, checkpoint.timestamp
                );
                Ok(Some(checkpoint))
            }
            Err(e) => {
                error!("Failed to parse checkpoint file: {}", e);
                Err(Error::Config(format!(
                    "Invalid checkpoint file {:?}: {}",
                    self.file_path, e
                )))
            }
        }
    }

    /// Saves the checkpoint atomically.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        debug!("Saving checkpoint: LSN={}", checkpoint.lsn);

        let temp_path = self.file_path.with_extension("tmp");

        let json = serde_json::to_string_pretty(checkpoint)?;
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.file_path).await?;

        debug!("Checkpoint saved successfully");
        Ok(())
    }

    /// Deletes the checkpoint file if it exists.
    pub async fn delete(&self) -> Result<()> {
        if fs::try_exists(&self.file_path).await? {
            fs::remove_file(&self.file_path).await?;
            info!("Deleted checkpoint file");
        }
        Ok(())
    }

    /// Persists every new position seen on `positions` until the sender is
    /// dropped, and returns the last position written.
    ///
    /// A failed write is logged and the next position is tried anyway, so a
    /// transient I/O problem costs at most the positions published while it
    /// lasts.
    pub async fn follow(&self, slot: &str, mut positions: watch::Receiver<Lsn>) -> Option<Lsn> {
        let mut last = None;
        while positions.changed().await.is_ok() {
            let lsn = *positions.borrow_and_update();
            if last == Some(lsn) {
                continue;
            }
            match self.save(&Checkpoint::new(slot, lsn)).await {
                Ok(()) => last = Some(lsn),
                Err(e) => error!(
                    slot,
                    lsn = %lsn,
                    path = ?self.file_path,
                    "Failed to persist checkpoint: {}",
                    e
                ),
            }
        }
        last
    }
}
