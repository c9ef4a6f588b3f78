//! Checkpoint management for resumable, at-least-once replication.
//!
//! A checkpoint records, per table, the last source sequence number whose
//! change has been committed to the target (or dead-lettered). Capture
//! resumes strictly after it; the apply side is the only writer.
//!
//! # Example
//!
//! ```rust,no_run
//! use cdc_relay::checkpoint::{Checkpoint, CheckpointManager};
//! use cdc_relay::event::{SequenceNumber, TableRef};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = CheckpointManager::new("users-sub.checkpoint.json");
//!
//!     // Load existing checkpoint
//!     if let Some(checkpoint) = manager.load().await? {
//!         println!("Resuming {} tables", checkpoint.tables.len());
//!     }
//!
//!     // Save new checkpoint
//!     let mut checkpoint = Checkpoint::new("users-sub");
//!     checkpoint.advance(&TableRef::new("public", "users"), SequenceNumber::new(42, 0));
//!     manager.save(&checkpoint).await?;
//!
//!     Ok(())
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info};

use crate::event::{SequenceNumber, TableRef};
use crate::{Error, Result};

/// Replication progress of one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub subscription: String,
    /// Last committed sequence per `schema.table`
    pub tables: BTreeMap<String, SequenceNumber>,
    /// Capture time of the newest committed event
    pub last_captured_at: Option<DateTime<Utc>>,
    /// Number of events committed since the subscription was created
    pub applied_count: u64,
    /// The timestamp when this checkpoint was written
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    /// Creates an empty checkpoint with the current timestamp.
    pub fn new(subscription: impl Into<String>) -> Self {
        Self {
            subscription: subscription.into(),
            tables: BTreeMap::new(),
            last_captured_at: None,
            applied_count: 0,
            timestamp: Utc::now(),
        }
    }

    /// Committed position of a table, zero when nothing was committed yet.
    pub fn position(&self, table: &TableRef) -> SequenceNumber {
        self.tables
            .get(&table.to_string())
            .copied()
            .unwrap_or_default()
    }

    pub fn contains(&self, table: &TableRef) -> bool {
        self.tables.contains_key(&table.to_string())
    }

    /// Moves a table forward, or records it the first time it is seen.
    /// Returns false when the table is already at or past `sequence`.
    pub fn advance(&mut self, table: &TableRef, sequence: SequenceNumber) -> bool {
        match self.tables.get_mut(&table.to_string()) {
            Some(current) if sequence <= *current => false,
            Some(current) => {
                *current = sequence;
                true
            }
            None => {
                self.tables.insert(table.to_string(), sequence);
                true
            }
        }
    }

    /// Lowest committed position across the given tables. A table with no
    /// entry counts as zero.
    pub fn low_watermark<'a>(
        &self,
        tables: impl IntoIterator<Item = &'a TableRef>,
    ) -> Option<SequenceNumber> {
        tables.into_iter().map(|t| self.position(t)).min()
    }
}

/// Manages checkpoint persistence to disk.
///
/// The `CheckpointManager` handles atomic writes to ensure that checkpoints
/// are never corrupted, even if the process crashes during a write operation.
pub struct CheckpointManager {
    file_path: PathBuf,
}

impl CheckpointManager {
    /// Creates a new checkpoint manager with the specified file path.
    pub fn new(checkpoint_path: impl AsRef<Path>) -> Self {
        Self {
            file_path: checkpoint_path.as_ref().to_path_buf(),
        }
    }

    /// Checkpoint file of a subscription inside the engine state directory.
    pub fn for_subscription(state_dir: impl AsRef<Path>, subscription: &str) -> Self {
        Self::new(
            state_dir
                .as_ref()
                .join(format!("{}.checkpoint.json", subscription)),
        )
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Loads checkpoint from disk if it exists.
    ///
    /// Returns `None` if the checkpoint file doesn't exist, which typically
    /// means this is the first run or the checkpoint was deleted.
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        let checkpoint: Option<Checkpoint> = read_json(&self.file_path).await?;
        if let Some(checkpoint) = &checkpoint {
            info!(
                subscription = %checkpoint.subscription,
                tables = checkpoint.tables.len(),
                "Loaded checkpoint from {}",
                checkpoint.timestamp
            );
        }
        Ok(checkpoint)
    }

    /// Saves checkpoint to disk atomically.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        debug!(
            subscription = %checkpoint.subscription,
            applied = checkpoint.applied_count,
            "Saving checkpoint"
        );
        write_json_atomic(&self.file_path, checkpoint).await
    }

    /// Deletes the checkpoint file if it exists.
    ///
    /// This is useful for resetting replication to start from the beginning.
    pub async fn delete(&self) -> Result<()> {
        if fs::try_exists(&self.file_path).await? {
            fs::remove_file(&self.file_path).await?;
            info!("Deleted checkpoint file {:?}", self.file_path);
        }
        Ok(())
    }
}

/// Shared checkpoint state between capture (reader) and apply (writer).
///
/// Every commit is persisted before it becomes visible to readers, so a
/// reader never observes a position that would be lost on crash.
pub struct CheckpointTracker {
    manager: CheckpointManager,
    tx: watch::Sender<Checkpoint>,
    write_lock: Mutex<()>,
}

impl CheckpointTracker {
    /// Loads the persisted checkpoint, or starts an empty one.
    pub async fn open(manager: CheckpointManager, subscription: &str) -> Result<Self> {
        let checkpoint = match manager.load().await? {
            Some(checkpoint) => checkpoint,
            None => Checkpoint::new(subscription),
        };
        let (tx, _) = watch::channel(checkpoint);
        Ok(Self {
            manager,
            tx,
            write_lock: Mutex::new(()),
        })
    }

    pub fn current(&self) -> Checkpoint {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Checkpoint> {
        self.tx.subscribe()
    }

    /// Advances tables monotonically, persists, then publishes.
    ///
    /// Positions behind the committed ones are ignored.
    pub async fn commit(
        &self,
        advances: &BTreeMap<TableRef, SequenceNumber>,
        applied: u64,
        last_captured_at: Option<DateTime<Utc>>,
    ) -> Result<Checkpoint> {
        let _guard = self.write_lock.lock().await;

        let mut next = self.current();
        let mut moved = false;
        for (table, sequence) in advances {
            moved |= next.advance(table, *sequence);
        }
        if !moved && applied == 0 {
            return Ok(next);
        }
        next.applied_count += applied;
        if let Some(captured_at) = last_captured_at {
            next.last_captured_at = Some(match next.last_captured_at {
                Some(existing) if existing > captured_at => existing,
                _ => captured_at,
            });
        }
        next.timestamp = Utc::now();

        if let Err(e) = self.manager.save(&next).await {
            error!("Failed to persist checkpoint: {}", e);
            return Err(e);
        }
        self.tx.send_replace(next.clone());
        Ok(next)
    }
}

/// Writes JSON to a temp file, syncs it and renames it into place.
pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let temp_path = path.with_extension("tmp");

    let json = serde_json::to_string_pretty(value)?;
    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(json.as_bytes()).await?;
    file.sync_all().await?;

    fs::rename(&temp_path, path).await?;
    Ok(())
}

pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !fs::try_exists(path).await? {
        debug!("No state file found at {:?}", path);
        return Ok(None);
    }

    let content = fs::read_to_string(path).await?;
    serde_json::from_str(&content).map(Some).map_err(|e| {
        error!("Failed to parse state file {:?}: {}", path, e);
        Error::Serialization(e)
    })
}
