use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::SubscriptionState;
use crate::checkpoint::{read_json, write_json_atomic, Checkpoint};
use crate::error::ErrorKind;
use crate::event::SequenceNumber;
use crate::metrics::MetricsSnapshot;
use crate::{Error, Result};

/// Last known state of a subscription. Always answerable without
/// touching the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionStatus {
    pub name: String,
    pub state: SubscriptionState,
    /// Committed position per `schema.table`
    pub last_checkpoint: BTreeMap<String, SequenceNumber>,
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    pub lag_ms: u64,
    /// Lag is above the channel's latency tolerance
    pub lagging: bool,
    pub error: Option<StatusError>,
    pub metrics: MetricsSnapshot,
    pub updated_at: DateTime<Utc>,
}

/// The error that moved a subscription to `failed`, with the positions
/// it was committed at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusError {
    pub kind: ErrorKind,
    pub message: String,
    pub checkpoint: BTreeMap<String, SequenceNumber>,
}

impl SubscriptionStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: SubscriptionState::Created,
            last_checkpoint: BTreeMap::new(),
            last_checkpoint_at: None,
            lag_ms: 0,
            lagging: false,
            error: None,
            metrics: MetricsSnapshot::default(),
            updated_at: Utc::now(),
        }
    }

    pub(crate) fn set_checkpoint(&mut self, checkpoint: &Checkpoint) {
        self.last_checkpoint = checkpoint.tables.clone();
        self.last_checkpoint_at = Some(checkpoint.timestamp);
    }

    pub(crate) fn set_error(&mut self, error: &Error, checkpoint: &Checkpoint) {
        self.error = Some(StatusError {
            kind: error.kind(),
            message: error.to_string(),
            checkpoint: checkpoint.tables.clone(),
        });
    }
}

/// Persists the status so it can be read while the engine is down.
pub struct StatusStore {
    path: PathBuf,
}

impl StatusStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn for_subscription(state_dir: impl AsRef<Path>, subscription: &str) -> Self {
        Self::new(state_dir.as_ref().join(format!("{}.status.json", subscription)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Option<SubscriptionStatus>> {
        read_json(&self.path).await
    }

    pub async fn save(&self, status: &SubscriptionStatus) -> Result<()> {
        write_json_atomic(&self.path, status).await
    }
}
