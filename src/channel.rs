//! Routing of per-table capture streams into one bounded apply queue.

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::capture::CaptureEngine;
use crate::checkpoint::Checkpoint;
use crate::datastore::{SourceConnection, TargetConnection};
use crate::event::{ChangeEvent, TableRef};
use crate::mapping::{TableMapping, ValidatedMapping};
use crate::metrics::SubscriptionMetrics;
use crate::{Error, Result};

/// One source, one target and the tables between them, bound to a
/// subscription.
///
/// Capture tasks push into a queue of fixed capacity and wait when it is
/// full. Order is kept per table; tables interleave freely.
pub struct Channel {
    name: String,
    subscription: String,
    capture: CaptureEngine,
    tables: Vec<ValidatedMapping>,
    queue_capacity: usize,
    metrics: Arc<SubscriptionMetrics>,
    failures: mpsc::UnboundedSender<Error>,
    active: Option<Active>,
}

struct Active {
    tasks: Vec<JoinHandle<()>>,
    // Keeps the queue open while no table is captured.
    _sender: mpsc::Sender<ChangeEvent>,
}

impl Channel {
    pub fn new(
        name: impl Into<String>,
        subscription: impl Into<String>,
        capture: CaptureEngine,
        tables: Vec<ValidatedMapping>,
        queue_capacity: usize,
        metrics: Arc<SubscriptionMetrics>,
        failures: mpsc::UnboundedSender<Error>,
    ) -> Self {
        Self {
            name: name.into(),
            subscription: subscription.into(),
            capture,
            tables,
            queue_capacity: queue_capacity.max(1),
            metrics,
            failures,
            active: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Tables that get a capture task.
    pub fn captured_tables(&self) -> Vec<TableRef> {
        self.tables
            .iter()
            .filter(|m| m.mapping().capture_enabled)
            .map(|m| m.source().clone())
            .collect()
    }

    /// Starts one capture task per capture-enabled table, each resuming
    /// after its checkpointed position.
    ///
    /// Returns the consuming end of the queue, or `None` when the channel
    /// is already active.
    pub fn activate(&mut self, checkpoint: &Checkpoint) -> Option<mpsc::Receiver<ChangeEvent>> {
        if self.active.is_some() {
            debug!(channel = %self.name, "Channel already active");
            return None;
        }

        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let tasks = self
            .captured_tables()
            .into_iter()
            .map(|table| {
                let position = checkpoint.position(&table);
                let stream = self
                    .capture
                    .start_capture(&self.subscription, table.clone(), position);
                let sender = sender.clone();
                let metrics = self.metrics.clone();
                let failures = self.failures.clone();
                tokio::spawn(async move {
                    let mut stream = stream;
                    while let Some(item) = stream.next().await {
                        match item {
                            Ok(event) => {
                                metrics.record_captured();
                                if sender.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                error!(table = %table, "Capture failed: {}", e);
                                let _ = failures.send(e);
                                break;
                            }
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        info!(
            channel = %self.name,
            subscription = %self.subscription,
            tables = tasks.len(),
            mode = %self.capture.mode(),
            "Channel activated"
        );
        self.active = Some(Active {
            tasks,
            _sender: sender,
        });
        Some(receiver)
    }

    /// Cancels capture immediately. Events not yet applied are captured
    /// again on the next activation.
    pub fn deactivate(&mut self) {
        if let Some(active) = self.active.take() {
            for task in &active.tasks {
                task.abort();
            }
            info!(channel = %self.name, "Channel deactivated");
        }
    }
}

/// Validates every table of a channel against the live source and target
/// schemas.
///
/// A table missing on either side is a schema mismatch, except on the
/// target of a table that is never applied.
pub async fn validate_tables(
    tables: &[TableMapping],
    source: &dyn SourceConnection,
    target: &dyn TargetConnection,
) -> Result<Vec<ValidatedMapping>> {
    let mut validated = Vec::with_capacity(tables.len());
    for mapping in tables {
        let source_table = mapping.source();
        let source_schema = match source.describe_table(&source_table).await {
            Ok(schema) => schema,
            Err(Error::NotFound { .. }) => {
                return Err(Error::schema_mismatch(
                    &source_table,
                    "source table does not exist",
                ))
            }
            Err(e) => return Err(e),
        };

        let target_table = mapping.target();
        let target_schema = match target.describe_table(&target_table).await {
            Ok(schema) => schema,
            Err(Error::NotFound { .. }) if !mapping.apply_enabled => None,
            Err(Error::NotFound { .. }) => {
                return Err(Error::schema_mismatch(
                    &target_table,
                    "target table does not exist",
                ))
            }
            Err(e) => return Err(e),
        };

        let table = ValidatedMapping::validate(mapping, &source_schema, target_schema.as_ref())?;
        debug!(source = %table.source(), target = %table.target(), "Validated table mapping");
        validated.push(table);
    }
    Ok(validated)
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.deactivate();
    }
}
