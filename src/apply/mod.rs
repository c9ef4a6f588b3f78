//! Apply side of a subscription: batching, conflict handling, retries and
//! dead-lettering.
//!
//! The apply engine is the only writer of the subscription checkpoint. A
//! table's position moves only after its events were committed to the
//! target, deliberately discarded, dead-lettered or skipped.

pub mod batch;
pub mod conflict;
pub mod dead_letter;

pub use batch::{ApplyBatch, BatchSummary};
pub use conflict::{Conflict, ConflictResolver, Resolution, ResolverRegistry};
pub use dead_letter::DeadLetterRecord;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::checkpoint::CheckpointTracker;
use crate::datastore::memory::encode_key;
use crate::datastore::{RowWrite, TargetConnection, WriteOp};
use crate::event::{ChangeEvent, ChangeOperation, Row, SequenceNumber, TableRef};
use crate::mapping::{ConflictResolution, ValidatedMapping};
use crate::metrics::SubscriptionMetrics;
use crate::retry::Backoff;
use crate::{Error, Result};

/// How a batch reaches the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyMode {
    /// One target transaction per batch, when the target supports it
    #[default]
    Transaction,
    /// Every row on its own
    Row,
}

/// What happens to an event once its retries are used up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OnError {
    RouteToDlq,
    #[default]
    Stop,
    /// Continue without the event. Logged as data loss.
    Skip,
}

#[derive(Clone)]
pub struct ApplyOptions {
    pub subscription: String,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    /// Whether batches commit atomically
    pub transactional: bool,
    pub retry: Backoff,
    pub on_error: OnError,
    /// Policy for tables whose mapping sets none
    pub conflict_resolution: ConflictResolution,
    pub resolver: Option<Arc<dyn ConflictResolver>>,
}

impl fmt::Debug for ApplyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplyOptions")
            .field("subscription", &self.subscription)
            .field("batch_size", &self.batch_size)
            .field("batch_timeout", &self.batch_timeout)
            .field("transactional", &self.transactional)
            .field("retry", &self.retry)
            .field("on_error", &self.on_error)
            .field("conflict_resolution", &self.conflict_resolution)
            .field("resolver", &self.resolver.is_some())
            .finish()
    }
}

/// Outcome of replaying dead-lettered events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub replayed: usize,
    /// Events the conflict policy or a disabled table discarded
    pub discarded: usize,
    pub failed: usize,
}

/// The batch currently being applied, shared with the controller.
pub type InFlightBatch = Arc<Mutex<Option<BatchSummary>>>;

/// An event whose retries are used up.
#[derive(Debug)]
struct Failure {
    reason: String,
    attempts: u32,
    first_failed_at: DateTime<Utc>,
}

enum Plan {
    Write(Vec<RowWrite>),
    /// Handled without touching the target
    Skip,
}

#[derive(Default)]
struct Progress {
    advances: BTreeMap<TableRef, SequenceNumber>,
    handled: u64,
    written: u64,
    newest_captured_at: Option<DateTime<Utc>>,
}

impl Progress {
    fn record(&mut self, event: &ChangeEvent, written: bool) {
        let entry = self.advances.entry(event.table.clone()).or_default();
        if event.sequence > *entry {
            *entry = event.sequence;
        }
        self.handled += 1;
        if written {
            self.written += 1;
        }
        if self.newest_captured_at.map_or(true, |t| event.captured_at > t) {
            self.newest_captured_at = Some(event.captured_at);
        }
    }
}

/// Target rows as earlier events of the same batch leave them.
type Overlay = HashMap<(TableRef, String), Option<Row>>;

pub struct ApplyEngine {
    options: ApplyOptions,
    target: Arc<dyn TargetConnection>,
    /// Keyed by source table
    mappings: HashMap<TableRef, ValidatedMapping>,
    checkpoint: Arc<CheckpointTracker>,
    metrics: Arc<SubscriptionMetrics>,
    in_flight: InFlightBatch,
}

impl ApplyEngine {
    pub fn new(
        options: ApplyOptions,
        target: Arc<dyn TargetConnection>,
        mappings: Vec<ValidatedMapping>,
        checkpoint: Arc<CheckpointTracker>,
        metrics: Arc<SubscriptionMetrics>,
    ) -> Self {
        Self {
            options,
            target,
            mappings: mappings
                .into_iter()
                .map(|m| (m.source().clone(), m))
                .collect(),
            checkpoint,
            metrics,
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    pub fn in_flight(&self) -> InFlightBatch {
        self.in_flight.clone()
    }

    /// Consumes events until the queue closes or shutdown is signalled.
    ///
    /// A batch closes after `batch_size` events or `batch_timeout` after
    /// its first event, whichever comes first. On shutdown the batch being
    /// collected is applied before returning. Returns an error only for
    /// failures that must stop the subscription.
    #[instrument(skip_all, fields(subscription = %self.options.subscription))]
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<ChangeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(
            batch_size = self.options.batch_size,
            transactional = self.options.transactional,
            "Apply engine started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            let first = tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let mut collected = vec![first];
            let deadline = Instant::now() + self.options.batch_timeout;
            let mut stopping = false;
            while collected.len() < self.options.batch_size {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = shutdown_signalled(&mut shutdown) => {
                        stopping = true;
                        break;
                    }
                    event = events.recv() => match event {
                        Some(event) => collected.push(event),
                        None => {
                            stopping = true;
                            break;
                        }
                    },
                }
            }

            self.apply_batch(ApplyBatch::new(collected)).await?;
            if stopping {
                break;
            }
        }

        info!("Apply engine stopped");
        Ok(())
    }

    /// Applies one batch and commits the checkpoint for what was handled.
    pub async fn apply_batch(&self, mut batch: ApplyBatch) -> Result<()> {
        *self.in_flight.lock().unwrap_or_else(|e| e.into_inner()) = Some(batch.summary());

        let dropped = batch.prepare(&self.checkpoint.current());
        if dropped > 0 {
            debug!(
                batch_id = %batch.batch_id,
                dropped,
                "Dropped events at or behind the checkpoint"
            );
            self.metrics.record_handled(dropped, None);
        }

        let mut progress = Progress::default();
        let result = if batch.is_empty() {
            Ok(())
        } else {
            self.apply_events(&batch.events, &mut progress).await
        };

        if progress.handled > 0 {
            self.checkpoint
                .commit(
                    &progress.advances,
                    progress.handled,
                    progress.newest_captured_at,
                )
                .await?;
            self.metrics
                .record_handled(progress.handled as usize, progress.newest_captured_at);
            self.metrics.record_applied(progress.written);
        }
        if result.is_ok() && !batch.is_empty() {
            self.metrics.record_batch();
            debug!(
                batch_id = %batch.batch_id,
                events = batch.len(),
                written = progress.written,
                "Committed batch"
            );
        }

        *self.in_flight.lock().unwrap_or_else(|e| e.into_inner()) = None;
        result
    }

    async fn apply_events(&self, events: &[ChangeEvent], progress: &mut Progress) -> Result<()> {
        let mut overlay = Overlay::new();
        let mut planned = Vec::with_capacity(events.len());
        for event in events {
            planned.push((event, self.plan(event, &mut overlay).await));
        }

        let mut batch_failure = None;
        let mut batch_committed = false;
        if self.options.transactional {
            let writes: Vec<RowWrite> = planned
                .iter()
                .filter_map(|(_, plan)| match plan {
                    Ok(Plan::Write(writes)) => Some(writes.iter().cloned()),
                    _ => None,
                })
                .flatten()
                .collect();
            let writing_events = planned
                .iter()
                .filter(|(_, plan)| matches!(plan, Ok(Plan::Write(_))))
                .count();

            if !writes.is_empty() {
                match self.write(&writes, true).await {
                    Ok(()) => batch_committed = true,
                    Err(failure) if writing_events == 1 => batch_failure = Some(failure),
                    Err(failure) => warn!(
                        events = writing_events,
                        attempts = failure.attempts,
                        "Batch failed, applying its events one by one: {}",
                        failure.reason
                    ),
                }
            }
        }

        for (event, plan) in planned {
            match plan {
                Ok(Plan::Write(_)) if batch_committed => progress.record(event, true),
                Ok(Plan::Write(writes)) => {
                    let result = match batch_failure.take() {
                        Some(failure) => Err(failure),
                        None => self.write(&writes, self.options.transactional).await,
                    };
                    match result {
                        Ok(()) => progress.record(event, true),
                        Err(failure) => {
                            self.give_up(event, failure).await?;
                            progress.record(event, false);
                        }
                    }
                }
                Ok(Plan::Skip) => progress.record(event, false),
                Err(failure) => {
                    self.give_up(event, failure).await?;
                    progress.record(event, false);
                }
            }
        }
        Ok(())
    }

    /// Maps an event onto target writes, resolving conflicts on the way.
    async fn plan(
        &self,
        event: &ChangeEvent,
        overlay: &mut Overlay,
    ) -> std::result::Result<Plan, Failure> {
        let Some(mapping) = self.mappings.get(&event.table) else {
            warn!(table = %event.table, sequence = %event.sequence, "No mapping for event, skipping");
            return Ok(Plan::Skip);
        };
        if !mapping.mapping().apply_enabled {
            return Ok(Plan::Skip);
        }

        let before = event.before.as_ref().map(|row| mapping.project(row));
        let after = event.after.as_ref().map(|row| mapping.project(row));
        let identity = match event.op {
            ChangeOperation::Delete => before.as_ref(),
            _ => after.as_ref().or(before.as_ref()),
        };
        let key = identity.and_then(|row| mapping.key_of(row)).ok_or_else(|| {
            Failure::now(
                format!("{:?} event carries no key values", event.op),
                1,
            )
        })?;
        // Rows are found by their old key when an update changes the key.
        let lookup_key = match event.op {
            ChangeOperation::Update => before
                .as_ref()
                .and_then(|row| mapping.key_of(row))
                .unwrap_or_else(|| key.clone()),
            _ => key.clone(),
        };

        let table = mapping.target().clone();
        let slot = (table.clone(), encode_key(&lookup_key));
        let read_back = self.target.supports_read_back();
        let current = if !read_back {
            None
        } else if let Some(row) = overlay.get(&slot) {
            row.clone()
        } else {
            let target = &self.target;
            let (table, lookup_key) = (&table, &lookup_key);
            self.retry("read target row", move |_| target.fetch_row(table, lookup_key))
                .await?
        };

        let mut upsert = after.clone();
        if read_back {
            if let Some(reason) =
                conflict::detect(event.op, before.as_ref(), after.as_ref(), current.as_ref())
            {
                let policy = mapping.conflict_resolution(self.options.conflict_resolution);
                self.metrics.record_conflict();
                let conflict_error = Error::ApplyConflict {
                    table: table.to_string(),
                    message: format!("{} at {} ({:?})", reason, event.sequence, event.op),
                };
                warn!(policy = ?policy, "{}", conflict_error);

                match policy {
                    ConflictResolution::SourceWins => {}
                    ConflictResolution::TargetWins => return Ok(Plan::Skip),
                    ConflictResolution::Custom => {
                        let resolver = self.options.resolver.as_ref().ok_or_else(|| {
                            Failure::now("no custom conflict resolver registered".to_string(), 1)
                        })?;
                        let conflict = Conflict {
                            event,
                            table: &table,
                            key: &key,
                            source_row: after.as_ref(),
                            target_row: current.as_ref(),
                            reason: &reason,
                        };
                        let conflict = &conflict;
                        let resolution = self
                            .retry("resolve conflict", move |_| async move {
                                resolver.resolve(conflict)
                            })
                            .await?;
                        match resolution {
                            Resolution::ApplySource => {}
                            Resolution::KeepTarget => return Ok(Plan::Skip),
                            Resolution::Merge(row) => {
                                let mut merged = row;
                                for (column, value) in &key {
                                    merged.insert(column.clone(), value.clone());
                                }
                                return Ok(Plan::Write(vec![self.upsert(
                                    event, &table, key, merged, current, overlay,
                                )]));
                            }
                        }
                    }
                }
            }
        }

        let mut writes = Vec::with_capacity(2);
        if lookup_key != key {
            overlay.insert(slot, None);
            writes.push(RowWrite {
                table: table.clone(),
                key: lookup_key,
                op: WriteOp::Delete,
                source_op: event.op,
                sequence: event.sequence,
            });
        }
        match event.op {
            ChangeOperation::Delete => {
                overlay.insert((table.clone(), encode_key(&key)), None);
                writes.push(RowWrite {
                    table,
                    key,
                    op: WriteOp::Delete,
                    source_op: event.op,
                    sequence: event.sequence,
                });
            }
            _ => {
                let row = upsert.take().unwrap_or_else(|| key.clone());
                let current = if writes.is_empty() { current } else { None };
                writes.push(self.upsert(event, &table, key, row, current, overlay));
            }
        }
        Ok(Plan::Write(writes))
    }

    fn upsert(
        &self,
        event: &ChangeEvent,
        table: &TableRef,
        key: Row,
        row: Row,
        current: Option<Row>,
        overlay: &mut Overlay,
    ) -> RowWrite {
        let mut merged = current.unwrap_or_default();
        for (column, value) in &row {
            merged.insert(column.clone(), value.clone());
        }
        overlay.insert((table.clone(), encode_key(&key)), Some(merged));
        RowWrite {
            table: table.clone(),
            key,
            op: WriteOp::Upsert(row),
            source_op: event.op,
            sequence: event.sequence,
        }
    }

    async fn write(
        &self,
        writes: &[RowWrite],
        transactional: bool,
    ) -> std::result::Result<(), Failure> {
        let target = &self.target;
        self.retry("apply", move |_| target.apply(writes, transactional))
            .await
    }

    /// Retries any error per the subscription's retry policy.
    async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> std::result::Result<T, Failure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = &self.options.retry;
        let mut first_failed_at = None;
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let first = *first_failed_at.get_or_insert_with(Utc::now);
                    if attempt >= policy.max_attempts {
                        return Err(Failure {
                            reason: e.to_string(),
                            attempts: attempt,
                            first_failed_at: first,
                        });
                    }
                    let delay = policy.delay(attempt);
                    warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "{} failed: {}",
                        what,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Handles an event whose retries are exhausted, per `on_error`.
    async fn give_up(&self, event: &ChangeEvent, failure: Failure) -> Result<()> {
        match self.options.on_error {
            OnError::RouteToDlq => {
                let record = DeadLetterRecord::new(
                    event.clone(),
                    failure.reason.clone(),
                    failure.attempts,
                    failure.first_failed_at,
                );
                let (target, record) = (&self.target, &record);
                self.options
                    .retry
                    .retry("write dead letter", move |_| target.write_dead_letter(record))
                    .await
                    .map_err(|e| Error::ApplyFailure {
                        message: format!(
                            "cannot dead-letter {} at {}: {}",
                            event.table, event.sequence, e
                        ),
                        attempts: failure.attempts,
                    })?;
                self.metrics.record_dead_letter();
                warn!(
                    table = %event.table,
                    sequence = %event.sequence,
                    attempts = failure.attempts,
                    "Routed event to dead letter: {}",
                    failure.reason
                );
                Ok(())
            }
            OnError::Skip => {
                self.metrics.record_skipped();
                error!(
                    data_loss = true,
                    table = %event.table,
                    sequence = %event.sequence,
                    op = ?event.op,
                    attempts = failure.attempts,
                    "Skipped event after exhausting retries: {}",
                    failure.reason
                );
                Ok(())
            }
            OnError::Stop => {
                error!(
                    table = %event.table,
                    sequence = %event.sequence,
                    attempts = failure.attempts,
                    "Stopping subscription: {}",
                    failure.reason
                );
                Err(Error::ApplyFailure {
                    message: format!(
                        "{:?} on {} at {}: {}",
                        event.op, event.table, event.sequence, failure.reason
                    ),
                    attempts: failure.attempts,
                })
            }
        }
    }

    /// Re-applies dead-lettered events of this subscription in capture order.
    ///
    /// The checkpoint is not consulted: these events are already behind it.
    /// Records stay in dead-letter storage.
    pub async fn replay_dead_letters(
        &self,
        mut records: Vec<DeadLetterRecord>,
    ) -> Result<ReplayReport> {
        records.retain(|r| r.subscription == self.options.subscription);
        dead_letter::replay_order(&mut records);

        let mut report = ReplayReport::default();
        let mut overlay = Overlay::new();
        for record in &records {
            let event = &record.original_event;
            let result = match self.plan(event, &mut overlay).await {
                Ok(Plan::Write(writes)) => self
                    .write(&writes, self.options.transactional)
                    .await
                    .map(|_| true),
                Ok(Plan::Skip) => Ok(false),
                Err(failure) => Err(failure),
            };
            match result {
                Ok(true) => report.replayed += 1,
                Ok(false) => report.discarded += 1,
                Err(failure) => {
                    warn!(
                        table = %event.table,
                        sequence = %event.sequence,
                        "Replay failed: {}",
                        failure.reason
                    );
                    report.failed += 1;
                }
            }
        }
        info!(
            subscription = %self.options.subscription,
            replayed = report.replayed,
            discarded = report.discarded,
            failed = report.failed,
            "Replayed dead letters"
        );
        Ok(report)
    }
}

impl Failure {
    fn now(reason: String, attempts: u32) -> Self {
        Self {
            reason,
            attempts,
            first_failed_at: Utc::now(),
        }
    }
}

async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender counts as shutdown.
    let _ = shutdown.wait_for(|stop| *stop).await;
}
