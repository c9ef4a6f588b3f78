//! Subscription controller: owns the lifecycle of one subscription and the
//! capture/apply pipeline that runs while it streams.
//!
//! Each subscription is driven by its own task. Operators talk to it
//! through a [`SubscriptionHandle`]; status is published on a watch
//! channel so reading it never waits on the pipeline.

pub mod state;
pub mod status;

pub(crate) use state::Command;
pub use state::{Operation, SubscriptionState};
pub use status::{StatusError, StatusStore, SubscriptionStatus};

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::apply::{
    ApplyEngine, ApplyMode, ApplyOptions, ConflictResolver, DeadLetterRecord, InFlightBatch,
    ReplayReport, ResolverRegistry,
};
use crate::capture::{CaptureEngine, CaptureMode, CaptureOptions};
use crate::channel::{self, Channel};
use crate::checkpoint::{Checkpoint, CheckpointManager, CheckpointTracker};
use crate::config::{ChannelConfig, Config, SubscriptionConfig};
use crate::datastore::{
    DatastoreRegistry, RegistryEvent, RowWrite, SourceConnection, TargetConnection, WriteOp,
};
use crate::event::{ChangeOperation, Row, TableRef};
use crate::mapping::{TableMapping, ValidatedMapping};
use crate::metrics::SubscriptionMetrics;
use crate::retry::Backoff;
use crate::{Error, Result};

const STATUS_INTERVAL: Duration = Duration::from_secs(1);
const REQUEST_QUEUE: usize = 16;

/// A subscription and the channel it runs, resolved from configuration.
#[derive(Debug, Clone)]
pub struct SubscriptionDefinition {
    pub subscription: SubscriptionConfig,
    pub channel: ChannelConfig,
    pub state_dir: PathBuf,
    /// How long a stopping pipeline may take to drain its batch
    pub shutdown_timeout: Duration,
}

impl SubscriptionDefinition {
    pub fn from_config(config: &Config, name: &str) -> Result<Self> {
        let subscription = config
            .subscription(name)
            .cloned()
            .ok_or_else(|| Error::not_found("subscription", name))?;
        let channel = config
            .channel(&subscription.channel)
            .cloned()
            .ok_or_else(|| Error::not_found("channel", &subscription.channel))?;
        Ok(Self {
            subscription,
            channel,
            state_dir: config.engine.state_dir.clone(),
            shutdown_timeout: config.shutdown_timeout(),
        })
    }

    pub fn name(&self) -> &str {
        &self.subscription.name
    }
}

enum Request {
    Command(Operation, oneshot::Sender<Result<SubscriptionState>>),
    DeadLetters(oneshot::Sender<Result<Vec<DeadLetterRecord>>>),
    ReplayDeadLetters(oneshot::Sender<Result<ReplayReport>>),
}

/// Cheap, cloneable access to a running subscription controller.
#[derive(Clone)]
pub struct SubscriptionHandle {
    name: String,
    requests: mpsc::Sender<Request>,
    status: watch::Receiver<SubscriptionStatus>,
}

impl SubscriptionHandle {
    /// Loads the subscription's checkpoint and last status and starts its
    /// controller task. Nothing is started until [`start`](Self::start).
    pub async fn spawn(
        definition: SubscriptionDefinition,
        registry: Arc<DatastoreRegistry>,
        resolvers: ResolverRegistry,
    ) -> Result<Self> {
        let name = definition.name().to_string();
        let checkpoint = Arc::new(
            CheckpointTracker::open(
                CheckpointManager::for_subscription(&definition.state_dir, &name),
                &name,
            )
            .await?,
        );
        let store = StatusStore::for_subscription(&definition.state_dir, &name);
        let status = restore_status(&name, &store, &checkpoint.current()).await;

        let (status_tx, status_rx) = watch::channel(status.clone());
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE);
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();

        let controller = Controller {
            definition,
            registry,
            resolvers,
            checkpoint,
            metrics: Arc::new(SubscriptionMetrics::new()),
            status,
            status_tx,
            store,
            persisted_checkpoint_at: None,
            failures_tx,
            failures_rx,
            pipeline: None,
        };
        tokio::spawn(controller.run(requests_rx));

        Ok(Self {
            name,
            requests: requests_tx,
            status: status_rx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last known status. Never blocks.
    pub fn status(&self) -> SubscriptionStatus {
        self.status.borrow().clone()
    }

    pub async fn start(&self) -> Result<SubscriptionState> {
        self.operate(Operation::Start).await
    }

    /// Drains the in-flight batch and stops. Idempotent.
    pub async fn stop(&self) -> Result<SubscriptionState> {
        self.operate(Operation::Stop).await
    }

    pub async fn pause(&self) -> Result<SubscriptionState> {
        self.operate(Operation::Pause).await
    }

    pub async fn resume(&self) -> Result<SubscriptionState> {
        self.operate(Operation::Resume).await
    }

    pub async fn operate(&self, operation: Operation) -> Result<SubscriptionState> {
        self.request(|reply| Request::Command(operation, reply))
            .await
    }

    /// Dead-letter records of this subscription, read from its target.
    pub async fn dead_letters(&self) -> Result<Vec<DeadLetterRecord>> {
        self.request(Request::DeadLetters).await
    }

    /// Re-applies dead-lettered events in capture order.
    pub async fn replay_dead_letters(&self) -> Result<ReplayReport> {
        self.request(Request::ReplayDeadLetters).await
    }

    /// Waits until the published status satisfies `predicate`.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&SubscriptionStatus) -> bool,
    ) -> Result<SubscriptionStatus> {
        let mut status = self.status.clone();
        let matched = status
            .wait_for(|s| predicate(s))
            .await
            .map(|s| s.clone())
            .map_err(|_| Error::Shutdown)?;
        Ok(matched)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> Request,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(make(reply))
            .await
            .map_err(|_| Error::Shutdown)?;
        response.await.map_err(|_| Error::Shutdown)?
    }
}

/// Carries the last persisted status over a restart. A pipeline that was
/// running when the process went away is reported as stopped.
async fn restore_status(
    name: &str,
    store: &StatusStore,
    checkpoint: &Checkpoint,
) -> SubscriptionStatus {
    let mut status = SubscriptionStatus::new(name);
    match store.load().await {
        Ok(Some(previous)) => {
            status.state = match previous.state {
                SubscriptionState::Created
                | SubscriptionState::Paused
                | SubscriptionState::Failed => previous.state,
                _ => SubscriptionState::Stopped,
            };
            if status.state == SubscriptionState::Failed {
                status.error = previous.error;
            }
        }
        Ok(None) => {}
        Err(e) => warn!(subscription = %name, "Ignoring unreadable status file: {}", e),
    }
    status.set_checkpoint(checkpoint);
    status
}

/// Connections and validated mappings a pipeline is built from.
struct Prepared {
    source: Arc<dyn SourceConnection>,
    target: Arc<dyn TargetConnection>,
    mappings: Vec<ValidatedMapping>,
    mode: CaptureMode,
    transactional: bool,
    capture_retry: Backoff,
    resolver: Option<Arc<dyn ConflictResolver>>,
}

struct Pipeline {
    channel: Channel,
    apply: Option<JoinHandle<Result<()>>>,
    shutdown: watch::Sender<bool>,
    acknowledger: JoinHandle<()>,
    in_flight: InFlightBatch,
}

struct Controller {
    definition: SubscriptionDefinition,
    registry: Arc<DatastoreRegistry>,
    resolvers: ResolverRegistry,
    checkpoint: Arc<CheckpointTracker>,
    metrics: Arc<SubscriptionMetrics>,
    status: SubscriptionStatus,
    status_tx: watch::Sender<SubscriptionStatus>,
    store: StatusStore,
    persisted_checkpoint_at: Option<DateTime<Utc>>,
    failures_tx: mpsc::UnboundedSender<Error>,
    failures_rx: mpsc::UnboundedReceiver<Error>,
    pipeline: Option<Pipeline>,
}

impl Controller {
    #[instrument(skip_all, fields(subscription = %self.definition.subscription.name))]
    async fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        let mut registry_events = self.registry.subscribe();
        let mut checkpoints = self.checkpoint.subscribe();
        let mut tick = tokio::time::interval(STATUS_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(state = %self.status.state, "Subscription controller started");
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
                Some(failure) = self.failures_rx.recv() => self.on_capture_failure(failure).await,
                finished = apply_finished(&mut self.pipeline) => self.on_apply_finished(finished).await,
                event = registry_events.recv() => match event {
                    Ok(event) => self.on_registry_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Missed datastore registry events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },
                Ok(()) = checkpoints.changed() => self.publish(false).await,
                _ = tick.tick() => self.publish(false).await,
            }
        }

        if let Err(e) = self.teardown().await {
            warn!("Pipeline did not stop cleanly: {}", e);
        }
        debug!("Subscription controller stopped");
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Command(operation, reply) => {
                let result = match operation {
                    Operation::Start => self.start().await,
                    Operation::Stop => self.stop().await,
                    Operation::Pause => self.pause().await,
                    Operation::Resume => self.resume().await,
                };
                if let Err(e) = &result {
                    debug!(operation = %operation, "Operation rejected: {}", e);
                }
                let _ = reply.send(result);
            }
            Request::DeadLetters(reply) => {
                let _ = reply.send(self.dead_letters().await);
            }
            Request::ReplayDeadLetters(reply) => {
                let _ = reply.send(self.replay_dead_letters().await);
            }
        }
    }

    fn name(&self) -> &str {
        &self.definition.subscription.name
    }

    async fn start(&mut self) -> Result<SubscriptionState> {
        let checkpoint = self.checkpoint.current();
        let snapshot = self
            .definition
            .channel
            .tables
            .iter()
            .any(|t| needs_snapshot(t, &checkpoint));
        let next = self.status.state.transition(Command::Start { snapshot })?;

        self.status.error = None;
        self.set_state(next).await;

        let prepared = match self.prepare().await {
            Ok(prepared) => prepared,
            Err(e) => return Err(self.fail(e).await),
        };
        if snapshot {
            if let Err(e) = self.snapshot(&prepared).await {
                return Err(self.fail(e).await);
            }
            let next = self.status.state.transition(Command::SnapshotComplete)?;
            self.set_state(next).await;
        }
        if let Err(e) = self.launch(prepared) {
            return Err(self.fail(e).await);
        }
        Ok(self.status.state)
    }

    async fn stop(&mut self) -> Result<SubscriptionState> {
        let next = self.status.state.transition(Command::Stop)?;
        if next == self.status.state {
            return Ok(next);
        }
        if let Err(e) = self.teardown().await {
            return Err(self.fail(e).await);
        }
        self.set_state(next).await;
        Ok(next)
    }

    async fn pause(&mut self) -> Result<SubscriptionState> {
        let next = self.status.state.transition(Command::Pause)?;
        if let Err(e) = self.teardown().await {
            return Err(self.fail(e).await);
        }
        self.set_state(next).await;
        Ok(next)
    }

    async fn resume(&mut self) -> Result<SubscriptionState> {
        let next = self.status.state.transition(Command::Resume)?;
        self.set_state(next).await;
        let launched = match self.prepare().await {
            Ok(prepared) => self.launch(prepared),
            Err(e) => Err(e),
        };
        if let Err(e) = launched {
            return Err(self.fail(e).await);
        }
        Ok(next)
    }

    /// Resolves both datastores and validates every mapping against the
    /// live schemas. Nothing is activated yet.
    async fn prepare(&self) -> Result<Prepared> {
        let channel = &self.definition.channel;
        let subscription = &self.definition.subscription;

        let source_handle = self.registry.resolve(&channel.source)?;
        let target_handle = self.registry.resolve(&channel.target)?;
        let source = source_handle.source().await?;
        let target = target_handle.target().await?;

        let mappings =
            channel::validate_tables(&channel.tables, source.as_ref(), target.as_ref()).await?;
        let mode = CaptureMode::select(source_handle.capabilities(), subscription.capture_mode)?;
        let transactional = subscription.apply_mode == ApplyMode::Transaction
            && target_handle.capabilities().supports_transactional_apply;
        let resolver = match &subscription.custom_resolver {
            Some(name) => Some(self.resolvers.get(name).ok_or_else(|| {
                Error::Config(format!("conflict resolver '{}' is not registered", name))
            })?),
            None => None,
        };

        info!(
            source = %channel.source,
            target = %channel.target,
            tables = mappings.len(),
            mode = %mode,
            transactional,
            "Prepared pipeline"
        );
        Ok(Prepared {
            source,
            target,
            mappings,
            mode,
            transactional,
            capture_retry: Backoff::connect(source_handle.descriptor().connect_max_attempts),
            resolver,
        })
    }

    /// Copies rows the target does not have yet, then records the position
    /// the copy is consistent with so streaming resumes right after it.
    async fn snapshot(&mut self, prepared: &Prepared) -> Result<()> {
        let checkpoint = self.checkpoint.current();
        let batch_size = self.definition.channel.batch_size.max(1);
        let retry = self.definition.subscription.retry.policy();
        let target = &prepared.target;

        for mapping in &prepared.mappings {
            if !needs_snapshot(mapping.mapping(), &checkpoint) {
                continue;
            }
            let table = mapping.source();
            let source = &prepared.source;
            let mode = prepared.mode;
            let snapshot = prepared
                .capture_retry
                .retry(&format!("snapshot {}", table), move |_| source.snapshot(table, mode))
                .await?;

            let mut copied = 0usize;
            let mut existing = 0usize;
            if mapping.mapping().apply_enabled {
                let mut writes = Vec::with_capacity(batch_size);
                for row in &snapshot.rows {
                    let projected = mapping.project(row);
                    let Some(key) = mapping.key_of(&projected) else {
                        warn!(table = %table, "Snapshot row has no key values, skipping");
                        continue;
                    };
                    if target.supports_read_back()
                        && fetch_target_row(&retry, target.as_ref(), mapping.target(), &key)
                            .await?
                            .is_some()
                    {
                        existing += 1;
                        continue;
                    }
                    writes.push(RowWrite {
                        table: mapping.target().clone(),
                        key,
                        op: WriteOp::Upsert(projected),
                        source_op: ChangeOperation::Insert,
                        sequence: snapshot.checkpoint,
                    });
                    if writes.len() >= batch_size {
                        copied += writes.len();
                        apply_snapshot_rows(&retry, target.as_ref(), &writes, prepared.transactional)
                            .await?;
                        writes.clear();
                    }
                }
                if !writes.is_empty() {
                    copied += writes.len();
                    apply_snapshot_rows(&retry, target.as_ref(), &writes, prepared.transactional)
                        .await?;
                }
            }

            let mut advances = BTreeMap::new();
            advances.insert(table.clone(), snapshot.checkpoint);
            self.checkpoint.commit(&advances, 0, None).await?;
            info!(
                table = %table,
                rows = snapshot.rows.len(),
                copied,
                existing,
                checkpoint = %snapshot.checkpoint,
                "Snapshot complete"
            );
        }
        Ok(())
    }

    fn launch(&mut self, prepared: Prepared) -> Result<()> {
        // Failures of a previous pipeline no longer apply.
        while self.failures_rx.try_recv().is_ok() {}
        self.metrics.pipeline_started();

        let channel_config = &self.definition.channel;
        let subscription = &self.definition.subscription;
        let capture = CaptureEngine::new(
            prepared.source.clone(),
            prepared.mode,
            CaptureOptions {
                page_size: channel_config.capture_page_size,
                poll_interval: channel_config.poll_interval(),
                retry: prepared.capture_retry,
            },
        );
        let mut channel = Channel::new(
            &channel_config.name,
            &subscription.name,
            capture,
            prepared.mappings.clone(),
            channel_config.queue_capacity,
            self.metrics.clone(),
            self.failures_tx.clone(),
        );
        let events = channel.activate(&self.checkpoint.current()).ok_or_else(|| {
            Error::InvalidTransition {
                state: self.status.state.to_string(),
                command: "activate channel".into(),
            }
        })?;

        let options = ApplyOptions {
            subscription: subscription.name.clone(),
            batch_size: channel_config.batch_size,
            batch_timeout: channel_config.batch_timeout(),
            transactional: prepared.transactional,
            retry: subscription.retry.policy(),
            on_error: subscription.on_error,
            conflict_resolution: subscription.conflict_resolution,
            resolver: prepared.resolver,
        };
        let captured: Vec<TableRef> = prepared
            .mappings
            .iter()
            .filter(|m| m.mapping().capture_enabled)
            .map(|m| m.source().clone())
            .collect();
        let engine = ApplyEngine::new(
            options,
            prepared.target,
            prepared.mappings,
            self.checkpoint.clone(),
            self.metrics.clone(),
        );
        let in_flight = engine.in_flight();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let apply = tokio::spawn(async move { engine.run(events, shutdown_rx).await });
        let acknowledger = tokio::spawn(acknowledge_checkpoints(
            prepared.source,
            captured,
            prepared.mode,
            self.checkpoint.subscribe(),
        ));

        self.pipeline = Some(Pipeline {
            channel,
            apply: Some(apply),
            shutdown,
            acknowledger,
            in_flight,
        });
        Ok(())
    }

    /// Cancels capture, lets apply finish its batch within the shutdown
    /// timeout, and aborts it after that.
    async fn teardown(&mut self) -> Result<()> {
        let Some(mut pipeline) = self.pipeline.take() else {
            return Ok(());
        };
        pipeline.channel.deactivate();
        let _ = pipeline.shutdown.send(true);
        pipeline.acknowledger.abort();

        let timeout = self.definition.shutdown_timeout;
        let result = match pipeline.apply.take() {
            None => Ok(()),
            Some(mut apply) => match tokio::time::timeout(timeout, &mut apply).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => Err(apply_panicked(e)),
                Err(_) => {
                    apply.abort();
                    let undrained = pipeline
                        .in_flight
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .clone();
                    match undrained {
                        Some(batch) => error!(
                            batch_id = %batch.batch_id,
                            events = batch.events,
                            first_sequence = ?batch.first_sequence,
                            last_sequence = ?batch.last_sequence,
                            timeout_secs = timeout.as_secs(),
                            "Apply did not drain in time; batch needs manual review"
                        ),
                        None => error!(
                            timeout_secs = timeout.as_secs(),
                            "Apply did not drain in time"
                        ),
                    }
                    Ok(())
                }
            },
        };
        info!("Pipeline stopped");
        self.publish(false).await;
        result
    }

    /// Moves the subscription to `failed`, recording the error and the
    /// checkpoint it happened at. Returns the error for the caller.
    async fn fail(&mut self, error: Error) -> Error {
        if let Err(e) = self.teardown().await {
            warn!("Pipeline did not stop cleanly: {}", e);
        }
        let checkpoint = self.checkpoint.current();
        error!(kind = %error.kind(), "Subscription failed: {}", error);
        self.status.set_error(&error, &checkpoint);
        match self.status.state.transition(Command::Fail) {
            Ok(next) => self.status.state = next,
            Err(e) => warn!("{}", e),
        }
        self.publish(true).await;
        error
    }

    async fn on_capture_failure(&mut self, failure: Error) {
        if self.pipeline.is_none() {
            debug!("Ignoring capture failure of a stopped pipeline: {}", failure);
            return;
        }
        self.fail(failure).await;
    }

    async fn on_apply_finished(&mut self, finished: std::result::Result<Result<()>, JoinError>) {
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.apply = None;
        }
        match finished {
            Ok(Ok(())) => debug!("Apply engine finished"),
            Ok(Err(e)) => {
                self.fail(e).await;
            }
            Err(e) => {
                self.fail(apply_panicked(e)).await;
            }
        }
    }

    /// Rebuilds a streaming pipeline whose source or target was replaced.
    async fn on_registry_event(&mut self, event: RegistryEvent) {
        let RegistryEvent::Replaced(name) = event else {
            return;
        };
        let channel = &self.definition.channel;
        if name != channel.source && name != channel.target {
            return;
        }
        if self.status.state != SubscriptionState::Streaming || self.pipeline.is_none() {
            return;
        }

        info!(datastore = %name, "Datastore replaced, restarting pipeline");
        if let Err(e) = self.teardown().await {
            self.fail(e).await;
            return;
        }
        let launched = match self.prepare().await {
            Ok(prepared) => self.launch(prepared),
            Err(e) => Err(e),
        };
        if let Err(e) = launched {
            self.fail(e).await;
        }
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetterRecord>> {
        let target = self
            .registry
            .resolve(&self.definition.channel.target)?
            .target()
            .await?;
        target.dead_letters(self.name()).await
    }

    async fn replay_dead_letters(&self) -> Result<ReplayReport> {
        let prepared = self.prepare().await?;
        let records = prepared.target.dead_letters(self.name()).await?;
        let subscription = &self.definition.subscription;
        let channel = &self.definition.channel;
        let engine = ApplyEngine::new(
            ApplyOptions {
                subscription: subscription.name.clone(),
                batch_size: channel.batch_size,
                batch_timeout: channel.batch_timeout(),
                transactional: prepared.transactional,
                retry: subscription.retry.policy(),
                on_error: subscription.on_error,
                conflict_resolution: subscription.conflict_resolution,
                resolver: prepared.resolver,
            },
            prepared.target,
            prepared.mappings,
            self.checkpoint.clone(),
            self.metrics.clone(),
        );
        engine.replay_dead_letters(records).await
    }

    async fn set_state(&mut self, state: SubscriptionState) {
        if self.status.state != state {
            info!(from = %self.status.state, to = %state, "Subscription state changed");
        }
        self.status.state = state;
        self.publish(true).await;
    }

    /// Refreshes checkpoint, lag and counters, publishes the status and
    /// persists it on state changes or when the checkpoint moved.
    async fn publish(&mut self, state_changed: bool) {
        let now = Utc::now();
        let checkpoint = self.checkpoint.current();
        self.status.set_checkpoint(&checkpoint);

        if self.pipeline.is_some() {
            let lag = self.metrics.lag(now);
            let tolerance = self.definition.channel.latency_tolerance();
            let lagging = lag > tolerance;
            if lagging && !self.status.lagging {
                warn!(
                    lag_ms = lag.as_millis() as u64,
                    tolerance_ms = tolerance.as_millis() as u64,
                    "Subscription is lagging"
                );
            } else if !lagging && self.status.lagging {
                info!("Subscription caught up");
            }
            self.status.lag_ms = lag.as_millis() as u64;
            self.status.lagging = lagging;
        }
        self.status.metrics = self.metrics.snapshot();
        self.status.updated_at = now;
        self.status_tx.send_replace(self.status.clone());

        let checkpoint_moved = self.persisted_checkpoint_at != Some(checkpoint.timestamp);
        if state_changed || checkpoint_moved {
            match self.store.save(&self.status).await {
                Ok(()) => self.persisted_checkpoint_at = Some(checkpoint.timestamp),
                Err(e) => warn!("Failed to persist status: {}", e),
            }
        }
    }
}

/// Completes when the running apply task ends; pending without one.
async fn apply_finished(
    pipeline: &mut Option<Pipeline>,
) -> std::result::Result<Result<()>, JoinError> {
    match pipeline.as_mut().and_then(|p| p.apply.as_mut()) {
        Some(apply) => apply.await,
        None => std::future::pending().await,
    }
}

/// Lets the source release log entries as the checkpoint moves.
async fn acknowledge_checkpoints(
    source: Arc<dyn SourceConnection>,
    tables: Vec<TableRef>,
    mode: CaptureMode,
    mut checkpoints: watch::Receiver<Checkpoint>,
) {
    while checkpoints.changed().await.is_ok() {
        let checkpoint = checkpoints.borrow_and_update().clone();
        if let Err(e) = source.acknowledge(&checkpoint, &tables, mode).await {
            warn!("Failed to acknowledge checkpoint: {}", e);
        }
    }
}

async fn fetch_target_row(
    retry: &Backoff,
    target: &dyn TargetConnection,
    table: &TableRef,
    key: &Row,
) -> Result<Option<Row>> {
    retry
        .retry("fetch target row", move |_| target.fetch_row(table, key))
        .await
}

async fn apply_snapshot_rows(
    retry: &Backoff,
    target: &dyn TargetConnection,
    writes: &[RowWrite],
    transactional: bool,
) -> Result<()> {
    retry
        .retry("apply snapshot rows", move |_| target.apply(writes, transactional))
        .await
}

fn needs_snapshot(mapping: &TableMapping, checkpoint: &Checkpoint) -> bool {
    mapping.initial_snapshot && mapping.capture_enabled && !checkpoint.contains(&mapping.source())
}

fn apply_panicked(error: JoinError) -> Error {
    Error::ApplyFailure {
        message: format!("apply task ended abnormally: {}", error),
        attempts: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::{Connection, DatastoreKind, Driver, MemoryDatastore};
    use crate::error::ErrorKind;
    use crate::event::{Row, SequenceNumber, TableRef};
    use crate::mapping::{ColumnDef, TableSchema};
    use serde_json::json;
    use tempfile::TempDir;

    const CONFIG: &str = r#"
        [engine]
        shutdown_timeout_secs = 5

        [[datastores]]
        name = "src"
        kind = "relational"
        driver = "memory"

        [[datastores]]
        name = "dst"
        kind = "relational"
        driver = "memory"

        [[channels]]
        name = "users"
        source = "src"
        target = "dst"
        batch_size = 10
        batch_timeout_secs = 0.02
        poll_interval_ms = 5

        [[channels.tables]]
        source_schema = "public"
        source_table = "users"
        initial_snapshot = true

        [[subscriptions]]
        name = "users-sub"
        channel = "users"
        retry = { max_attempts = 2, backoff_secs = 0.01 }
    "#;

    struct Fixture {
        _dir: TempDir,
        source: Arc<MemoryDatastore>,
        target: Arc<MemoryDatastore>,
        handle: SubscriptionHandle,
    }

    fn users() -> TableRef {
        TableRef::new("public", "users")
    }

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn memory_store() -> Arc<MemoryDatastore> {
        let store = Arc::new(MemoryDatastore::new());
        store.create_table(TableSchema {
            table: users(),
            columns: vec![ColumnDef::new("id", "integer"), ColumnDef::new("name", "text")],
            primary_key: vec!["id".into()],
            unique_keys: vec![],
        });
        store
    }

    async fn fixture(source: Arc<MemoryDatastore>) -> Fixture {
        fixture_with(CONFIG, source).await
    }

    async fn fixture_with(config: &str, source: Arc<MemoryDatastore>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = Config::from_toml_str(config).unwrap();
        config.engine.state_dir = dir.path().to_path_buf();

        let target = memory_store();
        let registry = Arc::new(DatastoreRegistry::new());
        for (name, store) in [("src", source.clone()), ("dst", target.clone())] {
            registry
                .register_with(
                    crate::datastore::DatastoreDescriptor::new(
                        name,
                        DatastoreKind::Relational,
                        Driver::Memory,
                    ),
                    Connection::both(store),
                )
                .unwrap();
        }

        let definition = SubscriptionDefinition::from_config(&config, "users-sub").unwrap();
        let handle = SubscriptionHandle::spawn(definition, registry, ResolverRegistry::new())
            .await
            .unwrap();
        Fixture {
            _dir: dir,
            source,
            target,
            handle,
        }
    }

    async fn wait_for_rows(target: &MemoryDatastore, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while target.rows(&users()).len() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_then_stream() {
        let source = memory_store();
        source.insert(&users(), row(json!({"id": 1, "name": "Alice"}))).unwrap();
        let fixture = fixture(source).await;

        assert_eq!(fixture.handle.start().await.unwrap(), SubscriptionState::Streaming);
        wait_for_rows(&fixture.target, 1).await;

        fixture
            .source
            .insert(&users(), row(json!({"id": 2, "name": "Bob"})))
            .unwrap();
        wait_for_rows(&fixture.target, 2).await;

        let status = fixture
            .handle
            .wait_for(|s| s.last_checkpoint.get("public.users") == Some(&SequenceNumber::new(2, 0)))
            .await
            .unwrap();
        assert_eq!(status.state, SubscriptionState::Streaming);
        assert!(status.error.is_none());

        assert_eq!(fixture.handle.stop().await.unwrap(), SubscriptionState::Stopped);
        assert_eq!(fixture.handle.stop().await.unwrap(), SubscriptionState::Stopped);
    }

    #[tokio::test]
    async fn test_invalid_transitions_are_rejected() {
        let fixture = fixture(memory_store()).await;
        let err = fixture.handle.resume().await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(fixture.handle.status().state, SubscriptionState::Created);

        fixture.handle.start().await.unwrap();
        assert!(fixture.handle.start().await.is_err());
        fixture.handle.stop().await.unwrap();
        assert!(fixture.handle.resume().await.is_err());
    }

    #[tokio::test]
    async fn test_log_gap_fails_subscription() {
        let source = memory_store();
        source.insert(&users(), row(json!({"id": 1, "name": "Alice"}))).unwrap();
        source.insert(&users(), row(json!({"id": 2, "name": "Bob"}))).unwrap();
        let fixture = fixture(source).await;

        // Streaming starts after the snapshot position; losing the log
        // behind it afterwards is only noticed on restart.
        fixture.handle.start().await.unwrap();
        wait_for_rows(&fixture.target, 2).await;
        fixture.handle.stop().await.unwrap();

        fixture
            .source
            .insert(&users(), row(json!({"id": 3, "name": "Carol"})))
            .unwrap();
        fixture.source.truncate_log(SequenceNumber::new(3, 0));

        fixture.handle.start().await.unwrap();
        let status = fixture
            .handle
            .wait_for(|s| s.state == SubscriptionState::Failed)
            .await
            .unwrap();
        let error = status.error.unwrap();
        assert_eq!(error.kind, ErrorKind::LogGap);
        assert_eq!(error.checkpoint["public.users"], SequenceNumber::new(2, 0));
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<std::sync::Mutex<Vec<u8>>>);

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_snapshot_retries_transient_target_reads() {
        let source = memory_store();
        source.insert(&users(), row(json!({"id": 1, "name": "Alice"}))).unwrap();
        source.insert(&users(), row(json!({"id": 2, "name": "Bob"}))).unwrap();
        let fixture = fixture(source).await;
        fixture.target.fail_next_reads(1);

        assert_eq!(fixture.handle.start().await.unwrap(), SubscriptionState::Streaming);
        wait_for_rows(&fixture.target, 2).await;
        assert!(fixture.handle.status().error.is_none());
    }

    #[tokio::test]
    async fn test_capture_only_table_advances_checkpoint() {
        let config = CONFIG.replace(
            "initial_snapshot = true",
            "initial_snapshot = true\n        apply_enabled = false",
        );
        let source = memory_store();
        source.insert(&users(), row(json!({"id": 1, "name": "Alice"}))).unwrap();
        let fixture = fixture_with(&config, source).await;
        fixture.handle.start().await.unwrap();

        fixture
            .source
            .insert(&users(), row(json!({"id": 2, "name": "Bob"})))
            .unwrap();
        let status = fixture
            .handle
            .wait_for(|s| s.last_checkpoint.get("public.users") == Some(&SequenceNumber::new(2, 0)))
            .await
            .unwrap();

        assert_eq!(status.state, SubscriptionState::Streaming);
        assert_eq!(status.metrics.events_applied, 0);
        assert!(fixture.target.rows(&users()).is_empty());
    }

    #[tokio::test]
    async fn test_lagging_is_reported_past_latency_tolerance() {
        let config = CONFIG
            .replace(
                "poll_interval_ms = 5",
                "poll_interval_ms = 5\n        latency_tolerance_secs = 0",
            )
            .replace(
                "retry = { max_attempts = 2, backoff_secs = 0.01 }",
                "retry = { max_attempts = 5, backoff_secs = 1.0 }",
            );
        let fixture = fixture_with(&config, memory_store()).await;
        fixture.handle.start().await.unwrap();
        fixture.target.fail_next_applies(3);

        fixture
            .source
            .insert(&users(), row(json!({"id": 1, "name": "Alice"})))
            .unwrap();
        let lagging = tokio::time::timeout(
            Duration::from_secs(10),
            fixture.handle.wait_for(|s| s.lagging),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(lagging.lag_ms > 0);
        assert_eq!(lagging.state, SubscriptionState::Streaming);

        // Reported clear again once the event is through
        tokio::time::timeout(
            Duration::from_secs(20),
            fixture.handle.wait_for(|s| {
                !s.lagging
                    && s.last_checkpoint.get("public.users") == Some(&SequenceNumber::new(1, 0))
            }),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(fixture.target.rows(&users()).len(), 1);
    }

    #[tokio::test]
    async fn test_stop_aborts_batch_still_applying_at_timeout() {
        let config = CONFIG
            .replace("shutdown_timeout_secs = 5", "shutdown_timeout_secs = 1")
            .replace(
                "retry = { max_attempts = 2, backoff_secs = 0.01 }",
                "retry = { max_attempts = 5, backoff_secs = 30.0 }",
            );
        let fixture = fixture_with(&config, memory_store()).await;
        fixture.handle.start().await.unwrap();
        fixture.target.fail_next_applies(1);

        fixture
            .source
            .insert(&users(), row(json!({"id": 1, "name": "Alice"})))
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while fixture.target.apply_calls() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);

        // The batch is waiting out its retry backoff
        let started = std::time::Instant::now();
        assert_eq!(fixture.handle.stop().await.unwrap(), SubscriptionState::Stopped);
        assert!(started.elapsed() < Duration::from_secs(10));
        drop(guard);

        let output = logs.contents();
        assert!(output.contains("Apply did not drain in time"), "{}", output);
        assert!(output.contains("batch_id="), "{}", output);
        assert!(output.contains("first_sequence="), "{}", output);
        assert!(output.contains("last_sequence="), "{}", output);

        // The aborted batch was never committed and is delivered again
        let status = fixture.handle.status();
        assert_ne!(
            status.last_checkpoint.get("public.users"),
            Some(&SequenceNumber::new(1, 0))
        );
        assert!(fixture.target.rows(&users()).is_empty());

        fixture.target.clear_failures();
        fixture.handle.start().await.unwrap();
        wait_for_rows(&fixture.target, 1).await;
    }
}
