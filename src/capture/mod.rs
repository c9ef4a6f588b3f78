//! Capture engine: turns a source's change log (or audit table) into an
//! ordered, lazy stream of change events per table.
//!
//! The stream keeps an in-memory cursor only. It reads the next page when
//! the previous one was consumed, so a slow consumer holds the cursor
//! still instead of buffering. Restarting from the committed checkpoint
//! replays whatever was not yet applied.

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::datastore::{Capabilities, SourceConnection};
use crate::event::{CapturedChange, ChangeEvent, SequenceNumber, TableRef};
use crate::retry::Backoff;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Tail the source's transaction log
    Log,
    /// Poll a trigger-maintained audit table
    Polling,
}

impl fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureMode::Log => f.write_str("log"),
            CaptureMode::Polling => f.write_str("polling"),
        }
    }
}

impl CaptureMode {
    /// Log capture when the source supports it, unless a mode is forced.
    pub fn select(capabilities: Capabilities, forced: Option<CaptureMode>) -> Result<Self> {
        match forced {
            Some(CaptureMode::Log) if !capabilities.supports_log_cdc => Err(Error::Config(
                "log capture requested but the source does not support it".into(),
            )),
            Some(mode) => Ok(mode),
            None if capabilities.supports_log_cdc => Ok(CaptureMode::Log),
            None => Ok(CaptureMode::Polling),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Changes read per source round trip
    pub page_size: usize,
    /// Wait after a read that returned nothing new
    pub poll_interval: Duration,
    /// Retry schedule for transient source errors
    pub retry: Backoff,
}

#[derive(Clone)]
pub struct CaptureEngine {
    source: Arc<dyn SourceConnection>,
    mode: CaptureMode,
    options: CaptureOptions,
}

struct CaptureCursor {
    engine: CaptureEngine,
    subscription_id: String,
    table: TableRef,
    position: SequenceNumber,
    buffered: VecDeque<CapturedChange>,
}

impl CaptureEngine {
    pub fn new(source: Arc<dyn SourceConnection>, mode: CaptureMode, options: CaptureOptions) -> Self {
        Self {
            source,
            mode,
            options,
        }
    }

    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    /// Streams changes of `table` strictly after `checkpoint`.
    ///
    /// The stream never ends on its own. It yields an error and ends when
    /// the source fails permanently, for example with `LogGap`.
    pub fn start_capture(
        &self,
        subscription_id: &str,
        table: TableRef,
        checkpoint: SequenceNumber,
    ) -> BoxStream<'static, Result<ChangeEvent>> {
        info!(
            subscription = %subscription_id,
            table = %table,
            mode = %self.mode,
            from = %checkpoint,
            "Starting capture"
        );
        let cursor = CaptureCursor {
            engine: self.clone(),
            subscription_id: subscription_id.to_string(),
            table,
            position: checkpoint,
            buffered: VecDeque::new(),
        };
        stream::try_unfold(cursor, |mut cursor| async move {
            let change = cursor.next_change().await?;
            let event = ChangeEvent::from_capture(&cursor.subscription_id, change);
            Ok::<_, Error>(Some((event, cursor)))
        })
        .boxed()
    }

    async fn read_page(&self, table: &TableRef, after: SequenceNumber) -> Result<Vec<CapturedChange>> {
        let source = &self.source;
        let limit = self.options.page_size;
        match self.mode {
            CaptureMode::Log => {
                self.options
                    .retry
                    .retry("read change log", move |_| source.read_log(table, after, limit))
                    .await
            }
            CaptureMode::Polling => {
                self.options
                    .retry
                    .retry("poll audit table", move |_| source.poll_audit(table, after, limit))
                    .await
            }
        }
    }
}

impl CaptureCursor {
    async fn next_change(&mut self) -> Result<CapturedChange> {
        loop {
            if let Some(change) = self.buffered.pop_front() {
                self.position = change.sequence;
                return Ok(change);
            }

            let page = self.engine.read_page(&self.table, self.position).await?;
            let mut last = self.position;
            for change in page {
                if change.table != self.table {
                    continue;
                }
                if change.sequence <= last {
                    warn!(
                        table = %self.table,
                        sequence = %change.sequence,
                        after = %last,
                        "Skipping change with non-increasing sequence"
                    );
                    continue;
                }
                last = change.sequence;
                self.buffered.push_back(change);
            }

            if self.buffered.is_empty() {
                tokio::time::sleep(self.engine.options.poll_interval).await;
            } else {
                debug!(table = %self.table, changes = self.buffered.len(), "Read changes");
            }
        }
    }
}
