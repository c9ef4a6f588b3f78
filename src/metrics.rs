//! Per-subscription counters reported through status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct SubscriptionMetrics {
    captured: AtomicU64,
    applied: AtomicU64,
    batches: AtomicU64,
    conflicts: AtomicU64,
    dead_lettered: AtomicU64,
    skipped: AtomicU64,
    /// Events captured but not yet handled by apply
    in_flight: AtomicI64,
    /// Capture time (ms since epoch) of the newest handled event
    last_handled_captured_ms: AtomicI64,
    window: Mutex<Window>,
}

#[derive(Debug)]
struct Window {
    started: Instant,
    applied_at_start: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub events_captured: u64,
    pub events_applied: u64,
    pub batches_committed: u64,
    pub conflicts: u64,
    pub dead_lettered: u64,
    pub skipped: u64,
    /// Applied events per second since the pipeline started
    pub apply_throughput: f64,
}

impl Default for SubscriptionMetrics {
    fn default() -> Self {
        Self {
            captured: AtomicU64::new(0),
            applied: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            in_flight: AtomicI64::new(0),
            last_handled_captured_ms: AtomicI64::new(0),
            window: Mutex::new(Window {
                started: Instant::now(),
                applied_at_start: 0,
            }),
        }
    }
}

impl SubscriptionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new throughput window and forgets events of a torn down pipeline.
    pub fn pipeline_started(&self) {
        self.in_flight.store(0, Ordering::Relaxed);
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.started = Instant::now();
        window.applied_at_start = self.applied.load(Ordering::Relaxed);
    }

    pub fn record_captured(&self) {
        self.captured.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    /// Events leaving the pipeline, applied or not.
    pub fn record_handled(&self, count: usize, newest_captured_at: Option<DateTime<Utc>>) {
        self.in_flight.fetch_sub(count as i64, Ordering::Relaxed);
        if let Some(captured_at) = newest_captured_at {
            self.last_handled_captured_ms
                .fetch_max(captured_at.timestamp_millis(), Ordering::Relaxed);
        }
    }

    pub fn record_applied(&self, count: u64) {
        self.applied.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Wall clock minus capture time of the newest handled event, while
    /// events are waiting. Zero when the pipeline is caught up.
    pub fn lag(&self, now: DateTime<Utc>) -> Duration {
        if self.in_flight.load(Ordering::Relaxed) <= 0 {
            return Duration::ZERO;
        }
        let reference = match self.last_handled_captured_ms.load(Ordering::Relaxed) {
            0 => {
                let window = self.window.lock().unwrap_or_else(|e| e.into_inner());
                return window.started.elapsed();
            }
            ms => ms,
        };
        let lag_ms = now.timestamp_millis().saturating_sub(reference).max(0);
        Duration::from_millis(lag_ms as u64)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let applied = self.applied.load(Ordering::Relaxed);
        let throughput = {
            let window = self.window.lock().unwrap_or_else(|e| e.into_inner());
            let elapsed = window.started.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                applied.saturating_sub(window.applied_at_start) as f64 / elapsed
            } else {
                0.0
            }
        };
        MetricsSnapshot {
            events_captured: self.captured.load(Ordering::Relaxed),
            events_applied: applied,
            batches_committed: self.batches.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            apply_throughput: throughput,
        }
    }
}
