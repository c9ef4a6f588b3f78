use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use uuid::Uuid;

use crate::checkpoint::Checkpoint;
use crate::event::{ChangeEvent, SequenceNumber, TableRef};

/// A group of events applied together.
#[derive(Debug, Clone)]
pub struct ApplyBatch {
    pub batch_id: Uuid,
    pub events: Vec<ChangeEvent>,
    pub created_at: DateTime<Utc>,
}

/// What an operator needs to find a batch again.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub events: usize,
    pub first_sequence: Option<SequenceNumber>,
    pub last_sequence: Option<SequenceNumber>,
}

impl ApplyBatch {
    pub fn new(events: Vec<ChangeEvent>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            events,
            created_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            batch_id: self.batch_id,
            events: self.events.len(),
            first_sequence: self.events.iter().map(|e| e.sequence).min(),
            last_sequence: self.events.iter().map(|e| e.sequence).max(),
        }
    }

    /// Drops events the checkpoint already covers and duplicates inside
    /// the batch, then orders by table and sequence.
    ///
    /// Returns the number of dropped events.
    pub fn prepare(&mut self, checkpoint: &Checkpoint) -> usize {
        let before = self.events.len();
        let mut seen: HashSet<(TableRef, SequenceNumber)> = HashSet::new();
        self.events.retain(|event| {
            event.sequence > checkpoint.position(&event.table)
                && seen.insert((event.table.clone(), event.sequence))
        });
        self.events
            .sort_by(|a, b| (&a.table, a.sequence).cmp(&(&b.table, b.sequence)));
        before - self.events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CapturedChange, ChangeOperation};

    fn event(table: &str, position: u64) -> ChangeEvent {
        ChangeEvent::from_capture(
            "sub",
            CapturedChange {
                table: TableRef::new("public", table),
                op: ChangeOperation::Insert,
                before: None,
                after: Some(Default::default()),
                transaction_id: None,
                sequence: SequenceNumber::new(position, 0),
            },
        )
    }

    #[test]
    fn test_prepare_filters_and_orders() {
        let mut checkpoint = Checkpoint::new("sub");
        checkpoint.advance(&TableRef::new("public", "users"), SequenceNumber::new(2, 0));

        let mut batch = ApplyBatch::new(vec![
            event("users", 5),
            event("orders", 1),
            event("users", 2),
            event("users", 4),
            event("users", 5),
        ]);
        assert_eq!(batch.prepare(&checkpoint), 2);

        let order: Vec<(String, u64)> = batch
            .events
            .iter()
            .map(|e| (e.table.table.clone(), e.sequence.position))
            .collect();
        assert_eq!(
            order,
            vec![
                ("orders".to_string(), 1),
                ("users".to_string(), 4),
                ("users".to_string(), 5)
            ]
        );
    }

    #[test]
    fn test_summary_range() {
        let batch = ApplyBatch::new(vec![event("users", 7), event("users", 3)]);
        let summary = batch.summary();
        assert_eq!(summary.events, 2);
        assert_eq!(summary.first_sequence, Some(SequenceNumber::new(3, 0)));
        assert_eq!(summary.last_sequence, Some(SequenceNumber::new(7, 0)));
    }
}
