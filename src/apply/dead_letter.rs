use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::ChangeEvent;

/// An event that could not be applied, kept on the target for operators.
///
/// Records are append-only and never deleted by the engine. The original
/// event keeps its sequence number so records can be replayed in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub subscription: String,
    pub original_event: ChangeEvent,
    pub failure_reason: String,
    pub attempt_count: u32,
    pub first_failed_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(
        event: ChangeEvent,
        failure_reason: impl Into<String>,
        attempt_count: u32,
        first_failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            subscription: event.subscription_id.clone(),
            original_event: event,
            failure_reason: failure_reason.into(),
            attempt_count,
            first_failed_at,
        }
    }
}

/// Orders records the way their events were captured.
pub fn replay_order(records: &mut [DeadLetterRecord]) {
    records.sort_by(|a, b| {
        (&a.original_event.table, a.original_event.sequence)
            .cmp(&(&b.original_event.table, b.original_event.sequence))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CapturedChange, ChangeOperation, SequenceNumber, TableRef};

    fn record(position: u64) -> DeadLetterRecord {
        let change = CapturedChange {
            table: TableRef::new("public", "users"),
            op: ChangeOperation::Insert,
            before: None,
            after: Some(Default::default()),
            transaction_id: None,
            sequence: SequenceNumber::new(position, 0),
        };
        DeadLetterRecord::new(
            ChangeEvent::from_capture("sub", change),
            "boom",
            5,
            Utc::now(),
        )
    }

    #[test]
    fn test_replay_order_follows_sequence() {
        let mut records = vec![record(9), record(3), record(5)];
        replay_order(&mut records);
        let positions: Vec<u64> = records
            .iter()
            .map(|r| r.original_event.sequence.position)
            .collect();
        assert_eq!(positions, vec![3, 5, 9]);
        assert_eq!(records[0].subscription, "sub");
    }

    #[test]
    fn test_record_round_trips_through_json() {
        let original = record(1);
        let encoded = serde_json::to_string(&original).unwrap();
        assert!(encoded.contains("\"attempt_count\":5"));
        let decoded: DeadLetterRecord = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, original);
    }
}
