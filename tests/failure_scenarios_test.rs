mod common;

use cdc_relay::subscription::StatusStore;
use cdc_relay::{ErrorKind, SequenceNumber, SubscriptionState};
use common::*;
use serde_json::json;
use std::time::Duration;

fn with_on_error(on_error: &str) -> String {
    USERS_CONFIG.replace(
        "retry = { max_attempts = 5, backoff_secs = 0.01 }",
        &format!(
            "retry = {{ max_attempts = 5, backoff_secs = 0.01 }}\n    on_error = \"{}\"",
            on_error
        ),
    )
}

#[tokio::test]
async fn test_poison_event_is_dead_lettered_and_replayed() {
    let p = pipeline(&with_on_error("route-to-dlq")).await;
    let handle = p.engine.subscription("users-sub").unwrap();
    p.target
        .fail_writes_for_key(&replica_users(), row(json!({"id": 2})));
    p.engine.start("users-sub").await.unwrap();

    for (id, name) in [(1, "Alice"), (2, "Bob"), (3, "Carol")] {
        p.source
            .insert(&users(), row(json!({"id": id, "name": name})))
            .unwrap();
    }

    // The stream continues past the poison event
    let status = handle
        .wait_for(|s| {
            s.last_checkpoint.get("public.users") == Some(&SequenceNumber::new(3, 0))
                && s.metrics.dead_lettered == 1
                && s.metrics.events_applied == 2
        })
        .await
        .unwrap();
    assert_eq!(status.state, SubscriptionState::Streaming);
    assert_eq!(p.target.rows(&replica_users()).len(), 2);

    let records = p.engine.dead_letters("users-sub").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].subscription, "users-sub");
    assert_eq!(records[0].attempt_count, 5);
    assert_eq!(records[0].original_event.sequence, SequenceNumber::new(2, 0));

    p.target.clear_failures();
    let report = p.engine.replay_dead_letters("users-sub").await.unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(
        p.target.row(&replica_users(), &row(json!({"id": 2}))),
        Some(row(json!({"id": 2, "name": "Bob"})))
    );
    // Records stay for auditing
    assert_eq!(p.engine.dead_letters("users-sub").await.unwrap().len(), 1);

    p.engine.shutdown().await;
}

#[tokio::test]
async fn test_stop_policy_fails_subscription() {
    let p = pipeline(&with_on_error("stop")).await;
    let handle = p.engine.subscription("users-sub").unwrap();
    p.target
        .fail_writes_for_key(&replica_users(), row(json!({"id": 2})));
    p.engine.start("users-sub").await.unwrap();

    p.source.insert(&users(), row(json!({"id": 1, "name": "Alice"}))).unwrap();
    handle
        .wait_for(|s| s.last_checkpoint.get("public.users") == Some(&SequenceNumber::new(1, 0)))
        .await
        .unwrap();
    p.source.insert(&users(), row(json!({"id": 2, "name": "Bob"}))).unwrap();

    let status = handle
        .wait_for(|s| s.state == SubscriptionState::Failed)
        .await
        .unwrap();
    let error = status.error.expect("failed status carries the error");
    assert_eq!(error.kind, ErrorKind::ApplyFailure);
    assert_eq!(error.checkpoint["public.users"], SequenceNumber::new(1, 0));
    assert!(p.target.dead_letter_records().is_empty());

    // Restarting after the cause is fixed picks up from the checkpoint
    p.target.clear_failures();
    assert_eq!(p.engine.start("users-sub").await.unwrap(), SubscriptionState::Streaming);
    handle
        .wait_for(|s| s.last_checkpoint.get("public.users") == Some(&SequenceNumber::new(2, 0)))
        .await
        .unwrap();
    assert_eq!(p.target.rows(&replica_users()).len(), 2);

    p.engine.shutdown().await;
}

#[tokio::test]
async fn test_transient_target_failures_are_retried() {
    let p = pipeline(USERS_CONFIG).await;
    let handle = p.engine.subscription("users-sub").unwrap();
    p.target.fail_next_applies(3);
    p.engine.start("users-sub").await.unwrap();

    p.source.insert(&users(), row(json!({"id": 1, "name": "Alice"}))).unwrap();
    let status = handle
        .wait_for(|s| {
            s.last_checkpoint.get("public.users") == Some(&SequenceNumber::new(1, 0))
                && s.metrics.events_applied == 1
        })
        .await
        .unwrap();

    assert_eq!(status.state, SubscriptionState::Streaming);
    assert_eq!(status.metrics.dead_lettered, 0);
    assert_eq!(p.target.rows(&replica_users()).len(), 1);

    p.engine.shutdown().await;
}

#[tokio::test]
async fn test_log_gap_is_reported_in_persisted_status() {
    let p = pipeline(USERS_CONFIG).await;
    let handle = p.engine.subscription("users-sub").unwrap();
    p.engine.start("users-sub").await.unwrap();

    p.source.insert(&users(), row(json!({"id": 1, "name": "Alice"}))).unwrap();
    handle
        .wait_for(|s| s.last_checkpoint.get("public.users") == Some(&SequenceNumber::new(1, 0)))
        .await
        .unwrap();
    p.engine.stop("users-sub").await.unwrap();

    // The source drops changes the subscription has not consumed
    p.source.insert(&users(), row(json!({"id": 2, "name": "Bob"}))).unwrap();
    p.source.truncate_log(SequenceNumber::new(2, 0));
    p.engine.start("users-sub").await.unwrap();

    let store = StatusStore::for_subscription(p.dir.path(), "users-sub");
    let persisted = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(status) = store.load().await.unwrap() {
                if status.state == SubscriptionState::Failed {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("failed status persisted");

    let error = persisted.error.unwrap();
    assert_eq!(error.kind, ErrorKind::LogGap);
    assert_eq!(error.checkpoint["public.users"], SequenceNumber::new(1, 0));
    // Bob never arrived; no silent skip past the gap
    assert_eq!(p.target.rows(&replica_users()).len(), 1);

    p.engine.shutdown().await;
}
