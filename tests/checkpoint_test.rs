use cdc_relay::checkpoint::{Checkpoint, CheckpointManager, CheckpointTracker};
use cdc_relay::{SequenceNumber, TableRef};
use std::collections::BTreeMap;
use std::time::Duration;
use tempfile::TempDir;

fn users() -> TableRef {
    TableRef::new("public", "users")
}

fn orders() -> TableRef {
    TableRef::new("public", "orders")
}

#[tokio::test]
async fn test_checkpoint_persistence() {
    let temp_dir = TempDir::new().unwrap();
    let manager = CheckpointManager::for_subscription(temp_dir.path(), "users-sub");

    let mut checkpoint = Checkpoint::new("users-sub");
    checkpoint.advance(&users(), SequenceNumber::new(1234, 0));
    checkpoint.applied_count = 1000;
    manager.save(&checkpoint).await.unwrap();

    let loaded = manager.load().await.unwrap().expect("Checkpoint should exist");
    assert_eq!(loaded.subscription, "users-sub");
    assert_eq!(loaded.position(&users()), SequenceNumber::new(1234, 0));
    assert_eq!(loaded.applied_count, 1000);

    checkpoint.advance(&users(), SequenceNumber::new(2345, 1));
    checkpoint.applied_count = 2000;
    manager.save(&checkpoint).await.unwrap();

    let loaded = manager.load().await.unwrap().expect("Checkpoint should exist");
    assert_eq!(loaded.position(&users()), SequenceNumber::new(2345, 1));
    assert_eq!(loaded.applied_count, 2000);
}

#[tokio::test]
async fn test_checkpoint_recovery_simulation() {
    let temp_dir = TempDir::new().unwrap();

    // First run
    {
        let manager = CheckpointManager::for_subscription(temp_dir.path(), "sub");
        assert!(manager.load().await.unwrap().is_none());

        let mut checkpoint = Checkpoint::new("sub");
        checkpoint.advance(&users(), SequenceNumber::new(500, 0));
        checkpoint.applied_count = 500;
        manager.save(&checkpoint).await.unwrap();
    }

    // Restart continues from the persisted position
    {
        let manager = CheckpointManager::for_subscription(temp_dir.path(), "sub");
        let mut loaded = manager.load().await.unwrap().expect("Should recover checkpoint");
        assert_eq!(loaded.position(&users()), SequenceNumber::new(500, 0));

        loaded.advance(&users(), SequenceNumber::new(800, 0));
        loaded.applied_count += 300;
        manager.save(&loaded).await.unwrap();
    }

    {
        let manager = CheckpointManager::for_subscription(temp_dir.path(), "sub");
        let final_checkpoint = manager.load().await.unwrap().unwrap();
        assert_eq!(final_checkpoint.position(&users()), SequenceNumber::new(800, 0));
        assert_eq!(final_checkpoint.applied_count, 800);
    }
}

#[tokio::test]
async fn test_rapid_checkpoint_writes() {
    let temp_dir = TempDir::new().unwrap();
    let manager = CheckpointManager::for_subscription(temp_dir.path(), "sub");

    let mut checkpoint = Checkpoint::new("sub");
    for i in 1..=10u64 {
        checkpoint.advance(&users(), SequenceNumber::new(i * 1000, 0));
        checkpoint.applied_count = i * 100;
        manager.save(&checkpoint).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let final_checkpoint = manager.load().await.unwrap().unwrap();
    assert_eq!(final_checkpoint.position(&users()), SequenceNumber::new(10_000, 0));
    assert_eq!(final_checkpoint.applied_count, 1000);
}

#[tokio::test]
async fn test_delete_resets_progress() {
    let temp_dir = TempDir::new().unwrap();
    let manager = CheckpointManager::for_subscription(temp_dir.path(), "sub");

    manager.save(&Checkpoint::new("sub")).await.unwrap();
    assert!(manager.path().exists());

    manager.delete().await.unwrap();
    assert!(manager.load().await.unwrap().is_none());
    // Deleting twice is fine
    manager.delete().await.unwrap();
}

#[tokio::test]
async fn test_corrupt_checkpoint_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let manager = CheckpointManager::for_subscription(temp_dir.path(), "sub");
    tokio::fs::write(manager.path(), b"{ not json").await.unwrap();

    assert!(manager.load().await.is_err());
}

#[tokio::test]
async fn test_tracker_tables_advance_independently() {
    let temp_dir = TempDir::new().unwrap();
    let tracker = CheckpointTracker::open(
        CheckpointManager::for_subscription(temp_dir.path(), "sub"),
        "sub",
    )
    .await
    .unwrap();

    let mut advances = BTreeMap::new();
    advances.insert(users(), SequenceNumber::new(20, 0));
    advances.insert(orders(), SequenceNumber::new(7, 0));
    tracker.commit(&advances, 2, None).await.unwrap();

    let mut advances = BTreeMap::new();
    advances.insert(orders(), SequenceNumber::new(9, 0));
    let current = tracker.commit(&advances, 1, None).await.unwrap();

    assert_eq!(current.position(&users()), SequenceNumber::new(20, 0));
    assert_eq!(current.position(&orders()), SequenceNumber::new(9, 0));
    assert_eq!(current.applied_count, 3);
    assert_eq!(
        current.low_watermark([&users(), &orders()]),
        Some(SequenceNumber::new(9, 0))
    );

    // Nothing moved and nothing applied leaves the file untouched
    let before = tracker.current().timestamp;
    let unchanged = tracker.commit(&BTreeMap::new(), 0, None).await.unwrap();
    assert_eq!(unchanged.timestamp, before);
}
