use super::*;
use crate::types::{OperationParams, Priority};

/// Start a manager, stop its workers and hand back the shared config
async fn idle_manager(temp_dir: &tempfile::TempDir) -> (ProtectionManager, crate::config::Config) {
    let config = test_config(temp_dir.path());
    let manager = ProtectionManager::with_parity_handler(config.clone(), fake())
        .await
        .unwrap();
    manager.shutdown().await.unwrap();
    (manager, config)
}

#[tokio::test]
async fn processing_without_process_is_failed_as_orphaned() {
    let temp_dir = tempfile::tempdir().unwrap();
    let (first, config) = idle_manager(&temp_dir).await;

    let op = first
        .db
        .enqueue_operation(
            OperationType::Verify,
            &OperationParams::for_path(temp_dir.path().join("photos")),
            Priority::Normal,
        )
        .await
        .unwrap();
    let claimed = first.db.claim_next_operation(2).await.unwrap().unwrap();
    assert_eq!(claimed.id, op.id);
    // Simulate a crash: the row stays PROCESSING
    first.db.set_clean_start().await.unwrap();
    drop(first);

    let second = ProtectionManager::with_parity_handler(config, fake())
        .await
        .unwrap();
    let op = second.db.get_operation(&op.id).await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert!(op.completed_at.is_some());
    assert!(
        op.result
            .unwrap()
            .error
            .unwrap()
            .contains("orphaned by restart")
    );

    // A second pass has nothing left to do
    let report = second.reconcile().await.unwrap();
    assert!(report.orphaned.is_empty());
}

#[tokio::test]
async fn reconcile_reports_orphans() {
    let (manager, temp_dir) = create_test_manager(fake()).await;
    manager.shutdown().await.unwrap();

    let op = manager
        .db
        .enqueue_operation(
            OperationType::Protect,
            &OperationParams::for_path(temp_dir.path().join("photos")),
            Priority::High,
        )
        .await
        .unwrap();
    manager.db.claim_next_operation(1).await.unwrap().unwrap();

    let report = manager.reconcile().await.unwrap();
    assert_eq!(report.orphaned, vec![op.id]);
    assert!(report.adopted.is_empty());
}

#[tokio::test]
async fn vanished_paths_become_missing() {
    let temp_dir = tempfile::tempdir().unwrap();
    let config = test_config(temp_dir.path());
    let photos = populate_dir(temp_dir.path(), "photos", 1);
    let music = populate_dir(temp_dir.path(), "music", 1);

    let first = ProtectionManager::with_parity_handler(config.clone(), fake())
        .await
        .unwrap();
    protect_and_wait(&first, &photos, 10).await;
    protect_and_wait(&first, &music, 10).await;
    first.shutdown().await.unwrap();
    drop(first);

    std::fs::remove_dir_all(&photos).unwrap();
    std::fs::remove_dir_all(music.join(".parity")).unwrap();

    let second = ProtectionManager::with_parity_handler(config, fake())
        .await
        .unwrap();
    assert_eq!(
        second.db.get_item(&photos).await.unwrap().unwrap().last_status,
        ItemStatus::Missing
    );
    let music_item = second.db.get_item(&music).await.unwrap().unwrap();
    assert_eq!(music_item.last_status, ItemStatus::Error);
    assert!(music_item.last_error.unwrap().contains("missing"));

    // Already reconciled
    let report = second.reconcile().await.unwrap();
    assert!(report.missing_paths.is_empty());
    assert!(report.missing_parity.is_empty());
}

#[tokio::test]
async fn interrupted_remove_batch_is_failed() {
    let temp_dir = tempfile::tempdir().unwrap();
    let (first, config) = idle_manager(&temp_dir).await;

    let batch = first
        .db
        .enqueue_operation(
            OperationType::Remove,
            &OperationParams {
                targets: vec![temp_dir.path().join("photos")],
                ..Default::default()
            },
            Priority::Normal,
        )
        .await
        .unwrap();
    drop(first);

    let second = ProtectionManager::with_parity_handler(config, fake())
        .await
        .unwrap();
    let op = second.db.get_operation(&batch.id).await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert!(op.result.unwrap().error.unwrap().contains("interrupted"));
}
