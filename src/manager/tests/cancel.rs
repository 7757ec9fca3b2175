use super::*;

async fn wait_for_status(manager: &ProtectionManager, id: &OperationId, status: OperationStatus) {
    tokio::time::timeout(WAIT, async {
        while manager.db.get_operation(id).await.unwrap().unwrap().status != status {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn malformed_id_is_a_validation_error() {
    let (manager, _temp_dir) = create_test_manager(fake()).await;

    match manager.cancel("op_bad-format").await {
        Err(Error::Validation { field, .. }) => assert_eq!(field.as_deref(), Some("operation_id")),
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[tokio::test]
async fn unknown_id_is_not_found() {
    let (manager, _temp_dir) = create_test_manager(fake()).await;
    assert!(matches!(
        manager.cancel("op_deadbeef").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn cancel_running_operation() {
    let handler = Arc::new(FakeParityHandler::with_delay(Duration::from_secs(30)));
    let (manager, temp_dir) = create_test_manager(handler).await;
    let photos = populate_dir(temp_dir.path(), "photos", 1);

    let admission = manager
        .protect(&photos, ProtectOptions::default())
        .await
        .unwrap();
    let id = admission.queued[0].clone();
    wait_for_status(&manager, &id, OperationStatus::Processing).await;

    // Leftover scratch file matching the operation
    let scratch = manager.get_config().tools.scratch_dir.clone();
    std::fs::write(scratch.join(format!("{}.tmp", id)), b"partial").unwrap();

    let outcome = manager.cancel(id.as_str()).await.unwrap();
    assert_eq!(outcome.status, OperationStatus::Cancelled);
    assert_eq!(outcome.killed_processes, 0, "the fake handler spawns no process");
    assert!(!scratch.join(format!("{}.tmp", id)).exists());

    let op = manager.db.get_operation(&id).await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Cancelled);
    assert!(manager.db.get_item(&photos).await.unwrap().is_none());
}

#[tokio::test]
async fn cancel_pending_operation() {
    let handler = Arc::new(FakeParityHandler::with_delay(Duration::from_secs(30)));
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = test_config(temp_dir.path());
    config.queue.max_concurrent_operations = 1;
    let manager = ProtectionManager::with_parity_handler(config, handler)
        .await
        .unwrap();
    let photos = populate_dir(temp_dir.path(), "photos", 1);
    let music = populate_dir(temp_dir.path(), "music", 1);

    let first = manager
        .protect(&photos, ProtectOptions::default())
        .await
        .unwrap()
        .queued[0]
        .clone();
    wait_for_status(&manager, &first, OperationStatus::Processing).await;
    let second = manager
        .protect(&music, ProtectOptions::default())
        .await
        .unwrap()
        .queued[0]
        .clone();

    let mut events = manager.subscribe();
    let outcome = manager.cancel(second.as_str()).await.unwrap();
    assert_eq!(outcome.status, OperationStatus::Cancelled);
    assert_eq!(outcome.killed_processes, 0);
    match events.try_recv().unwrap() {
        Event::OperationCancelled { id, .. } => assert_eq!(id, second),
        other => panic!("unexpected event {:?}", other),
    }

    // The running one is untouched
    let running = manager.db.get_operation(&first).await.unwrap().unwrap();
    assert_eq!(running.status, OperationStatus::Processing);
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn cancelling_finished_operation_is_not_an_error() {
    let (manager, temp_dir) = create_test_manager(fake()).await;
    let photos = populate_dir(temp_dir.path(), "photos", 1);
    let op = protect_and_wait(&manager, &photos, 10).await;

    let outcome = manager.cancel(op.id.as_str()).await.unwrap();
    assert_eq!(outcome.status, OperationStatus::Completed);
    assert_eq!(outcome.killed_processes, 0);
}

#[cfg(unix)]
#[tokio::test]
async fn cancel_terminates_tagged_par2_process() {
    let (manager, _temp_dir) = create_test_manager(fake()).await;
    // Keep the queue from running it
    manager.shutdown().await.unwrap();

    let op = manager
        .db
        .enqueue_operation(
            OperationType::Verify,
            &crate::types::OperationParams::for_path("/mnt/user/photos"),
            crate::types::Priority::Normal,
        )
        .await
        .unwrap();

    // Stand-in process: argv[0] is par2 and the id rides in the environment
    let Ok(mut child) = std::process::Command::new("bash")
        .arg("-c")
        .arg("exec -a par2 sleep 60")
        .env(crate::process::OPERATION_ENV, op.id.as_str())
        .spawn()
    else {
        return;
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    let outcome = manager.cancel(op.id.as_str()).await.unwrap();
    assert_eq!(outcome.killed_processes, 1);
    assert_eq!(outcome.status, OperationStatus::Cancelled);
    let _ = child.wait();
}
