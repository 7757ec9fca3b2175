use super::*;

#[tokio::test]
async fn protect_records_item_and_parity() {
    let handler = fake();
    let (manager, temp_dir) = create_test_manager(handler.clone()).await;
    let photos = populate_dir(temp_dir.path(), "photos", 4);

    let mut events = manager.subscribe();
    let op = protect_and_wait(&manager, &photos, 10).await;
    assert_eq!(op.status, OperationStatus::Completed);
    assert!(op.started_at.is_some());
    assert!(op.completed_at >= op.started_at);

    let items = manager.list(&ItemFilter::default()).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].path, photos);
    assert_eq!(items[0].redundancy, 10);
    assert_eq!(items[0].file_count, 4);
    assert_eq!(items[0].last_status, ItemStatus::Protected);
    assert_eq!(items[0].parity_location, photos.join(".parity"));
    assert!(photos.join(".parity/photos.par2").is_file());

    let mut saw_protected = false;
    while let Ok(event) = events.try_recv() {
        if let Event::ItemProtected { path, redundancy } = event {
            assert_eq!(path, photos);
            assert_eq!(redundancy, 10);
            saw_protected = true;
        }
    }
    assert!(saw_protected, "ItemProtected should be emitted");
    assert_eq!(handler.runs(), 1);
}

#[tokio::test]
async fn protect_single_file_uses_parent_parity_dir() {
    let (manager, temp_dir) = create_test_manager(fake()).await;
    let docs = populate_dir(temp_dir.path(), "docs", 1);
    let file = docs.join("file0.jpg");

    let op = protect_and_wait(&manager, &file, 5).await;
    assert_eq!(op.status, OperationStatus::Completed);

    let item = manager.db.get_item(&file).await.unwrap().unwrap();
    assert_eq!(item.mode, crate::types::ProtectionMode::File);
    assert_eq!(item.parity_location, docs.join(".parity"));
    assert!(docs.join(".parity/file0.jpg.par2").is_file());
}

#[tokio::test]
async fn unchanged_item_is_skipped_unless_forced() {
    let handler = fake();
    let (manager, temp_dir) = create_test_manager(handler.clone()).await;
    let photos = populate_dir(temp_dir.path(), "photos", 3);
    protect_and_wait(&manager, &photos, 10).await;

    let again = manager
        .protect(
            &photos,
            ProtectOptions {
                redundancy: Some(10),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(again.queued.is_empty());
    assert_eq!(again.skipped.len(), 1);
    let skipped = manager.db.get_operation(&again.skipped[0]).await.unwrap().unwrap();
    assert_eq!(skipped.status, OperationStatus::Skipped);

    // A different redundancy is a change
    let op = protect_and_wait(&manager, &photos, 20).await;
    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!(manager.db.get_item(&photos).await.unwrap().unwrap().redundancy, 20);

    let forced = manager
        .protect(
            &photos,
            ProtectOptions {
                redundancy: Some(20),
                force: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let ops = wait_all(&manager, &forced.queued).await;
    assert_eq!(ops[0].status, OperationStatus::Completed);
    assert_eq!(handler.runs(), 3);
}

#[tokio::test]
async fn content_change_triggers_new_parity() {
    let (manager, temp_dir) = create_test_manager(fake()).await;
    let photos = populate_dir(temp_dir.path(), "photos", 2);
    protect_and_wait(&manager, &photos, 10).await;

    std::fs::write(photos.join("new.jpg"), b"fresh").unwrap();
    let op = protect_and_wait(&manager, &photos, 10).await;
    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!(manager.db.get_item(&photos).await.unwrap().unwrap().file_count, 3);
}

#[tokio::test]
async fn existing_parity_without_catalog_entry_is_skipped() {
    let (manager, temp_dir) = create_test_manager(fake()).await;
    let photos = populate_dir(temp_dir.path(), "photos", 2);
    std::fs::create_dir_all(photos.join(".parity")).unwrap();
    std::fs::write(photos.join(".parity/photos.par2"), b"from an earlier install").unwrap();

    let op = protect_and_wait(&manager, &photos, 10).await;
    assert_eq!(op.status, OperationStatus::Skipped);
    let item = manager.db.get_item(&photos).await.unwrap().unwrap();
    assert_eq!(item.last_status, ItemStatus::Unknown);
}

#[tokio::test]
async fn invalid_requests_are_never_enqueued() {
    let (manager, temp_dir) = create_test_manager(fake()).await;
    let photos = populate_dir(temp_dir.path(), "photos", 1);

    let missing = manager
        .protect(&temp_dir.path().join("nope"), ProtectOptions::default())
        .await;
    assert!(matches!(missing, Err(Error::Validation { .. })));

    let relative = manager
        .protect(Path::new("relative/photos"), ProtectOptions::default())
        .await;
    assert!(matches!(relative, Err(Error::Validation { .. })));

    let redundancy = manager
        .protect(
            &photos,
            ProtectOptions {
                redundancy: Some(0),
                ..Default::default()
            },
        )
        .await;
    match redundancy {
        Err(Error::Validation { field, .. }) => assert_eq!(field.as_deref(), Some("redundancy")),
        other => panic!("expected validation error, got {:?}", other),
    }

    assert_eq!(manager.history(10).await.unwrap().len(), 0);
}

#[tokio::test]
async fn empty_directory_fails_without_catalog_entry() {
    let (manager, temp_dir) = create_test_manager(fake()).await;
    let empty = temp_dir.path().join("empty");
    std::fs::create_dir_all(&empty).unwrap();

    let op = protect_and_wait(&manager, &empty, 10).await;
    assert_eq!(op.status, OperationStatus::Failed);
    assert!(op.result.unwrap().error.unwrap().contains("no files"));
    assert!(manager.db.get_item(&empty).await.unwrap().is_none());
}

#[tokio::test]
async fn trailing_slash_names_the_same_item() {
    let (manager, temp_dir) = create_test_manager(fake()).await;
    let photos = populate_dir(temp_dir.path(), "photos", 1);
    protect_and_wait(&manager, &photos, 10).await;

    let with_slash = format!("{}/", photos.display());
    let again = manager
        .protect(
            Path::new(&with_slash),
            ProtectOptions {
                redundancy: Some(10),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(again.skipped.len(), 1);
    assert_eq!(manager.list(&ItemFilter::default()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_reprotect_keeps_previous_parity() {
    let handler = fake();
    let (manager, temp_dir) = create_test_manager(handler.clone()).await;
    let photos = populate_dir(temp_dir.path(), "photos", 2);
    protect_and_wait(&manager, &photos, 10).await;
    let index = photos.join(".parity/photos.par2");
    let original = std::fs::read(&index).unwrap();

    handler.fail_creates(true);
    let op = protect_and_wait(&manager, &photos, 20).await;
    assert_eq!(op.status, OperationStatus::Failed);
    assert!(op.result.unwrap().error.unwrap().contains("disk full"));

    let item = manager.db.get_item(&photos).await.unwrap().unwrap();
    assert_eq!(item.last_status, ItemStatus::Protected);
    assert_eq!(item.redundancy, 10);
    assert_eq!(std::fs::read(&index).unwrap(), original);
    let mut names: Vec<String> = std::fs::read_dir(photos.join(".parity"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["photos.par2", "photos.vol00+01.par2"]);

    handler.fail_creates(false);
    let op = verify_and_wait(&manager, &photos).await;
    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!(
        manager.db.get_item(&photos).await.unwrap().unwrap().last_status,
        ItemStatus::Protected
    );
}

#[tokio::test]
async fn failed_reprotect_without_parity_marks_item_error() {
    let handler = fake();
    let (manager, temp_dir) = create_test_manager(handler.clone()).await;
    let photos = populate_dir(temp_dir.path(), "photos", 2);
    protect_and_wait(&manager, &photos, 10).await;
    std::fs::remove_dir_all(photos.join(".parity")).unwrap();

    handler.fail_creates(true);
    let op = protect_and_wait(&manager, &photos, 10).await;
    assert_eq!(op.status, OperationStatus::Failed);

    let item = manager.db.get_item(&photos).await.unwrap().unwrap();
    assert_eq!(item.last_status, ItemStatus::Error);
    assert!(item.last_error.unwrap().contains("could not be recreated"));
    // The partial index is not left to pass for parity
    assert!(!photos.join(".parity").exists());
}

#[tokio::test]
async fn file_named_after_its_directory_cannot_share_its_parity() {
    let (manager, temp_dir) = create_test_manager(fake()).await;
    let photos = populate_dir(temp_dir.path(), "photos", 2);
    protect_and_wait(&manager, &photos, 10).await;
    let clash = photos.join("photos");
    std::fs::write(&clash, b"same name as the directory").unwrap();

    match manager.protect(&clash, ProtectOptions::default()).await {
        Err(Error::Consistency(crate::error::ConsistencyError::ParitySetConflict {
            path,
            owner,
        })) => {
            assert_eq!(path, clash);
            assert_eq!(owner, photos);
        }
        other => panic!("expected a parity set conflict, got {:?}", other),
    }
    assert!(manager.db.get_item(&clash).await.unwrap().is_none());
    assert!(
        manager
            .db
            .operations_for_path(&clash, OperationStatus::Pending)
            .await
            .unwrap()
            .is_empty()
    );
    assert!(photos.join(".parity/photos.par2").is_file());
}
