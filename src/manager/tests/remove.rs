use super::*;
use crate::error::ConsistencyError;

#[tokio::test]
async fn remove_deletes_parity_and_catalog_entry() {
    let (manager, temp_dir) = create_test_manager(fake()).await;
    let photos = populate_dir(temp_dir.path(), "photos", 2);
    protect_and_wait(&manager, &photos, 10).await;

    // Three artifacts in the parity directory
    let parity = photos.join(".parity");
    std::fs::write(parity.join("photos.vol01+02.par2"), b"more recovery").unwrap();
    assert_eq!(std::fs::read_dir(&parity).unwrap().count(), 3);

    let report = manager.remove(&[photos.clone()]).await.unwrap();
    assert_eq!(report.removed, vec![photos.clone()]);
    assert!(report.failures.is_empty());
    assert!(report.is_complete_success());

    assert!(!parity.exists());
    assert!(photos.join("file0.jpg").exists(), "protected data must survive");
    assert!(manager.list(&ItemFilter::default()).await.unwrap().is_empty());

    let op = manager
        .db
        .get_operation(report.operation_id.as_ref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(op.operation_type, OperationType::Remove);
    assert_eq!(op.status, OperationStatus::Completed);
}

#[tokio::test]
async fn tampered_parity_location_fails_closed() {
    let (manager, temp_dir) = create_test_manager(fake()).await;
    let photos = populate_dir(temp_dir.path(), "photos", 2);
    protect_and_wait(&manager, &photos, 10).await;

    let data = temp_dir.path().join("data");
    std::fs::create_dir_all(&data).unwrap();
    std::fs::write(data.join("precious.bin"), b"do not delete").unwrap();

    // The schema refuses this value, so bypass CHECK on one connection
    let mut conn = manager.db.pool().acquire().await.unwrap();
    sqlx::query("PRAGMA ignore_check_constraints = ON")
        .execute(&mut *conn)
        .await
        .unwrap();
    sqlx::query("UPDATE protected_items SET parity_location = ? WHERE path = ?")
        .bind(data.to_string_lossy().into_owned())
        .bind(photos.to_string_lossy().into_owned())
        .execute(&mut *conn)
        .await
        .unwrap();
    sqlx::query("PRAGMA ignore_check_constraints = OFF")
        .execute(&mut *conn)
        .await
        .unwrap();
    drop(conn);

    let report = manager.remove(&[photos.clone()]).await.unwrap();
    assert!(report.removed.is_empty());
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].error.contains("/.parity"));

    assert!(data.join("precious.bin").exists());
    assert!(photos.join(".parity/photos.par2").exists());
    assert!(manager.db.get_item(&photos).await.unwrap().is_some());

    let op = manager
        .db
        .get_operation(report.operation_id.as_ref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
}

#[tokio::test]
async fn guard_rejects_locations_without_parity_suffix() {
    for location in ["/mnt/user/data", "/.parity", "relative/.parity", "/mnt/user/../.parity"] {
        let err = crate::parity::check_parity_location(Path::new(location)).unwrap_err();
        assert!(
            matches!(err, Error::Consistency(ConsistencyError::UnsafeParityLocation { .. })),
            "{} should be refused",
            location
        );
    }
}

#[tokio::test]
async fn partial_batch_reports_each_path() {
    let (manager, temp_dir) = create_test_manager(fake()).await;
    let photos = populate_dir(temp_dir.path(), "photos", 1);
    protect_and_wait(&manager, &photos, 10).await;
    let unknown = temp_dir.path().join("never-protected");

    let report = manager
        .remove(&[unknown.clone(), photos.clone()])
        .await
        .unwrap();
    assert!(report.is_partial());
    assert_eq!(report.removed, vec![photos]);
    assert_eq!(report.failures[0].path, unknown);
    assert!(report.failures[0].error.contains("not protected"));
}

#[tokio::test]
async fn shared_parity_directory_keeps_other_items() {
    let (manager, temp_dir) = create_test_manager(fake()).await;
    let docs = populate_dir(temp_dir.path(), "docs", 2);
    let a = docs.join("file0.jpg");
    std::fs::write(docs.join("b.pdf"), b"second document").unwrap();
    let b = docs.join("b.pdf");
    protect_and_wait(&manager, &a, 10).await;
    protect_and_wait(&manager, &b, 10).await;

    let report = manager.remove(&[a.clone()]).await.unwrap();
    assert!(report.is_complete_success());

    let parity = docs.join(".parity");
    assert!(!parity.join("file0.jpg.par2").exists());
    assert!(parity.join("b.pdf.par2").exists());
    assert!(manager.db.get_item(&b).await.unwrap().is_some());

    let report = manager.remove(&[b]).await.unwrap();
    assert!(report.is_complete_success());
    assert!(!parity.exists());
}

#[tokio::test]
async fn remove_refuses_path_with_running_operation() {
    let handler = Arc::new(FakeParityHandler::with_delay(Duration::from_secs(30)));
    let (manager, temp_dir) = create_test_manager(handler).await;
    let photos = populate_dir(temp_dir.path(), "photos", 1);

    // Catalog entry first, then a long verify holding the path
    let item = crate::types::ProtectedItem {
        path: photos.clone(),
        mode: crate::types::ProtectionMode::Directory,
        redundancy: 10,
        size: 1,
        file_count: 1,
        parity_location: photos.join(".parity"),
        last_status: ItemStatus::Protected,
        protected_date: chrono::Utc::now(),
        last_verified: None,
        last_error: None,
    };
    manager.db.upsert_item(&item).await.unwrap();
    std::fs::create_dir_all(photos.join(".parity")).unwrap();
    std::fs::write(photos.join(".parity/photos.par2"), b"").unwrap();

    let admission = manager
        .verify(VerifyTarget::Path(photos.clone()), VerifyOptions::default())
        .await
        .unwrap();
    let id = admission.queued[0].clone();
    tokio::time::timeout(WAIT, async {
        while manager.db.get_operation(&id).await.unwrap().unwrap().status
            != OperationStatus::Processing
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    let report = manager.remove(&[photos.clone()]).await.unwrap();
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].error.contains("running"));
    assert!(photos.join(".parity").exists());

    manager.cancel(id.as_str()).await.unwrap();
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn empty_request_is_a_validation_error() {
    let (manager, _temp_dir) = create_test_manager(fake()).await;
    assert!(matches!(
        manager.remove(&[]).await,
        Err(Error::Validation { .. })
    ));
}

#[tokio::test]
async fn removing_entry_that_shares_a_parity_set_leaves_it_in_place() {
    let (manager, temp_dir) = create_test_manager(fake()).await;
    let photos = populate_dir(temp_dir.path(), "photos", 2);
    protect_and_wait(&manager, &photos, 10).await;

    // A file entry written before conflicts were refused at admission
    let clash = photos.join("photos");
    std::fs::write(&clash, b"same name as the directory").unwrap();
    let mut entry = manager.db.get_item(&photos).await.unwrap().unwrap();
    entry.path = clash.clone();
    entry.mode = crate::types::ProtectionMode::File;
    entry.last_status = ItemStatus::Unknown;
    manager.db.upsert_item(&entry).await.unwrap();

    let report = manager.remove(&[clash.clone()]).await.unwrap();
    assert!(report.is_complete_success());
    assert_eq!(report.removed, vec![clash.clone()]);
    assert!(manager.db.get_item(&clash).await.unwrap().is_none());

    assert!(photos.join(".parity/photos.par2").is_file());
    assert!(clash.exists());
    assert_eq!(
        manager.db.get_item(&photos).await.unwrap().unwrap().last_status,
        ItemStatus::Protected
    );
    let op = verify_and_wait(&manager, &photos).await;
    assert_eq!(op.status, OperationStatus::Completed);
}
