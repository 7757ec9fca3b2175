use super::*;
use crate::manager::test_helpers::{FakeParityHandler, create_test_manager, populate_dir};
use crate::types::ItemStatus;
use std::sync::Arc;

const WAIT: Duration = Duration::from_secs(10);

fn fake() -> Arc<FakeParityHandler> {
    Arc::new(FakeParityHandler::new())
}

async fn protect_and_wait(manager: &ProtectionManager, path: &Path) {
    let response = protect(manager, path, Some(10)).await;
    assert!(response.success, "{:?}", response.failure);
    manager
        .wait_for_operations(&[response.operation_id.unwrap()], WAIT)
        .await
        .unwrap();
}

#[tokio::test]
async fn protect_then_list() {
    let (manager, temp_dir) = create_test_manager(fake()).await;
    let photos = populate_dir(temp_dir.path(), "photos", 2);
    protect_and_wait(&manager, &photos).await;

    let response = list(&manager, &ItemFilter::default()).await;
    assert!(response.success);
    assert_eq!(response.items.len(), 1);
    assert_eq!(response.items[0].path, photos);
    assert_eq!(response.items[0].redundancy, 10);
    assert_eq!(response.items[0].last_status, ItemStatus::Protected);

    let again = protect(&manager, &photos, Some(10)).await;
    assert!(again.success);
    assert!(again.skipped);
}

#[tokio::test]
async fn corrupted_file_shows_in_verify_stats() {
    let (manager, temp_dir) = create_test_manager(fake()).await;
    let photos = populate_dir(temp_dir.path(), "photos", 3);
    protect_and_wait(&manager, &photos).await;

    let victim = photos.join("file0.jpg");
    let mut bytes = std::fs::read(&victim).unwrap();
    bytes[0] ^= 0x01;
    std::fs::write(&victim, bytes).unwrap();

    let response = verify_and_wait(&manager, VerifyTarget::Path(photos.clone()), false, WAIT).await;
    assert!(response.success);
    let stats = response.stats.unwrap();
    assert_eq!(stats.failed_files, 1);
    assert_eq!(stats.errors.len(), 1);

    let items = list(&manager, &ItemFilter::default()).await.items;
    assert_eq!(items[0].last_status, ItemStatus::Damaged);
}

#[tokio::test]
async fn verify_returns_tasks_without_waiting() {
    let (manager, temp_dir) = create_test_manager(fake()).await;
    let photos = populate_dir(temp_dir.path(), "photos", 1);
    protect_and_wait(&manager, &photos).await;

    let response = verify(&manager, VerifyTarget::from_arg("all"), true).await;
    assert!(response.success);
    assert!(response.stats.is_none());
    assert_eq!(response.tasks.unwrap().len(), 1);
}

#[tokio::test]
async fn malformed_cancel_is_a_validation_failure() {
    let (manager, _temp_dir) = create_test_manager(fake()).await;

    let response = cancel(&manager, "op_bad-format").await;
    assert!(!response.success);
    assert_eq!(response.killed_processes, 0);
    let failure = response.failure.unwrap();
    assert_eq!(failure.code, "validation_error");
    assert_eq!(failure.http_status, 400);
    assert_eq!(failure.context.unwrap()["field"], "operation_id");

    let json = serde_json::to_value(cancel(&manager, "nope").await).unwrap();
    assert_eq!(json["success"], false);
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn remove_reports_partial_success() {
    let (manager, temp_dir) = create_test_manager(fake()).await;
    let photos = populate_dir(temp_dir.path(), "photos", 1);
    protect_and_wait(&manager, &photos).await;

    let response = remove(&manager, &[photos.clone(), temp_dir.path().join("other")]).await;
    assert!(!response.success);
    assert!(response.partial);
    assert_eq!(response.removed, vec![photos]);
    assert_eq!(response.errors.unwrap().len(), 1);
    assert!(response.message.contains("1 of 2"));
}

#[tokio::test]
async fn remove_reports_full_success() {
    let (manager, temp_dir) = create_test_manager(fake()).await;
    let photos = populate_dir(temp_dir.path(), "photos", 1);
    protect_and_wait(&manager, &photos).await;

    let response = remove(&manager, &[photos]).await;
    assert!(response.success);
    assert!(!response.partial);
    assert!(response.errors.is_none());

    let json = serde_json::to_value(&response).unwrap();
    assert!(json.get("errors").is_none());
    assert!(json.get("error").is_none());
}

#[tokio::test]
async fn status_wraps_snapshot() {
    let (manager, temp_dir) = create_test_manager(fake()).await;
    let photos = populate_dir(temp_dir.path(), "photos", 1);
    protect_and_wait(&manager, &photos).await;

    let response = status(&manager).await;
    assert!(response.success);
    let data = response.data.unwrap();
    assert_eq!(data.stats.total_items, 1);
    assert_eq!(data.recent_activity.len(), 1);

    let json = serde_json::to_value(status(&manager).await).unwrap();
    assert!(json["data"]["active_operations"].is_array());
    assert!(json["data"]["system_resources"].is_object());
}

#[tokio::test]
async fn shutting_down_maps_to_service_unavailable() {
    let (manager, temp_dir) = create_test_manager(fake()).await;
    let photos = populate_dir(temp_dir.path(), "photos", 1);
    manager.shutdown().await.unwrap();

    let response = protect(&manager, &photos, None).await;
    assert!(!response.success);
    assert_eq!(response.failure.unwrap().http_status, 503);
}
