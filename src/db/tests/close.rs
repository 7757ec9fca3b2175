use super::{protected_item, test_db};

/// Querying after the pool is closed returns an error rather than hanging
#[tokio::test]
async fn test_get_item_after_pool_close_returns_error() {
    let (db, _temp) = test_db().await;
    let item = protected_item("/mnt/user/photos", 10);
    db.upsert_item(&item).await.unwrap();
    assert!(db.get_item(&item.path).await.unwrap().is_some());

    db.pool().close().await;

    let result = db.get_item(&item.path).await;
    assert!(
        result.is_err(),
        "get_item after pool close should return an error, got: {:?}",
        result
    );
}
