use super::test_db;

#[tokio::test]
async fn test_database_creation() {
    let (db, _temp) = test_db().await;

    let mut conn = db.pool.acquire().await.unwrap();
    let tables: Vec<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .fetch_all(&mut *conn)
            .await
            .unwrap();

    for table in ["protected_items", "operations", "runtime_state", "schema_version"] {
        assert!(tables.contains(&table.to_string()), "missing table {}", table);
    }
    drop(conn);

    db.close().await;
}

#[tokio::test]
async fn test_migrations_are_idempotent_across_reopen() {
    let temp_file = tempfile::NamedTempFile::new().unwrap();

    let db = crate::db::Database::new(temp_file.path()).await.unwrap();
    db.close().await;

    let db = crate::db::Database::new(temp_file.path()).await.unwrap();
    let versions: Vec<i64> = sqlx::query_scalar("SELECT version FROM schema_version")
        .fetch_all(db.pool())
        .await
        .unwrap();
    assert_eq!(versions, vec![1]);
    db.close().await;
}

#[tokio::test]
async fn test_parity_location_suffix_is_enforced_by_schema() {
    let (db, _temp) = test_db().await;
    let mut item = super::protected_item("/mnt/user/data", 10);
    item.parity_location = "/mnt/user/data".into();

    let result = db.upsert_item(&item).await;
    assert!(result.is_err(), "schema must reject a parity location without /.parity");
    assert!(db.get_item(&item.path).await.unwrap().is_none());
    db.close().await;
}

#[tokio::test]
async fn test_creates_missing_parent_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("state").join("par2protect.db");

    let db = crate::db::Database::new(&path).await.unwrap();
    assert!(path.exists());
    db.close().await;
}
