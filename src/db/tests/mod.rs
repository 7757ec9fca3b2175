use crate::db::*;
use crate::types::{ItemStatus, ProtectedItem, ProtectionMode};
use chrono::Utc;
use std::path::Path;
use tempfile::NamedTempFile;

mod close;
mod migrations;

async fn test_db() -> (Database, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    (db, temp_file)
}

fn protected_item(path: &str, redundancy: u8) -> ProtectedItem {
    let path = Path::new(path);
    ProtectedItem {
        path: path.to_path_buf(),
        mode: ProtectionMode::Directory,
        redundancy,
        size: 4096,
        file_count: 3,
        parity_location: path.join(".parity"),
        last_status: ItemStatus::Protected,
        protected_date: Utc::now(),
        last_verified: None,
        last_error: None,
    }
}
