//! Database layer for par2-protect
//!
//! Handles SQLite persistence for the protection catalog and the operation
//! queue/history.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] - Database lifecycle, schema migrations
//! - [`catalog`] - Protected item CRUD and aggregate statistics
//! - [`operations`] - Operation queue, admission control and history
//! - [`state`] - Runtime state (shutdown tracking)

use chrono::{DateTime, TimeZone, Utc};
use sqlx::{FromRow, sqlite::SqlitePool};
use std::path::PathBuf;

use crate::config::RetryConfig;
use crate::error::{DatabaseError, Error, Result};
use crate::types::{
    ItemStatus, Operation, OperationId, OperationParams, OperationResult, OperationStatus,
    OperationType, Priority, ProtectedItem, ProtectionMode,
};

mod catalog;
mod migrations;
mod operations;
mod state;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

/// Database handle for par2-protect
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    retry: RetryConfig,
}

/// Protected item row as stored
#[derive(Debug, Clone, FromRow)]
pub(crate) struct ItemRow {
    pub path: String,
    pub mode: i32,
    pub redundancy: i64,
    pub size: i64,
    pub file_count: i64,
    pub parity_location: String,
    pub last_status: i32,
    pub protected_date: i64,
    pub last_verified: Option<i64>,
    pub last_error: Option<String>,
}

impl From<ItemRow> for ProtectedItem {
    fn from(row: ItemRow) -> Self {
        ProtectedItem {
            path: PathBuf::from(row.path),
            mode: ProtectionMode::from_i32(row.mode),
            redundancy: row.redundancy.clamp(1, 100) as u8,
            size: row.size.max(0) as u64,
            file_count: row.file_count.max(0) as u64,
            parity_location: PathBuf::from(row.parity_location),
            last_status: ItemStatus::from_i32(row.last_status),
            protected_date: from_timestamp(row.protected_date),
            last_verified: row.last_verified.map(from_timestamp),
            last_error: row.last_error,
        }
    }
}

/// Operation row as stored
#[derive(Debug, Clone, FromRow)]
pub(crate) struct OperationRow {
    pub id: OperationId,
    pub operation_type: i32,
    pub params: String,
    pub status: i32,
    pub priority: i32,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub result: Option<String>,
    pub pid: Option<i64>,
}

impl TryFrom<OperationRow> for Operation {
    type Error = Error;

    fn try_from(row: OperationRow) -> Result<Self> {
        let params: OperationParams = serde_json::from_str(&row.params)?;
        let result: Option<OperationResult> = row
            .result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(Operation {
            id: row.id,
            operation_type: OperationType::from_i32(row.operation_type),
            params,
            status: OperationStatus::from_i32(row.status),
            priority: Priority::from_i32(row.priority),
            created_at: from_timestamp(row.created_at),
            started_at: row.started_at.map(from_timestamp),
            completed_at: row.completed_at.map(from_timestamp),
            result,
            pid: row.pid.and_then(|p| u32::try_from(p).ok()),
        })
    }
}

/// Column list shared by every operation SELECT
pub(crate) const OPERATION_COLUMNS: &str = "id, operation_type, params, status, priority, \
     created_at, started_at, completed_at, result, pid";

/// Column list shared by every item SELECT
pub(crate) const ITEM_COLUMNS: &str = "path, mode, redundancy, size, file_count, parity_location, \
     last_status, protected_date, last_verified, last_error";

impl Database {
    /// Run a write, retrying it while SQLite reports lock contention
    pub(crate) async fn retrying<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        crate::retry::with_retry(&self.retry, operation).await
    }
}

pub(crate) fn from_timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

pub(crate) fn path_key(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}

pub(crate) fn query_error(context: &str) -> impl FnOnce(sqlx::Error) -> Error + '_ {
    move |e| Error::Database(DatabaseError::from_sqlx(context, e))
}
