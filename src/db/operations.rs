//! Operation queue: admission, lifecycle transitions and history.
//!
//! Status only moves forward. Every transition out of PENDING/PROCESSING is
//! guarded by `WHERE status IN (0, 1)`, so a duplicate completion signal is a
//! logged no-op instead of a regression.

use std::path::Path;
use std::time::Duration;

use crate::types::{
    Operation, OperationId, OperationParams, OperationResult, OperationStatus, OperationType,
    Priority,
};
use crate::{Error, Result};

use super::{Database, OPERATION_COLUMNS, OperationRow, path_key, query_error};

impl Database {
    /// Admit a new PENDING operation
    pub async fn enqueue_operation(
        &self,
        operation_type: OperationType,
        params: &OperationParams,
        priority: Priority,
    ) -> Result<Operation> {
        self.insert_operation(
            operation_type,
            params,
            priority,
            OperationStatus::Pending,
            None,
        )
        .await
    }

    /// Record an operation that is satisfied without running
    ///
    /// The row is written directly as SKIPPED with `reason` as its message.
    pub async fn record_skipped_operation(
        &self,
        operation_type: OperationType,
        params: &OperationParams,
        priority: Priority,
        reason: &str,
    ) -> Result<Operation> {
        let result = OperationResult::message(reason);
        self.insert_operation(
            operation_type,
            params,
            priority,
            OperationStatus::Skipped,
            Some(&result),
        )
        .await
    }

    async fn insert_operation(
        &self,
        operation_type: OperationType,
        params: &OperationParams,
        priority: Priority,
        status: OperationStatus,
        result: Option<&OperationResult>,
    ) -> Result<Operation> {
        let id = OperationId::generate();
        let params_json = serde_json::to_string(params)?;
        let result_json = result.map(serde_json::to_string).transpose()?;
        let path = params.path.as_deref().map(path_key);
        let terminal = status.is_terminal();

        let (id_ref, params_ref, result_ref, path_ref) =
            (&id, &params_json, &result_json, &path);
        self.retrying(move || async move {
            let now = chrono::Utc::now().timestamp();
            let finished = terminal.then_some(now);
            sqlx::query(
                r#"
                INSERT INTO operations (
                    id, operation_type, params, path, status, priority,
                    created_at, started_at, completed_at, result
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(id_ref)
            .bind(operation_type.to_i32())
            .bind(params_ref)
            .bind(path_ref)
            .bind(status.to_i32())
            .bind(priority.to_i32())
            .bind(now)
            .bind(finished)
            .bind(finished)
            .bind(result_ref)
            .execute(&self.pool)
            .await
            .map_err(query_error("Failed to insert operation"))?;
            Ok(())
        })
        .await?;

        tracing::debug!(
            operation_id = %id,
            operation_type = %operation_type,
            status = ?status,
            "operation recorded"
        );

        self.get_operation(&id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("operation {}", id)))
    }

    /// Atomically move the next PENDING operation to PROCESSING
    ///
    /// Returns `None` when `max_concurrent` operations are already PROCESSING
    /// or nothing is eligible. Highest priority wins, then oldest. Operations
    /// whose path already has a PROCESSING operation wait, and REMOVE
    /// operations are never claimed (they run inline and take no slot).
    pub async fn claim_next_operation(&self, max_concurrent: usize) -> Result<Option<Operation>> {
        let ceiling = i64::try_from(max_concurrent).unwrap_or(i64::MAX);
        self.retrying(move || self.claim_next_once(ceiling)).await
    }

    async fn claim_next_once(&self, ceiling: i64) -> Result<Option<Operation>> {
        let sql = format!(
            r#"
            UPDATE operations
            SET status = 1, started_at = MAX(?, created_at)
            WHERE seq = (
                SELECT candidate.seq FROM operations AS candidate
                WHERE candidate.status = 0
                  AND candidate.operation_type != 3
                  AND (candidate.path IS NULL OR candidate.path NOT IN (
                      SELECT busy.path FROM operations AS busy
                      WHERE busy.status = 1 AND busy.path IS NOT NULL))
                ORDER BY candidate.priority DESC, candidate.seq ASC
                LIMIT 1
            )
            AND (SELECT COUNT(*) FROM operations WHERE status = 1) < ?
            RETURNING {}
            "#,
            OPERATION_COLUMNS
        );

        // IMMEDIATE takes the write lock up front so the ceiling check and the
        // status flip see the same PROCESSING count. Dropping the transaction
        // before commit rolls it back.
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(query_error("Failed to begin claim"))?;

        let row = sqlx::query_as::<_, OperationRow>(&sql)
            .bind(chrono::Utc::now().timestamp())
            .bind(ceiling)
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_error("Failed to claim operation"))?;

        tx.commit()
            .await
            .map_err(query_error("Failed to commit claim"))?;

        let operation = row.map(Operation::try_from).transpose()?;
        if let Some(op) = &operation {
            tracing::debug!(
                operation_id = %op.id,
                operation_type = %op.operation_type,
                "operation claimed"
            );
        }
        Ok(operation)
    }

    /// Mark an operation COMPLETED
    ///
    /// Returns `false` (and logs a warning) when it was already terminal.
    pub async fn complete_operation(
        &self,
        id: &OperationId,
        result: &OperationResult,
    ) -> Result<bool> {
        self.finish_operation(id, OperationStatus::Completed, result)
            .await
    }

    /// Mark an operation FAILED
    ///
    /// Returns `false` (and logs a warning) when it was already terminal.
    pub async fn fail_operation(&self, id: &OperationId, result: &OperationResult) -> Result<bool> {
        self.finish_operation(id, OperationStatus::Failed, result)
            .await
    }

    /// Mark an operation CANCELLED
    ///
    /// Returns `false` (and logs a warning) when it was already terminal.
    pub async fn cancel_operation(
        &self,
        id: &OperationId,
        result: &OperationResult,
    ) -> Result<bool> {
        self.finish_operation(id, OperationStatus::Cancelled, result)
            .await
    }

    /// Mark an operation SKIPPED with `reason`
    pub async fn skip_operation(&self, id: &OperationId, reason: &str) -> Result<bool> {
        self.finish_operation(
            id,
            OperationStatus::Skipped,
            &OperationResult::message(reason),
        )
        .await
    }

    async fn finish_operation(
        &self,
        id: &OperationId,
        status: OperationStatus,
        result: &OperationResult,
    ) -> Result<bool> {
        let result_json = serde_json::to_string(result)?;
        let result_ref = &result_json;

        let updated = self
            .retrying(move || async move {
                let now = chrono::Utc::now().timestamp();
                let outcome = sqlx::query(
                    r#"
                    UPDATE operations
                    SET status = ?,
                        result = ?,
                        started_at = COALESCE(started_at, MAX(?, created_at)),
                        completed_at = MAX(?, COALESCE(started_at, created_at))
                    WHERE id = ? AND status IN (0, 1)
                    "#,
                )
                .bind(status.to_i32())
                .bind(result_ref)
                .bind(now)
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(query_error("Failed to finish operation"))?;
                Ok(outcome.rows_affected() > 0)
            })
            .await?;

        if updated {
            return Ok(true);
        }

        let current: Option<i32> = sqlx::query_scalar("SELECT status FROM operations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("Failed to read operation status"))?;

        match current {
            None => Err(Error::NotFound(format!("operation {}", id))),
            Some(current) => {
                tracing::warn!(
                    operation_id = %id,
                    current = ?OperationStatus::from_i32(current),
                    requested = ?status,
                    "operation already terminal, ignoring transition"
                );
                Ok(false)
            }
        }
    }

    /// Record the PID of the subprocess running `id` (`None` clears it)
    pub async fn set_operation_pid(&self, id: &OperationId, pid: Option<u32>) -> Result<()> {
        let pid = pid.map(i64::from);
        self.retrying(move || async move {
            sqlx::query("UPDATE operations SET pid = ? WHERE id = ?")
                .bind(pid)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(query_error("Failed to record operation pid"))?;
            Ok(())
        })
        .await
    }

    /// Get an operation by id
    pub async fn get_operation(&self, id: &OperationId) -> Result<Option<Operation>> {
        let sql = format!("SELECT {} FROM operations WHERE id = ?", OPERATION_COLUMNS);
        let row = sqlx::query_as::<_, OperationRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("Failed to get operation"))?;

        row.map(Operation::try_from).transpose()
    }

    /// Operations in the active queue view
    ///
    /// PENDING and PROCESSING operations, plus terminal ones that finished
    /// within `retention`. Oldest first.
    pub async fn list_active_operations(&self, retention: Duration) -> Result<Vec<Operation>> {
        let cutoff = chrono::Utc::now().timestamp()
            - i64::try_from(retention.as_secs()).unwrap_or(i64::MAX / 2);
        let sql = format!(
            r#"
            SELECT {} FROM operations
            WHERE status IN (0, 1) OR completed_at >= ?
            ORDER BY seq ASC
            "#,
            OPERATION_COLUMNS
        );
        self.fetch_operations(sqlx::query_as(&sql).bind(cutoff), "Failed to list active operations")
            .await
    }

    /// Operations with `status`, oldest first
    pub async fn list_operations_by_status(
        &self,
        status: OperationStatus,
    ) -> Result<Vec<Operation>> {
        let sql = format!(
            "SELECT {} FROM operations WHERE status = ? ORDER BY seq ASC",
            OPERATION_COLUMNS
        );
        self.fetch_operations(
            sqlx::query_as(&sql).bind(status.to_i32()),
            "Failed to list operations by status",
        )
        .await
    }

    /// Most recently finished operations, newest first
    pub async fn recent_operations(&self, limit: u32) -> Result<Vec<Operation>> {
        let sql = format!(
            r#"
            SELECT {} FROM operations
            WHERE status NOT IN (0, 1)
            ORDER BY completed_at DESC, seq DESC
            LIMIT ?
            "#,
            OPERATION_COLUMNS
        );
        self.fetch_operations(
            sqlx::query_as(&sql).bind(i64::from(limit)),
            "Failed to list recent operations",
        )
        .await
    }

    /// Full history, newest first
    pub async fn operation_history(&self, limit: u32, offset: u32) -> Result<Vec<Operation>> {
        let sql = format!(
            "SELECT {} FROM operations ORDER BY seq DESC LIMIT ? OFFSET ?",
            OPERATION_COLUMNS
        );
        self.fetch_operations(
            sqlx::query_as(&sql)
                .bind(i64::from(limit))
                .bind(i64::from(offset)),
            "Failed to read operation history",
        )
        .await
    }

    /// Operations targeting `path` with `status`, oldest first
    pub async fn operations_for_path(
        &self,
        path: &Path,
        status: OperationStatus,
    ) -> Result<Vec<Operation>> {
        let sql = format!(
            "SELECT {} FROM operations WHERE path = ? AND status = ? ORDER BY seq ASC",
            OPERATION_COLUMNS
        );
        self.fetch_operations(
            sqlx::query_as(&sql)
                .bind(path_key(path))
                .bind(status.to_i32()),
            "Failed to list operations for path",
        )
        .await
    }

    /// Number of operations with `status`
    pub async fn count_operations(&self, status: OperationStatus) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM operations WHERE status = ?")
            .bind(status.to_i32())
            .fetch_one(&self.pool)
            .await
            .map_err(query_error("Failed to count operations"))?;
        Ok(count)
    }

    async fn fetch_operations<'q>(
        &self,
        query: sqlx::query::QueryAs<
            'q,
            sqlx::Sqlite,
            OperationRow,
            sqlx::sqlite::SqliteArguments<'q>,
        >,
        context: &'static str,
    ) -> Result<Vec<Operation>> {
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(query_error(context))?;
        rows.into_iter().map(Operation::try_from).collect()
    }
}
