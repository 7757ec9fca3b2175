//! Runtime state tracking: shutdown detection and reconciliation bookkeeping.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::Database;

const CLEAN_SHUTDOWN_KEY: &str = "clean_shutdown";

impl Database {
    /// Check if the last shutdown was unclean
    ///
    /// Returns true if the previous session did not call set_clean_shutdown(),
    /// indicating a crash or forced termination. Called on startup, before
    /// crash recovery, so the log says why orphans may follow.
    pub async fn was_unclean_shutdown(&self) -> Result<bool> {
        let value = self.get_runtime_state(CLEAN_SHUTDOWN_KEY).await?;

        // Missing or "false" means the previous session never finished shutdown()
        Ok(value.is_none_or(|v| v != "true"))
    }

    /// Mark that the orchestrator has started
    ///
    /// If shutdown() is not called before the next startup,
    /// was_unclean_shutdown() will return true.
    pub async fn set_clean_start(&self) -> Result<()> {
        self.set_runtime_state(CLEAN_SHUTDOWN_KEY, "false").await
    }

    /// Mark that the orchestrator is shutting down cleanly
    pub async fn set_clean_shutdown(&self) -> Result<()> {
        self.set_runtime_state(CLEAN_SHUTDOWN_KEY, "true").await
    }

    /// Read a runtime state value
    pub async fn get_runtime_state(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT value FROM runtime_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to read runtime state {}: {}",
                    key, e
                )))
            })
    }

    /// Write a runtime state value
    pub async fn set_runtime_state(&self, key: &str, value: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO runtime_state (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to set runtime state {}: {}",
                key, e
            )))
        })?;

        Ok(())
    }
}
