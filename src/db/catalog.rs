//! Protected item catalog: CRUD and aggregate statistics.
//!
//! The catalog never touches the filesystem. Callers delete parity artifacts
//! first and only then call [`Database::remove_item`].

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::Path;

use crate::Result;
use crate::types::{CatalogStats, ItemFilter, ItemStatus, ProtectedItem};

use super::{Database, ITEM_COLUMNS, ItemRow, from_timestamp, path_key, query_error};

impl Database {
    /// Insert or update the catalog entry for `item.path`
    ///
    /// Re-protecting a path updates the existing row; a path never has two entries.
    pub async fn upsert_item(&self, item: &ProtectedItem) -> Result<()> {
        self.retrying(move || self.upsert_item_once(item)).await
    }

    async fn upsert_item_once(&self, item: &ProtectedItem) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_error("Failed to begin item upsert"))?;

        sqlx::query(
            r#"
            INSERT INTO protected_items (
                path, mode, redundancy, size, file_count, parity_location,
                last_status, protected_date, last_verified, last_error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                mode = excluded.mode,
                redundancy = excluded.redundancy,
                size = excluded.size,
                file_count = excluded.file_count,
                parity_location = excluded.parity_location,
                last_status = excluded.last_status,
                protected_date = excluded.protected_date,
                last_verified = excluded.last_verified,
                last_error = excluded.last_error
            "#,
        )
        .bind(path_key(&item.path))
        .bind(item.mode.to_i32())
        .bind(i64::from(item.redundancy))
        .bind(i64::try_from(item.size).unwrap_or(i64::MAX))
        .bind(i64::try_from(item.file_count).unwrap_or(i64::MAX))
        .bind(path_key(&item.parity_location))
        .bind(item.last_status.to_i32())
        .bind(item.protected_date.timestamp())
        .bind(item.last_verified.map(|t| t.timestamp()))
        .bind(&item.last_error)
        .execute(&mut *tx)
        .await
        .map_err(query_error("Failed to upsert protected item"))?;

        tx.commit()
            .await
            .map_err(query_error("Failed to commit item upsert"))?;
        Ok(())
    }

    /// Get the catalog entry for `path`
    pub async fn get_item(&self, path: &Path) -> Result<Option<ProtectedItem>> {
        let sql = format!("SELECT {} FROM protected_items WHERE path = ?", ITEM_COLUMNS);
        let row = sqlx::query_as::<_, ItemRow>(&sql)
            .bind(path_key(path))
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("Failed to get protected item"))?;

        Ok(row.map(ProtectedItem::from))
    }

    /// Delete the catalog entry for `path`
    ///
    /// Returns whether a row was deleted. Parity artifacts must already be gone.
    pub async fn remove_item(&self, path: &Path) -> Result<bool> {
        let key = path_key(path);
        let key = key.as_str();
        let deleted = self
            .retrying(move || async move {
                let mut tx = self
                    .pool
                    .begin()
                    .await
                    .map_err(query_error("Failed to begin item removal"))?;
                let result = sqlx::query("DELETE FROM protected_items WHERE path = ?")
                    .bind(key)
                    .execute(&mut *tx)
                    .await
                    .map_err(query_error("Failed to remove protected item"))?;
                tx.commit()
                    .await
                    .map_err(query_error("Failed to commit item removal"))?;
                Ok(result.rows_affected() > 0)
            })
            .await?;

        if deleted {
            tracing::debug!(path = %path.display(), "catalog entry removed");
        }
        Ok(deleted)
    }

    /// List catalog entries matching `filter`, ordered by path
    pub async fn list_items(&self, filter: &ItemFilter) -> Result<Vec<ProtectedItem>> {
        let mut builder = sqlx::QueryBuilder::new(format!(
            "SELECT {} FROM protected_items WHERE 1 = 1",
            ITEM_COLUMNS
        ));

        if let Some(status) = filter.status {
            builder.push(" AND last_status = ").push_bind(status.to_i32());
        }
        if let Some(mode) = filter.mode {
            builder.push(" AND mode = ").push_bind(mode.to_i32());
        }
        if let Some(prefix) = &filter.path_prefix {
            let prefix = path_key(prefix);
            let trimmed = prefix.trim_end_matches('/');
            builder
                .push(" AND (path = ")
                .push_bind(trimmed.to_string())
                .push(" OR path LIKE ")
                .push_bind(format!("{}/%", escape_like(trimmed)))
                .push(" ESCAPE '\\')");
        }
        builder.push(" ORDER BY path");

        let rows = builder
            .build_query_as::<ItemRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(query_error("Failed to list protected items"))?;

        Ok(rows.into_iter().map(ProtectedItem::from).collect())
    }

    /// Record the outcome of a verify or repair for `path`
    ///
    /// `verified_at` updates `last_verified` when given; `error` replaces
    /// `last_error`. Returns the previous status, or `None` when the path has
    /// no catalog entry.
    pub async fn update_item_status(
        &self,
        path: &Path,
        status: ItemStatus,
        verified_at: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> Result<Option<ItemStatus>> {
        let key = path_key(path);
        let key = key.as_str();
        self.retrying(move || async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(query_error("Failed to begin status update"))?;

            let previous: Option<i32> =
                sqlx::query_scalar("SELECT last_status FROM protected_items WHERE path = ?")
                    .bind(key)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(query_error("Failed to read item status"))?;

            let Some(previous) = previous else {
                tx.rollback()
                    .await
                    .map_err(query_error("Failed to roll back status update"))?;
                return Ok(None);
            };

            sqlx::query(
                r#"
                UPDATE protected_items
                SET last_status = ?,
                    last_verified = COALESCE(?, last_verified),
                    last_error = ?
                WHERE path = ?
                "#,
            )
            .bind(status.to_i32())
            .bind(verified_at.map(|t| t.timestamp()))
            .bind(error)
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(query_error("Failed to update item status"))?;

            tx.commit()
                .await
                .map_err(query_error("Failed to commit status update"))?;
            Ok(Some(ItemStatus::from_i32(previous)))
        })
        .await
    }

    /// Number of catalog entries other than `path` that keep parity in `parity_location`
    pub async fn items_sharing_parity(&self, parity_location: &Path, path: &Path) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM protected_items WHERE parity_location = ? AND path != ?",
        )
        .bind(path_key(parity_location))
        .bind(path_key(path))
        .fetch_one(&self.pool)
        .await
        .map_err(query_error("Failed to count items sharing parity"))?;

        Ok(count)
    }

    /// Other catalog entries whose parity lives in `parity_location`, ordered by path
    pub async fn items_at_parity_location(
        &self,
        parity_location: &Path,
        excluding: &Path,
    ) -> Result<Vec<ProtectedItem>> {
        let sql = format!(
            "SELECT {} FROM protected_items WHERE parity_location = ? AND path != ? ORDER BY path",
            ITEM_COLUMNS
        );
        let rows = sqlx::query_as::<_, ItemRow>(&sql)
            .bind(path_key(parity_location))
            .bind(path_key(excluding))
            .fetch_all(&self.pool)
            .await
            .map_err(query_error("Failed to list items sharing parity"))?;

        Ok(rows.into_iter().map(ProtectedItem::from).collect())
    }

    /// Aggregate statistics over the whole catalog
    ///
    /// Both queries run in one read transaction so counts and totals agree.
    pub async fn catalog_stats(&self) -> Result<CatalogStats> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_error("Failed to begin stats read"))?;

        let (total_items, total_files, total_size, last_verified): (i64, i64, i64, Option<i64>) =
            sqlx::query_as(
                r#"
                SELECT COUNT(*), COALESCE(SUM(file_count), 0), COALESCE(SUM(size), 0),
                       MAX(last_verified)
                FROM protected_items
                "#,
            )
            .fetch_one(&mut *tx)
            .await
            .map_err(query_error("Failed to aggregate catalog"))?;

        let by_status: Vec<(i32, i64)> = sqlx::query_as(
            "SELECT last_status, COUNT(*) FROM protected_items GROUP BY last_status",
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(query_error("Failed to count items by status"))?;

        tx.commit()
            .await
            .map_err(query_error("Failed to finish stats read"))?;

        let mut counts_by_status = BTreeMap::new();
        for (status, count) in by_status {
            *counts_by_status
                .entry(ItemStatus::from_i32(status).as_str().to_string())
                .or_insert(0) += count.max(0) as u64;
        }

        Ok(CatalogStats {
            total_items: total_items.max(0) as u64,
            total_files: total_files.max(0) as u64,
            total_size: total_size.max(0) as u64,
            last_verification: last_verified.map(from_timestamp),
            counts_by_status,
        })
    }
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
