//! Parity removal and catalog cleanup

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::parity::check_parity_location;
use crate::parity::layout::{remove_layout_artifacts, remove_parity_dir};
use crate::types::{
    Event, OperationParams, OperationResult, OperationStatus, OperationType, Priority,
    RemoveFailure, RemoveReport,
};

use super::ProtectionManager;
use super::protect::normalize_target;
use super::verify::item_layout;
use super::worker::{Disposition, join_error};

impl ProtectionManager {
    /// Remove protection from each path: delete parity, then the catalog entry
    ///
    /// Paths are processed independently. A failure on one path is reported
    /// in [`RemoveReport::failures`] and the rest still run. The batch is
    /// recorded as one REMOVE operation, COMPLETED when at least one path was
    /// removed and FAILED otherwise.
    ///
    /// Parity is deleted only from locations ending in `/.parity`; a catalog
    /// entry pointing anywhere else fails closed without touching the disk.
    pub async fn remove(&self, paths: &[PathBuf]) -> Result<RemoveReport> {
        self.ensure_accepting()?;
        if paths.is_empty() {
            return Err(Error::validation("paths", "no paths to remove"));
        }

        let params = OperationParams {
            targets: paths.to_vec(),
            ..Default::default()
        };
        let op = self
            .db
            .enqueue_operation(OperationType::Remove, &params, Priority::Normal)
            .await?;
        tracing::info!(operation_id = %op.id, paths = paths.len(), "removing protection");

        let mut report = RemoveReport {
            operation_id: Some(op.id.clone()),
            ..Default::default()
        };
        for raw in paths {
            match self.remove_one(raw).await {
                Ok(path) => report.removed.push(path),
                Err(e) => {
                    tracing::warn!(path = %raw.display(), error = %e, "failed to remove protection");
                    report.failures.push(RemoveFailure {
                        path: raw.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let disposition = if report.removed.is_empty() {
            Disposition::Failed(OperationResult {
                error: Some(format!("failed to remove {} paths", report.failures.len())),
                failures: report.failures.clone(),
                ..Default::default()
            })
        } else {
            Disposition::Completed(OperationResult {
                message: Some(format!(
                    "removed {} of {} paths",
                    report.removed.len(),
                    paths.len()
                )),
                removed: report.removed.clone(),
                failures: report.failures.clone(),
                ..Default::default()
            })
        };
        self.record_disposition(&op.id, disposition).await;

        Ok(report)
    }

    async fn remove_one(&self, raw: &Path) -> Result<PathBuf> {
        let path = normalize_target(raw)?;
        let item = self
            .db
            .get_item(&path)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} is not protected", path.display())))?;

        let running = self
            .db
            .operations_for_path(&path, OperationStatus::Processing)
            .await?;
        if let Some(op) = running.first() {
            return Err(Error::Resource(format!(
                "{} has a running {} operation ({}); cancel it first",
                path.display(),
                op.operation_type,
                op.id
            )));
        }

        check_parity_location(&item.parity_location)?;

        for op in self
            .db
            .operations_for_path(&path, OperationStatus::Pending)
            .await?
        {
            self.record_disposition(
                &op.id,
                Disposition::Cancelled {
                    reason: "cancelled: path removed from protection".to_string(),
                    killed_processes: 0,
                },
            )
            .await;
        }

        let shared = self
            .db
            .items_sharing_parity(&item.parity_location, &path)
            .await?
            > 0;
        let layout = item_layout(&item)?;
        // A parity set addressed by another entry stays on disk for that entry
        let owner = if shared {
            self.parity_set_owner(&layout).await?
        } else {
            None
        };
        let deleted = match &owner {
            Some(owner) => {
                tracing::warn!(
                    path = %path.display(),
                    owner = %owner.display(),
                    "parity set belongs to another entry, leaving it in place"
                );
                0
            }
            None => {
                let parity_location = item.parity_location.clone();
                tokio::task::spawn_blocking(move || -> Result<usize> {
                    if shared {
                        remove_layout_artifacts(&layout)
                    } else {
                        remove_parity_dir(&parity_location)
                    }
                })
                .await
                .map_err(join_error)??
            }
        };

        self.db.remove_item(&path).await?;
        tracing::info!(
            path = %path.display(),
            parity_location = %item.parity_location.display(),
            files_deleted = deleted,
            shared_parity_dir = shared,
            "protection removed"
        );
        self.emit_event(Event::ItemRemoved { path: path.clone() });
        Ok(path)
    }
}
