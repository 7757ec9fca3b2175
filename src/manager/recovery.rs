//! Reconciliation of the queue, the catalog and the process table
//!
//! Runs once at startup and can be re-run through [`ProtectionManager::reconcile`].

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;

use tokio_util::sync::CancellationToken;

use crate::error::{ConsistencyError, Result};
use crate::process::{cleanup_scratch, is_alive, scan_par2_processes};
use crate::types::{
    ItemFilter, ItemStatus, OperationId, OperationResult, OperationStatus, OperationType,
    RecoveryReport,
};

use super::worker::{Disposition, join_error};
use super::{ActiveRun, ProtectionManager};

impl ProtectionManager {
    /// Bring persisted state back in line with what is actually running
    ///
    /// - PROCESSING operations not run by this manager are adopted when their
    ///   PAR2 process is still alive, and failed as orphaned otherwise.
    /// - REMOVE batches left PENDING by an interrupted session are failed.
    /// - Items whose path vanished become MISSING; items whose parity
    ///   directory vanished become ERROR.
    pub async fn reconcile(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let local: HashSet<OperationId> = self.state.active.lock().await.keys().cloned().collect();
        let stranded: Vec<_> = self
            .db
            .list_operations_by_status(OperationStatus::Processing)
            .await?
            .into_iter()
            .filter(|op| !local.contains(&op.id))
            .collect();

        if !stranded.is_empty() {
            let samples = tokio::task::spawn_blocking(scan_par2_processes)
                .await
                .map_err(join_error)?;

            for op in stranded {
                let survivor = samples
                    .iter()
                    .find(|s| s.operation_id.as_ref() == Some(&op.id))
                    .or_else(|| {
                        let pid = op.pid?;
                        samples
                            .iter()
                            .find(|s| s.pid == pid && s.operation_id.is_none())
                    });

                match survivor {
                    Some(sample) => {
                        tracing::warn!(
                            operation_id = %op.id,
                            pid = sample.pid,
                            "par2 process outlived the previous session, watching it"
                        );
                        self.adopt(op.id.clone(), sample.pid, op.params.path.clone())
                            .await;
                        report.adopted.push(op.id);
                    }
                    None => {
                        let orphaned = ConsistencyError::OrphanedOperation {
                            id: op.id.to_string(),
                        };
                        tracing::warn!(operation_id = %op.id, error = %orphaned, "failing orphaned operation");
                        self.record_disposition(
                            &op.id,
                            Disposition::Failed(OperationResult::error(orphaned.to_string())),
                        )
                        .await;
                        cleanup_scratch(&self.config.tools.scratch_dir, &op.id).await;
                        report.orphaned.push(op.id);
                    }
                }
            }
        }

        for op in self
            .db
            .list_operations_by_status(OperationStatus::Pending)
            .await?
            .into_iter()
            .filter(|op| op.operation_type == OperationType::Remove)
        {
            self.record_disposition(
                &op.id,
                Disposition::Failed(OperationResult::error("remove interrupted by restart")),
            )
            .await;
        }

        let items = self.db.list_items(&ItemFilter::default()).await?;
        let checked = tokio::task::spawn_blocking(move || {
            items
                .into_iter()
                .map(|item| {
                    let path_exists = std::fs::symlink_metadata(&item.path).is_ok();
                    let parity_exists = item.parity_location.is_dir();
                    (item, path_exists, parity_exists)
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(join_error)?;

        for (item, path_exists, parity_exists) in checked {
            if !path_exists {
                if item.last_status != ItemStatus::Missing {
                    self.set_item_status(
                        &item,
                        ItemStatus::Missing,
                        None,
                        Some("path no longer exists"),
                    )
                    .await?;
                    report.missing_paths.push(item.path);
                }
            } else if !parity_exists && item.last_status != ItemStatus::Error {
                let missing = ConsistencyError::ParityDirectoryMissing {
                    path: item.path.clone(),
                    parity_location: item.parity_location.clone(),
                };
                tracing::warn!(error = %missing, "catalog entry lost its parity directory");
                self.set_item_status(&item, ItemStatus::Error, None, Some(&missing.to_string()))
                    .await?;
                report.missing_parity.push(item.path);
            }
        }

        if report != RecoveryReport::default() {
            tracing::info!(
                orphaned = report.orphaned.len(),
                adopted = report.adopted.len(),
                missing_paths = report.missing_paths.len(),
                missing_parity = report.missing_parity.len(),
                "reconciliation changed state"
            );
        }
        Ok(report)
    }

    /// Track a surviving process until it exits or is cancelled
    async fn adopt(&self, id: OperationId, pid: u32, path: Option<PathBuf>) {
        let token = self.state.shutdown.child_token();
        self.state.active.lock().await.insert(
            id.clone(),
            ActiveRun {
                token: token.clone(),
                pid: Arc::new(AtomicU32::new(pid)),
                path,
            },
        );

        let manager = self.clone();
        let handle = tokio::spawn(async move { manager.watch_adopted(id, pid, token).await });
        self.state.tasks.lock().await.push(handle);
    }

    async fn watch_adopted(self, id: OperationId, pid: u32, token: CancellationToken) {
        let poll_interval = self.config.queue.poll_interval;
        let disposition = loop {
            if !is_alive(pid) {
                break Some(Disposition::Failed(OperationResult::error(format!(
                    "par2 process {} exited while unobserved; outcome unknown",
                    pid
                ))));
            }
            tokio::select! {
                _ = token.cancelled() => {
                    // On shutdown the process is left alone and re-adopted next start
                    if self.state.shutdown.is_cancelled() {
                        break None;
                    }
                    self.runner.cancel(pid).await;
                    break Some(Disposition::Cancelled {
                        reason: "cancelled by request".to_string(),
                        killed_processes: u32::from(!is_alive(pid)),
                    });
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        };

        if let Some(disposition) = disposition {
            if !self.settle(&id, disposition).await {
                tracing::warn!(operation_id = %id, "adopted outcome not recorded before shutdown");
            }
            cleanup_scratch(&self.config.tools.scratch_dir, &id).await;
        }
        self.state.active.lock().await.remove(&id);
        self.state.wake.notify_waiters();
    }
}
