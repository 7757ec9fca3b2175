//! Point-in-time status snapshots and catalog queries

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::Ordering;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::Result;
use crate::parity::parser::last_progress;
use crate::process::{ProcessSample, progress_log_path, scan_par2_processes};
use crate::types::{
    ActiveOperation, CatalogStats, Health, ItemFilter, Operation, OperationId, OperationStatus,
    ProtectedItem, RunningProcess, StatusSnapshot,
};
use crate::utils;

use super::ProtectionManager;
use super::worker::join_error;

/// Bytes read from the end of a progress log
const PROGRESS_TAIL_BYTES: u64 = 4096;

impl ProtectionManager {
    /// Catalog entries matching `filter`, ordered by path
    pub async fn list(&self, filter: &ItemFilter) -> Result<Vec<ProtectedItem>> {
        self.db.list_items(filter).await
    }

    /// Aggregate catalog statistics
    pub async fn stats(&self) -> Result<CatalogStats> {
        self.db.catalog_stats().await
    }

    /// Queued, running and recently finished operations
    pub async fn active_operations(&self) -> Result<Vec<Operation>> {
        self.db
            .list_active_operations(self.config.queue.retention)
            .await
    }

    /// Build a status snapshot
    ///
    /// Running and queued operations are joined with the live PAR2 processes:
    /// first by the operation id the process carries, then by PID. A process
    /// that matches nothing is still listed with process fields only, and
    /// counted once in `correlation_failures`.
    pub async fn status(&self) -> Result<StatusSnapshot> {
        let stats = self.db.catalog_stats().await?;
        let health = Health::classify(&stats);

        let mut queued = self
            .db
            .list_operations_by_status(OperationStatus::Processing)
            .await?;
        queued.extend(
            self.db
                .list_operations_by_status(OperationStatus::Pending)
                .await?,
        );

        let db_path = self.config.persistence.database_path.clone();
        let (samples, system_resources) = tokio::task::spawn_blocking(move || {
            (scan_par2_processes(), utils::system_resources(&db_path))
        })
        .await
        .map_err(join_error)?;

        let local_pids: HashMap<OperationId, u32> = self
            .state
            .active
            .lock()
            .await
            .iter()
            .filter_map(|(id, run)| Some((id.clone(), run.pid()?)))
            .collect();

        let mut matched = HashSet::new();
        let mut active_operations = Vec::with_capacity(queued.len());
        for op in &queued {
            let sample = samples
                .iter()
                .find(|s| s.operation_id.as_ref() == Some(&op.id))
                .or_else(|| {
                    let pid = local_pids.get(&op.id).copied().or(op.pid)?;
                    samples
                        .iter()
                        .find(|s| s.pid == pid && s.operation_id.is_none())
                });
            let process = match sample {
                Some(sample) => {
                    matched.insert(sample.pid);
                    Some(self.running_process(sample, Some(&op.id)).await)
                }
                None => None,
            };
            active_operations.push(ActiveOperation {
                operation_id: Some(op.id.clone()),
                operation_type: Some(op.operation_type),
                path: op.params.path.clone(),
                status: Some(op.status),
                priority: Some(op.priority),
                started_at: op.started_at,
                created_at: Some(op.created_at),
                process,
            });
        }

        {
            let mut reported = self.state.uncorrelated_pids.lock().await;
            for sample in samples.iter().filter(|s| !matched.contains(&s.pid)) {
                if reported.insert(sample.pid) {
                    self.state
                        .correlation_failures
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        pid = sample.pid,
                        operation_id = ?sample.operation_id,
                        command = %sample.command_line(),
                        "par2 process does not match any queued operation"
                    );
                }
                let process = self
                    .running_process(sample, sample.operation_id.as_ref())
                    .await;
                active_operations.push(ActiveOperation {
                    operation_id: sample.operation_id.clone(),
                    operation_type: None,
                    path: None,
                    status: None,
                    priority: None,
                    started_at: None,
                    created_at: None,
                    process: Some(process),
                });
            }
            reported.retain(|pid| samples.iter().any(|s| s.pid == *pid));
        }

        let recent_activity = self
            .db
            .recent_operations(self.config.queue.recent_activity_limit)
            .await?;

        Ok(StatusSnapshot {
            stats,
            health,
            active_operations,
            recent_activity,
            system_resources,
            correlation_failures: self.state.correlation_failures.load(Ordering::Relaxed),
            taken_at: Utc::now(),
        })
    }

    async fn running_process(
        &self,
        sample: &ProcessSample,
        operation_id: Option<&OperationId>,
    ) -> RunningProcess {
        let progress = match operation_id {
            Some(id) => {
                read_progress(&progress_log_path(&self.config.tools.scratch_dir, id)).await
            }
            None => None,
        };
        RunningProcess {
            pid: sample.pid,
            operation_id: operation_id.cloned(),
            command_line: sample.command_line(),
            cpu_percent: sample.cpu_percent,
            memory_bytes: sample.memory_bytes,
            progress,
            elapsed_secs: sample.elapsed_secs,
        }
    }
}

/// Last progress percentage in the tail of a progress log
async fn read_progress(path: &Path) -> Option<f32> {
    let mut file = tokio::fs::File::open(path).await.ok()?;
    let len = file.metadata().await.ok()?.len();
    file.seek(std::io::SeekFrom::Start(len.saturating_sub(PROGRESS_TAIL_BYTES)))
        .await
        .ok()?;
    let mut tail = Vec::new();
    file.read_to_end(&mut tail).await.ok()?;
    last_progress(&String::from_utf8_lossy(&tail))
}
