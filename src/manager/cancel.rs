//! Operation cancellation

use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::process::{cleanup_scratch, is_alive, scan_par2_processes};
use crate::types::{CancelOutcome, Event, OperationId, OperationResult};

use super::ProtectionManager;
use super::worker::join_error;

/// Upper bound on waiting for a local run to unwind after its token fires
const LOCAL_UNWIND_TIMEOUT: Duration = Duration::from_secs(10);

impl ProtectionManager {
    /// Cancel an operation and terminate its PAR2 processes
    ///
    /// Processes are located through the process table (environment tag or
    /// command-line token), the running worker, and the recorded PID when that
    /// PID still names a PAR2 process. Cancelling an operation that is already
    /// terminal is not an error; nothing is killed and its status is returned.
    ///
    /// # Errors
    ///
    /// A malformed id is a validation error and touches no process. Unknown
    /// ids return [`Error::NotFound`].
    pub async fn cancel(&self, operation_id: &str) -> Result<CancelOutcome> {
        let id = OperationId::parse(operation_id)?;
        let op = self
            .db
            .get_operation(&id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("operation {}", id)))?;

        if op.status.is_terminal() {
            let scratch_files_removed = cleanup_scratch(&self.config.tools.scratch_dir, &id).await;
            tracing::debug!(operation_id = %id, status = ?op.status, "cancel requested for finished operation");
            return Ok(CancelOutcome {
                operation_id: id,
                killed_processes: 0,
                status: op.status,
                scratch_files_removed,
            });
        }

        let samples = tokio::task::spawn_blocking(scan_par2_processes)
            .await
            .map_err(join_error)?;
        let local = self.state.active.lock().await.get(&id).cloned();

        let mut pids: BTreeSet<u32> = samples
            .iter()
            .filter(|s| s.operation_id.as_ref() == Some(&id))
            .map(|s| s.pid)
            .collect();
        if let Some(pid) = local.as_ref().and_then(|run| run.pid()) {
            pids.insert(pid);
        }
        // A stored pid may have been reused; only trust it while it is still par2
        if let Some(pid) = op.pid
            && samples.iter().any(|s| s.pid == pid)
        {
            pids.insert(pid);
        }
        let alive_before: Vec<u32> = pids.into_iter().filter(|pid| is_alive(*pid)).collect();

        if let Some(run) = &local {
            run.token.cancel();
            self.wait_until_inactive(&id, LOCAL_UNWIND_TIMEOUT).await;
        }

        for pid in &alive_before {
            if is_alive(*pid) {
                self.runner.cancel(*pid).await;
            }
        }
        let killed_processes = alive_before.iter().filter(|pid| !is_alive(**pid)).count() as u32;

        let scratch_files_removed = cleanup_scratch(&self.config.tools.scratch_dir, &id).await;

        let current = self.db.get_operation(&id).await?;
        if current.as_ref().is_some_and(|op| !op.status.is_terminal()) {
            let written = self
                .db
                .cancel_operation(&id, &OperationResult::message("cancelled by request"))
                .await?;
            if written {
                self.emit_event(Event::OperationCancelled {
                    id: id.clone(),
                    killed_processes,
                });
            }
            // A worker may have claimed it in the meantime
            if let Some(run) = self.state.active.lock().await.get(&id) {
                run.token.cancel();
            }
        }

        let status = self
            .db
            .get_operation(&id)
            .await?
            .map(|op| op.status)
            .ok_or_else(|| Error::NotFound(format!("operation {}", id)))?;

        tracing::info!(
            operation_id = %id,
            killed_processes,
            scratch_files_removed,
            status = ?status,
            "cancel finished"
        );
        Ok(CancelOutcome {
            operation_id: id,
            killed_processes,
            status,
            scratch_files_removed,
        })
    }

    async fn wait_until_inactive(&self, id: &OperationId, limit: Duration) {
        let waited = tokio::time::timeout(limit, async {
            while self.state.active.lock().await.contains_key(id) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if waited.is_err() {
            tracing::warn!(operation_id = %id, "run did not unwind after cancellation");
        }
    }
}
