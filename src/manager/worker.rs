//! Worker pool: claim operations from the queue and run them to a terminal state

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, ExecutionError, Result};
use crate::parity::ExecutionContext;
use crate::process::{SpawnHook, cleanup_scratch, progress_log_path};
use crate::types::{Event, Operation, OperationId, OperationResult, OperationType};

use super::{ActiveRun, ProtectionManager};

/// How an executed operation ended, before it is written to the queue
#[derive(Clone, Debug)]
pub(crate) enum Disposition {
    Completed(OperationResult),
    Failed(OperationResult),
    Skipped(String),
    Cancelled {
        reason: String,
        killed_processes: u32,
    },
}

impl ProtectionManager {
    /// Spawn one worker loop per concurrency slot
    pub(crate) fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        (0..self.config.queue.max_concurrent_operations)
            .map(|worker| {
                let manager = self.clone();
                tokio::spawn(async move { manager.worker_loop(worker).await })
            })
            .collect()
    }

    async fn worker_loop(self, worker: usize) {
        let ceiling = self.config.queue.max_concurrent_operations;
        let poll_interval = self.config.queue.poll_interval;
        let mut backoff = self.config.retry.initial_delay;

        tracing::debug!(worker, "worker started");
        loop {
            if self.state.shutdown.is_cancelled() {
                break;
            }

            match self.db.claim_next_operation(ceiling).await {
                Ok(Some(operation)) => {
                    backoff = self.config.retry.initial_delay;
                    self.run_operation(operation).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = self.state.shutdown.cancelled() => break,
                        _ = self.state.wake.notified() => {}
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }
                Err(e) => {
                    // Storage unavailable: this iteration fails, the worker survives
                    tracing::error!(
                        worker,
                        error = %e,
                        retry_in_ms = backoff.as_millis(),
                        "failed to claim next operation"
                    );
                    tokio::select! {
                        _ = self.state.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = crate::retry::next_delay(backoff, &self.config.retry);
                }
            }
        }
        tracing::debug!(worker, "worker stopped");
    }

    /// Execute a claimed operation and record its terminal state
    async fn run_operation(&self, operation: Operation) {
        let id = operation.id.clone();
        let token = self.state.shutdown.child_token();
        let pid = Arc::new(AtomicU32::new(0));

        self.state.active.lock().await.insert(
            id.clone(),
            ActiveRun {
                token: token.clone(),
                pid: Arc::clone(&pid),
                path: operation.params.path.clone(),
            },
        );

        tracing::info!(
            operation_id = %id,
            operation_type = %operation.operation_type,
            path = ?operation.params.path,
            priority = ?operation.priority,
            "operation started"
        );
        self.emit_event(Event::OperationStarted {
            id: id.clone(),
            operation_type: operation.operation_type,
        });

        let ctx = self.execution_context(&id, token.clone(), Arc::clone(&pid));
        let outcome = match operation.operation_type {
            OperationType::Protect => self.execute_protect(&operation, ctx).await,
            OperationType::Verify => self.execute_verify(&operation, ctx).await,
            OperationType::Repair => self.execute_repair(&operation, ctx).await,
            OperationType::Remove => Err(Error::Other(
                "remove operations are recorded, not executed by workers".to_string(),
            )),
        };

        let spawned = u32::from(pid.load(Ordering::SeqCst) != 0);
        let disposition = match outcome {
            Ok(disposition) => disposition,
            Err(Error::Execution(ExecutionError::Cancelled)) => Disposition::Cancelled {
                reason: self.cancel_reason(),
                killed_processes: spawned,
            },
            Err(_) if token.is_cancelled() => Disposition::Cancelled {
                reason: self.cancel_reason(),
                killed_processes: spawned,
            },
            Err(e) => Disposition::Failed(failure_result(&e)),
        };

        // Terminal state is written before the run leaves the active map
        if !self.settle(&id, disposition).await {
            tracing::warn!(
                operation_id = %id,
                "outcome not recorded before shutdown, startup reconciliation will finish it"
            );
        }
        self.state.active.lock().await.remove(&id);
        cleanup_scratch(&self.config.tools.scratch_dir, &id).await;
        self.state.wake.notify_waiters();
    }

    fn cancel_reason(&self) -> String {
        if self.state.shutdown.is_cancelled() {
            "cancelled by shutdown".to_string()
        } else {
            "cancelled by request".to_string()
        }
    }

    fn execution_context(
        &self,
        id: &OperationId,
        token: CancellationToken,
        pid: Arc<AtomicU32>,
    ) -> ExecutionContext {
        let db = Arc::clone(&self.db);
        let hook_id = id.clone();
        let on_spawn: SpawnHook = Box::new(move |spawned| {
            pid.store(spawned, Ordering::SeqCst);
            tokio::spawn(async move {
                if let Err(e) = db.set_operation_pid(&hook_id, Some(spawned)).await {
                    tracing::warn!(operation_id = %hook_id, pid = spawned, error = %e, "failed to record pid");
                }
            });
        });

        ExecutionContext {
            operation_id: id.clone(),
            cancel: token,
            timeout: self.config.tools.max_execution_time,
            progress_log: Some(progress_log_path(&self.config.tools.scratch_dir, id)),
            on_spawn: Some(on_spawn),
        }
    }

    /// Record a worker's outcome, retrying with backoff until it is stored
    ///
    /// The run keeps its slot in the active map meanwhile, so it stays
    /// cancellable and visible. Gives up only at shutdown and returns false.
    pub(crate) async fn settle(&self, id: &OperationId, disposition: Disposition) -> bool {
        let mut delay = self.config.retry.initial_delay;
        loop {
            if self.record_disposition(id, disposition.clone()).await {
                return true;
            }
            tokio::select! {
                _ = self.state.shutdown.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = crate::retry::next_delay(delay, &self.config.retry);
        }
    }

    /// Write a terminal state and emit its event if this call made the transition
    ///
    /// Returns false when the write failed and the row is still non-terminal.
    pub(crate) async fn record_disposition(&self, id: &OperationId, disposition: Disposition) -> bool {
        let (written, event) = match disposition {
            Disposition::Completed(result) => {
                tracing::info!(operation_id = %id, "operation completed");
                (
                    self.db.complete_operation(id, &result).await,
                    Event::OperationCompleted {
                        id: id.clone(),
                        result,
                    },
                )
            }
            Disposition::Failed(result) => {
                let error = result
                    .error
                    .clone()
                    .unwrap_or_else(|| "operation failed".to_string());
                tracing::warn!(operation_id = %id, error = %error, "operation failed");
                (
                    self.db.fail_operation(id, &result).await,
                    Event::OperationFailed {
                        id: id.clone(),
                        error,
                    },
                )
            }
            Disposition::Skipped(reason) => {
                tracing::info!(operation_id = %id, reason = %reason, "operation skipped");
                (
                    self.db.skip_operation(id, &reason).await,
                    Event::OperationSkipped {
                        id: id.clone(),
                        reason,
                    },
                )
            }
            Disposition::Cancelled {
                reason,
                killed_processes,
            } => {
                tracing::info!(operation_id = %id, reason = %reason, "operation cancelled");
                (
                    self.db
                        .cancel_operation(id, &OperationResult::message(reason))
                        .await,
                    Event::OperationCancelled {
                        id: id.clone(),
                        killed_processes,
                    },
                )
            }
        };

        match written {
            Ok(true) => {
                self.emit_event(event);
                true
            }
            Ok(false) => true,
            Err(e) => {
                tracing::error!(operation_id = %id, error = %e, "failed to record operation outcome");
                false
            }
        }
    }
}

/// Operation result for an execution error; stderr and exit code are kept verbatim
pub(crate) fn failure_result(error: &Error) -> OperationResult {
    match error {
        Error::Execution(ExecutionError::NonZeroExit { exit_code, stderr }) => OperationResult {
            error: Some(if stderr.trim().is_empty() {
                error.to_string()
            } else {
                stderr.clone()
            }),
            exit_code: *exit_code,
            ..Default::default()
        },
        Error::Execution(ExecutionError::TimedOut { after_secs }) => OperationResult {
            error: Some(format!(
                "timed out: exceeded maximum execution time of {}s",
                after_secs
            )),
            ..Default::default()
        },
        other => OperationResult::error(other.to_string()),
    }
}

/// Target path of a single-path operation
pub(crate) fn operation_path(operation: &Operation) -> Result<PathBuf> {
    operation.params.path.clone().ok_or_else(|| {
        Error::validation(
            "path",
            format!("{} operation {} has no path", operation.operation_type, operation.id),
        )
    })
}

/// Convert a blocking task panic into an error
pub(crate) fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Other(format!("blocking task failed: {}", e))
}
