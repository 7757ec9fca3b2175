//! Startup, shutdown and waiting on operations.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;

use crate::error::{Error, Result};
use crate::types::{Event, Operation, OperationId};

use super::ProtectionManager;

/// Upper bound on waiting for workers to unwind during shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

impl ProtectionManager {
    /// Reconcile leftover state, mark the session started and spawn the workers
    pub(crate) async fn start(&self) -> Result<()> {
        if self.db.was_unclean_shutdown().await? {
            tracing::warn!("previous session did not shut down cleanly, reconciling");
        }

        let report = self.reconcile().await?;
        if !report.orphaned.is_empty() {
            tracing::warn!(
                count = report.orphaned.len(),
                "failed operations orphaned by restart"
            );
        }

        self.db.set_clean_start().await?;

        let workers = self.spawn_workers();
        let count = workers.len();
        self.state.tasks.lock().await.extend(workers);
        tracing::info!(workers = count, "protection manager started");
        Ok(())
    }

    /// Gracefully shut down the manager
    ///
    /// This method performs a graceful shutdown sequence:
    /// 1. Stops accepting new requests
    /// 2. Cancels running operations (their subprocesses get SIGTERM, then SIGKILL)
    /// 3. Waits for workers to unwind with a timeout (30 seconds)
    /// 4. Marks the shutdown clean in the database
    /// 5. Emits [`Event::Shutdown`]
    ///
    /// PENDING operations stay queued and run after the next start.
    ///
    /// # Errors
    ///
    /// Returns an error only when the clean-shutdown marker cannot be written.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");

        self.state.accepting_new.store(false, Ordering::SeqCst);
        self.state.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.state.tasks.lock().await);
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, futures::future::join_all(tasks)).await {
            Ok(results) => {
                let panicked = results.iter().filter(|r| r.is_err()).count();
                if panicked > 0 {
                    tracing::error!(panicked, "worker tasks panicked before shutdown");
                } else {
                    tracing::info!("All workers stopped");
                }
            }
            Err(_) => {
                tracing::warn!("Timeout waiting for workers to stop, proceeding with shutdown");
            }
        }

        self.db.set_clean_shutdown().await?;
        self.emit_event(Event::Shutdown);
        tracing::info!("Shutdown complete");
        Ok(())
    }

    /// Whether the manager still accepts requests
    pub fn is_accepting(&self) -> bool {
        self.state.accepting_new.load(Ordering::SeqCst)
    }

    /// Look up an operation by id
    pub async fn operation(&self, operation_id: &str) -> Result<Operation> {
        let id = OperationId::parse(operation_id)?;
        self.db
            .get_operation(&id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("operation {}", id)))
    }

    /// Operation history, newest first
    pub async fn history(&self, limit: u32) -> Result<Vec<Operation>> {
        self.db.operation_history(limit, 0).await
    }

    /// Wait until every listed operation is terminal
    ///
    /// Wakes on terminal events and re-reads the queue at least every
    /// `poll_interval`, so events dropped by a lagging receiver only delay the
    /// return. Operations come back in the order of `ids`.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown id, [`Error::Other`] when `timeout`
    /// elapses first.
    pub async fn wait_for_operations(
        &self,
        ids: &[OperationId],
        timeout: Duration,
    ) -> Result<Vec<Operation>> {
        let mut events = self.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        let poll_interval = self.config.queue.poll_interval;

        loop {
            let mut operations = Vec::with_capacity(ids.len());
            for id in ids {
                let op = self
                    .db
                    .get_operation(id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("operation {}", id)))?;
                operations.push(op);
            }
            let unfinished = operations
                .iter()
                .filter(|op| !op.status.is_terminal())
                .count();
            if unfinished == 0 {
                return Ok(operations);
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(Error::Other(format!(
                    "timed out after {}s waiting for {} of {} operations",
                    timeout.as_secs(),
                    unfinished,
                    ids.len()
                )));
            }

            let terminal_event = async {
                loop {
                    match events.recv().await {
                        Ok(event) if event.is_terminal() => break,
                        Ok(_) => continue,
                        Err(RecvError::Lagged(_)) | Err(RecvError::Closed) => break,
                    }
                }
            };
            tokio::select! {
                _ = terminal_event => {}
                _ = tokio::time::sleep(remaining.min(poll_interval)) => {}
            }
        }
    }
}
