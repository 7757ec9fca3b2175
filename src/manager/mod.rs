//! Protection/verification orchestrator split into focused submodules.
//!
//! The `ProtectionManager` struct and its methods are organized by domain:
//! - [`protect`] - Protect admission and parity creation
//! - [`verify`] - Verify/repair admission and execution
//! - [`remove`] - Parity removal and catalog cleanup
//! - [`cancel`] - Operation cancellation
//! - [`worker`] - Worker pool claiming operations from the queue
//! - [`recovery`] - Startup reconciliation of queue, catalog and process table
//! - [`lifecycle`] - Startup, shutdown and waiting on operations
//! - [`status`] - Point-in-time status snapshots

mod cancel;
mod lifecycle;
mod protect;
mod recovery;
mod remove;
mod status;
mod verify;
mod worker;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use tokio::sync::{Mutex, Notify, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::parity::{CliParityHandler, NoOpParityHandler, ParityCapabilities, ParityHandler};
use crate::process::ProcessRunner;
use crate::types::{Event, OperationId};

/// Bookkeeping for an operation a local worker is running
#[derive(Clone)]
pub(crate) struct ActiveRun {
    /// Cancels the run
    pub(crate) token: CancellationToken,
    /// PID of the subprocess, 0 until spawned
    pub(crate) pid: Arc<AtomicU32>,
    /// Target path
    pub(crate) path: Option<PathBuf>,
}

impl ActiveRun {
    pub(crate) fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }
}

/// Worker pool and admission state
#[derive(Clone)]
pub(crate) struct RuntimeState {
    /// Operations currently executing in this process
    pub(crate) active: Arc<Mutex<HashMap<OperationId, ActiveRun>>>,
    /// False once shutdown begins
    pub(crate) accepting_new: Arc<AtomicBool>,
    /// Wakes idle workers when work is admitted or a slot frees up
    pub(crate) wake: Arc<Notify>,
    /// Cancelled on shutdown; parent of every run's token
    pub(crate) shutdown: CancellationToken,
    /// Worker loops and adopted-process watchers
    pub(crate) tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    /// Live processes that could not be matched to an operation
    pub(crate) correlation_failures: Arc<AtomicU64>,
    /// PIDs already counted in `correlation_failures`
    pub(crate) uncorrelated_pids: Arc<Mutex<HashSet<u32>>>,
}

impl RuntimeState {
    fn new() -> Self {
        Self {
            active: Arc::new(Mutex::new(HashMap::new())),
            accepting_new: Arc::new(AtomicBool::new(true)),
            wake: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            tasks: Arc::new(Mutex::new(Vec::new())),
            correlation_failures: Arc::new(AtomicU64::new(0)),
            uncorrelated_pids: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

/// Main orchestrator instance (cloneable - all fields are Arc-wrapped)
///
/// Owns the worker pool that drains the operation queue, and exposes the
/// protect/verify/repair/remove/cancel/status operations to the embedding
/// application.
///
/// # Examples
///
/// ```no_run
/// use par2_protect::{Config, ProtectionManager};
/// use par2_protect::types::ProtectOptions;
/// use std::path::Path;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let manager = ProtectionManager::new(Config::default()).await?;
///
///     let admission = manager
///         .protect(Path::new("/mnt/user/photos"), ProtectOptions::default())
///         .await?;
///     println!("queued: {:?}", admission.queued);
///
///     manager.shutdown().await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct ProtectionManager {
    /// Database instance for persistence
    /// Public for integration tests to inspect the catalog and queue
    pub db: Arc<Database>,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: broadcast::Sender<Event>,
    /// Configuration
    pub(crate) config: Arc<Config>,
    /// PAR2 binding
    pub(crate) parity: Arc<dyn ParityHandler>,
    /// Terminates processes this manager did not spawn
    pub(crate) runner: ProcessRunner,
    /// Worker pool and admission state
    pub(crate) state: RuntimeState,
}

impl ProtectionManager {
    /// Create and start a manager using the par2 binary named by `config`
    ///
    /// Falls back to [`NoOpParityHandler`] when no binary can be found, so
    /// status and listing still work.
    pub async fn new(config: Config) -> Result<Self> {
        let parity: Arc<dyn ParityHandler> = match CliParityHandler::from_config(&config) {
            Some(handler) => Arc::new(handler),
            None => {
                tracing::warn!("no par2 binary available, protect/verify/repair will fail");
                Arc::new(NoOpParityHandler)
            }
        };
        Self::with_parity_handler(config, parity).await
    }

    /// Create and start a manager with an explicit parity handler
    ///
    /// Opens the database, reconciles state left by a previous run and spawns
    /// `max_concurrent_operations` workers.
    pub async fn with_parity_handler(
        config: Config,
        parity: Arc<dyn ParityHandler>,
    ) -> Result<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.tools.scratch_dir)
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create scratch directory '{}': {}",
                        config.tools.scratch_dir.display(),
                        e
                    ),
                ))
            })?;

        let db = Database::open(&config.persistence.database_path, config.retry.clone()).await?;

        // Buffer of 1000 events; slow subscribers see RecvError::Lagged
        let (event_tx, _rx) = broadcast::channel(1000);

        let caps = parity.capabilities();
        tracing::info!(
            parity_handler = parity.name(),
            can_create = caps.can_create,
            can_verify = caps.can_verify,
            can_repair = caps.can_repair,
            "Parity handler initialized"
        );

        let manager = Self {
            db: Arc::new(db),
            event_tx,
            config: Arc::new(config),
            parity,
            runner: ProcessRunner::default(),
            state: RuntimeState::new(),
        };

        manager.start().await?;
        Ok(manager)
    }

    /// Subscribe to lifecycle events
    ///
    /// Each subscriber receives every event independently.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Lifecycle events as a stream; lagged events are dropped
    pub fn event_stream(&self) -> impl futures::Stream<Item = Event> + Send + 'static {
        use futures::StreamExt;
        tokio_stream::wrappers::BroadcastStream::new(self.event_tx.subscribe())
            .filter_map(|event| async move { event.ok() })
    }

    /// Current configuration
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// What the parity handler can do
    pub fn capabilities(&self) -> ParityCapabilities {
        self.parity.capabilities()
    }

    /// Send an event; dropped when nobody listens
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    pub(crate) fn ensure_accepting(&self) -> Result<()> {
        if self.state.accepting_new.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::ShuttingDown)
        }
    }
}
