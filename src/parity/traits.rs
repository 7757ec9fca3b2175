//! Traits and types for PAR2 parity handling

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::layout::ParityLayout;
use super::parser::Par2Exit;
use crate::process::SpawnHook;
use crate::types::{ItemStatus, OperationId, VerifyCounts};

/// Per-run execution context handed to a [`ParityHandler`]
pub struct ExecutionContext {
    /// Operation the run belongs to
    pub operation_id: OperationId,
    /// Cooperative cancellation
    pub cancel: CancellationToken,
    /// Maximum execution time
    pub timeout: Option<Duration>,
    /// Where to tee progress output while the run is live
    pub progress_log: Option<PathBuf>,
    /// Called with the subprocess PID once it starts
    pub on_spawn: Option<SpawnHook>,
}

impl ExecutionContext {
    /// Context with a fresh token, no time limit and no progress log
    pub fn new(operation_id: OperationId) -> Self {
        Self {
            operation_id,
            cancel: CancellationToken::new(),
            timeout: None,
            progress_log: None,
            on_spawn: None,
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("operation_id", &self.operation_id)
            .field("timeout", &self.timeout)
            .field("progress_log", &self.progress_log)
            .finish_non_exhaustive()
    }
}

/// Result of parity creation
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// Parity written; the artifacts now on disk
    Created {
        /// Index and recovery volumes
        artifacts: Vec<PathBuf>,
    },
    /// par2 refused because parity files already exist
    AlreadyExists,
}

/// Result of PAR2 verification
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    /// Exit classification
    pub exit: Par2Exit,
    /// Files found intact
    pub intact_files: Vec<String>,
    /// Files present but damaged
    pub damaged_files: Vec<String>,
    /// Files missing
    pub missing_files: Vec<String>,
    /// Recovery blocks available
    pub recovery_blocks_available: u32,
    /// Additional recovery blocks needed, when repair is impossible
    pub blocks_needed: Option<u32>,
    /// Whether available recovery data suffices
    pub repairable: bool,
}

impl Default for VerifyReport {
    fn default() -> Self {
        Self {
            exit: Par2Exit::Success,
            intact_files: Vec::new(),
            damaged_files: Vec::new(),
            missing_files: Vec::new(),
            recovery_blocks_available: 0,
            blocks_needed: None,
            repairable: false,
        }
    }
}

impl VerifyReport {
    /// Everything intact
    pub fn is_complete(&self) -> bool {
        self.exit.is_success() && self.damaged_files.is_empty() && self.missing_files.is_empty()
    }

    /// File counts for the operation result
    pub fn counts(&self) -> VerifyCounts {
        VerifyCounts {
            verified: self.intact_files.len() as u32,
            damaged: self.damaged_files.len() as u32,
            missing: self.missing_files.len() as u32,
            repairable: self.repairable,
        }
    }

    /// Catalog status implied by this report
    pub fn item_status(&self) -> ItemStatus {
        if !self.exit.is_verdict() {
            ItemStatus::Error
        } else if !self.damaged_files.is_empty() {
            ItemStatus::Damaged
        } else if !self.missing_files.is_empty() {
            ItemStatus::Missing
        } else if self.exit.is_success() {
            ItemStatus::Protected
        } else {
            ItemStatus::Damaged
        }
    }
}

/// Result of PAR2 repair
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairResult {
    /// Whether repair was successful
    pub success: bool,
    /// Files that were repaired
    pub repaired_files: Vec<String>,
    /// Files that could not be repaired
    pub failed_files: Vec<String>,
    /// Error message if repair failed
    pub error: Option<String>,
}

/// Capabilities of a parity handler implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParityCapabilities {
    /// Can create parity
    pub can_create: bool,
    /// Can verify file integrity
    pub can_verify: bool,
    /// Can repair damaged files
    pub can_repair: bool,
}

/// Trait for PAR2 parity handling
///
/// The orchestrator only talks to parity through this trait, so tests can
/// substitute a handler that never spawns a process.
#[async_trait]
pub trait ParityHandler: Send + Sync {
    /// Create parity for `sources` under `layout` at `redundancy` percent
    ///
    /// # Errors
    ///
    /// - [`ExecutionError::NonZeroExit`](crate::error::ExecutionError::NonZeroExit)
    ///   with stderr verbatim when par2 fails for any reason other than
    ///   existing parity files
    /// - [`ExecutionError::ArtifactsMissing`](crate::error::ExecutionError::ArtifactsMissing)
    ///   when par2 exits 0 but wrote nothing
    /// - cancellation and timeout errors from the runner
    async fn create(
        &self,
        layout: &ParityLayout,
        sources: &[PathBuf],
        redundancy: u8,
        ctx: ExecutionContext,
    ) -> crate::Result<CreateOutcome>;

    /// Verify `layout` against its parity
    ///
    /// Damage is reported in the [`VerifyReport`], not as an error. Errors are
    /// reserved for runs that produced no verdict.
    async fn verify(&self, layout: &ParityLayout, ctx: ExecutionContext)
    -> crate::Result<VerifyReport>;

    /// Repair `layout` from its parity
    async fn repair(&self, layout: &ParityLayout, ctx: ExecutionContext)
    -> crate::Result<RepairResult>;

    /// Query capabilities of this handler
    fn capabilities(&self) -> ParityCapabilities;

    /// Human-readable name for logging
    fn name(&self) -> &'static str;
}
