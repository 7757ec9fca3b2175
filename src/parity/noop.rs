//! No-op PAR2 handler for graceful degradation

use async_trait::async_trait;
use std::path::PathBuf;

use super::layout::ParityLayout;
use super::traits::{
    CreateOutcome, ExecutionContext, ParityCapabilities, ParityHandler, RepairResult, VerifyReport,
};

const UNAVAILABLE: &str = "PAR2 operations require an external par2 binary. \
                           Configure par2_path or ensure par2 is in PATH.";

/// No-op PAR2 handler used when no par2 binary is available
///
/// The manager still starts, lists the catalog and reports status; every
/// operation that needs par2 fails with `Error::NotSupported`.
pub struct NoOpParityHandler;

#[async_trait]
impl ParityHandler for NoOpParityHandler {
    async fn create(
        &self,
        _layout: &ParityLayout,
        _sources: &[PathBuf],
        _redundancy: u8,
        _ctx: ExecutionContext,
    ) -> crate::Result<CreateOutcome> {
        Err(crate::Error::NotSupported(UNAVAILABLE.into()))
    }

    async fn verify(
        &self,
        _layout: &ParityLayout,
        _ctx: ExecutionContext,
    ) -> crate::Result<VerifyReport> {
        Err(crate::Error::NotSupported(UNAVAILABLE.into()))
    }

    async fn repair(
        &self,
        _layout: &ParityLayout,
        _ctx: ExecutionContext,
    ) -> crate::Result<RepairResult> {
        Err(crate::Error::NotSupported(UNAVAILABLE.into()))
    }

    fn capabilities(&self) -> ParityCapabilities {
        ParityCapabilities {
            can_create: false,
            can_verify: false,
            can_repair: false,
        }
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}
