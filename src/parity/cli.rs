//! CLI-based PAR2 handler using external par2 binary

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::layout::ParityLayout;
use super::parser::{
    Par2Exit, failure_detail, is_already_exists, parse_repair_output, parse_verify_output,
};
use super::traits::{
    CreateOutcome, ExecutionContext, ParityCapabilities, ParityHandler, RepairResult, VerifyReport,
};
use crate::config::{Config, ResourceConfig};
use crate::error::{ConsistencyError, Error, ExecutionError};
use crate::process::{
    Par2Action, ProcessRunner, RunOptions, RunOutput, Toolchain, argv_budget, par2_command,
};
use crate::resource_limits;

/// CLI-based PAR2 handler using external par2 binary
///
/// Every invocation is wrapped with the configured I/O and CPU priority,
/// runs inside the target's parity directory and is tagged with its
/// operation id.
///
/// # Examples
///
/// ```no_run
/// use par2_protect::parity::CliParityHandler;
/// use std::path::PathBuf;
///
/// // Explicit binary
/// let handler = CliParityHandler::new(PathBuf::from("/usr/bin/par2"));
///
/// // Or auto-discover from PATH
/// let handler = CliParityHandler::from_path().expect("par2 not found in PATH");
/// ```
pub struct CliParityHandler {
    tools: Toolchain,
    resources: ResourceConfig,
    runner: ProcessRunner,
}

impl CliParityHandler {
    /// Handler for an explicit binary, no scheduling wrappers, default resources
    pub fn new(binary_path: PathBuf) -> Self {
        Self {
            tools: Toolchain::par2_only(binary_path),
            resources: ResourceConfig::default(),
            runner: ProcessRunner::default(),
        }
    }

    /// Attempt to find par2 in PATH
    pub fn from_path() -> Option<Self> {
        which::which("par2").ok().map(Self::new)
    }

    /// Build a handler from configuration
    ///
    /// Uses `par2_path` when set, otherwise searches PATH if `search_path`
    /// allows it. Returns None when no binary can be found.
    pub fn from_config(config: &Config) -> Option<Self> {
        let par2 = match &config.tools.par2_path {
            Some(path) if path.exists() => path.clone(),
            Some(path) => {
                tracing::warn!(par2_path = %path.display(), "configured par2 binary does not exist");
                return None;
            }
            None if config.tools.search_path => which::which("par2").ok()?,
            None => return None,
        };
        let search = config.tools.search_path;
        Some(Self {
            tools: Toolchain {
                par2,
                ionice: Toolchain::resolve_wrapper(&config.tools.ionice_path, search),
                nice: config
                    .resources
                    .cpu_nice
                    .and_then(|_| Toolchain::resolve_wrapper(&config.tools.nice_path, search)),
            },
            resources: config.resources.clone(),
            runner: ProcessRunner::default(),
        })
    }

    /// Replace the resource settings
    pub fn with_resources(mut self, resources: ResourceConfig) -> Self {
        self.resources = resources;
        self
    }

    /// Replace the process runner
    pub fn with_runner(mut self, runner: ProcessRunner) -> Self {
        self.runner = runner;
        self
    }

    /// Path of the par2 binary in use
    pub fn binary_path(&self) -> &Path {
        &self.tools.par2
    }

    async fn invoke(
        &self,
        action: Par2Action,
        layout: &ParityLayout,
        sources: &[PathBuf],
        ctx: ExecutionContext,
    ) -> crate::Result<RunOutput> {
        let plan = resource_limits::plan(&self.resources, None);
        let command = par2_command(
            &self.tools,
            &plan,
            action,
            layout,
            sources,
            Some(&ctx.operation_id),
        );
        // par2 takes one file list per set, so it cannot be split across runs
        if command.argv_bytes() > argv_budget() {
            return Err(Error::validation(
                "path",
                format!(
                    "{} holds too many files ({}) for one par2 run; protect its subdirectories separately",
                    layout.target.display(),
                    sources.len()
                ),
            ));
        }
        tracing::debug!(
            operation_id = %ctx.operation_id,
            command = %command.display(),
            "running par2"
        );
        self.runner
            .run(
                &command,
                RunOptions {
                    cancel: ctx.cancel,
                    timeout: ctx.timeout,
                    output_log: ctx.progress_log,
                    on_spawn: ctx.on_spawn,
                },
            )
            .await
    }
}

/// Verify and repair need the index; without it par2 has nothing to read
fn require_index(layout: &ParityLayout) -> crate::Result<()> {
    if layout.index_present() {
        return Ok(());
    }
    Err(ConsistencyError::ParityDirectoryMissing {
        path: layout.target.clone(),
        parity_location: layout.parity_dir.clone(),
    }
    .into())
}

fn nonzero_exit(output: &RunOutput) -> Error {
    ExecutionError::NonZeroExit {
        exit_code: output.exit_code,
        stderr: failure_detail(&output.stdout, &output.stderr),
    }
    .into()
}

#[async_trait]
impl ParityHandler for CliParityHandler {
    async fn create(
        &self,
        layout: &ParityLayout,
        sources: &[PathBuf],
        redundancy: u8,
        ctx: ExecutionContext,
    ) -> crate::Result<CreateOutcome> {
        if sources.is_empty() {
            return Err(Error::validation(
                "path",
                format!("{} contains no files to protect", layout.target.display()),
            ));
        }
        tokio::fs::create_dir_all(&layout.parity_dir).await?;

        let output = self
            .invoke(Par2Action::Create { redundancy }, layout, sources, ctx)
            .await?;

        if !output.success() {
            if is_already_exists(output.stdout.as_bytes(), output.stderr.as_bytes()) {
                return Ok(CreateOutcome::AlreadyExists);
            }
            return Err(nonzero_exit(&output));
        }

        let artifacts = layout.artifacts()?;
        if artifacts.is_empty() {
            return Err(ExecutionError::ArtifactsMissing {
                parity_dir: layout.parity_dir.clone(),
            }
            .into());
        }
        Ok(CreateOutcome::Created { artifacts })
    }

    async fn verify(
        &self,
        layout: &ParityLayout,
        ctx: ExecutionContext,
    ) -> crate::Result<VerifyReport> {
        require_index(layout)?;
        let output = self.invoke(Par2Action::Verify, layout, &[], ctx).await?;
        let exit = Par2Exit::from_code(output.exit_code);
        if !exit.is_verdict() {
            return Err(nonzero_exit(&output));
        }
        Ok(parse_verify_output(
            output.stdout.as_bytes(),
            output.stderr.as_bytes(),
            exit,
        ))
    }

    async fn repair(
        &self,
        layout: &ParityLayout,
        ctx: ExecutionContext,
    ) -> crate::Result<RepairResult> {
        require_index(layout)?;
        let output = self.invoke(Par2Action::Repair, layout, &[], ctx).await?;
        if !output.success() {
            return Err(nonzero_exit(&output));
        }
        Ok(parse_repair_output(
            output.stdout.as_bytes(),
            output.stderr.as_bytes(),
            Par2Exit::Success,
        ))
    }

    fn capabilities(&self) -> ParityCapabilities {
        ParityCapabilities {
            can_create: true,
            can_verify: true,
            can_repair: true,
        }
    }

    fn name(&self) -> &'static str {
        "cli-par2"
    }
}
