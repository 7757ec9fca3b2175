//! Command lines for par2 invocations

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::parity::layout::ParityLayout;
use crate::resource_limits::ResourcePlan;
use crate::types::OperationId;

/// Environment variable carrying the operation id into the subprocess
///
/// `ionice` and `nice` exec their target, so the final process table entry is
/// par2's own argv; the environment survives the exec and is how a live
/// process is matched back to its operation.
pub const OPERATION_ENV: &str = "PAR2PROTECT_OPERATION_ID";

/// A fully resolved command line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandLine {
    /// Executable
    pub program: PathBuf,
    /// Arguments after the program
    pub args: Vec<OsString>,
    /// Working directory
    pub current_dir: Option<PathBuf>,
    /// Extra environment
    pub env: Vec<(String, String)>,
}

impl CommandLine {
    /// Command line running `program` with no arguments
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            env: Vec::new(),
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Add an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Bytes the program and arguments occupy in the exec argument block
    pub fn argv_bytes(&self) -> usize {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(|arg| arg.len() + 1)
            .sum()
    }

    /// Space-joined rendering for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(|s| s.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub(crate) fn to_command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command
    }
}

/// Upper bound on argv bytes when the system limit cannot be read
const FALLBACK_ARGV_BUDGET: usize = 1 << 20;

/// Linux never grants more than 6 MiB of arguments, whatever the stack limit
const MAX_ARGV_BUDGET: usize = 3 << 20;

/// Bytes of arguments one invocation may use
///
/// Half of `ARG_MAX`, leaving the rest for the environment.
pub fn argv_budget() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf takes a plain integer name and has no preconditions
        let arg_max = unsafe { libc::sysconf(libc::_SC_ARG_MAX) };
        if let Ok(arg_max) = usize::try_from(arg_max)
            && arg_max > 0
        {
            return (arg_max / 2).min(MAX_ARGV_BUDGET);
        }
    }
    FALLBACK_ARGV_BUDGET
}

/// What par2 should do
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Par2Action {
    /// `par2 c -r<redundancy>`
    Create {
        /// Redundancy percentage
        redundancy: u8,
    },
    /// `par2 v`
    Verify,
    /// `par2 r`
    Repair,
}

impl Par2Action {
    fn verb(&self) -> &'static str {
        match self {
            Par2Action::Create { .. } => "c",
            Par2Action::Verify => "v",
            Par2Action::Repair => "r",
        }
    }
}

/// Resolved binaries used to build par2 command lines
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Toolchain {
    /// par2 binary
    pub par2: PathBuf,
    /// ionice, when available
    pub ionice: Option<PathBuf>,
    /// nice, when available
    pub nice: Option<PathBuf>,
}

impl Toolchain {
    /// Toolchain with only par2 and no scheduling wrappers
    pub fn par2_only(par2: impl Into<PathBuf>) -> Self {
        Self {
            par2: par2.into(),
            ionice: None,
            nice: None,
        }
    }

    /// Resolve a wrapper binary, returning None when it cannot be found
    pub fn resolve_wrapper(configured: &Path, search_path: bool) -> Option<PathBuf> {
        if configured.is_absolute() {
            return configured.is_file().then(|| configured.to_path_buf());
        }
        if !search_path {
            return None;
        }
        match which::which(configured) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::debug!(
                    binary = %configured.display(),
                    error = %e,
                    "scheduling wrapper not found, running without it"
                );
                None
            }
        }
    }
}

/// Build the command line for one par2 run over `layout`
///
/// `sources` is only used for [`Par2Action::Create`]. The process runs inside
/// the parity directory and carries `operation_id` in [`OPERATION_ENV`].
/// Sources under the basepath are passed relative to the parity directory
/// to keep the argument block small.
pub fn par2_command(
    tools: &Toolchain,
    plan: &ResourcePlan,
    action: Par2Action,
    layout: &ParityLayout,
    sources: &[PathBuf],
    operation_id: Option<&OperationId>,
) -> CommandLine {
    let wrapper = plan.wrapper_args(tools.ionice.as_deref(), tools.nice.as_deref());
    let mut line = match wrapper.split_first() {
        Some((program, rest)) => CommandLine::new(PathBuf::from(program))
            .args(rest.iter().cloned())
            .arg(tools.par2.as_os_str()),
        None => CommandLine::new(&tools.par2),
    };

    line = line.arg(action.verb());
    if let Par2Action::Create { redundancy } = action {
        line = line.arg(format!("-r{}", redundancy));
    }
    line = line
        .args(plan.par2_args.iter().cloned())
        .arg(format!("-B{}", layout.basepath.display()))
        .arg(layout.index_file().as_os_str());

    if let Par2Action::Create { .. } = action {
        line = line
            .arg("--")
            .args(sources.iter().map(|p| source_arg(layout, p)));
    }

    line = line.current_dir(&layout.parity_dir);
    if let Some(id) = operation_id {
        line = line.env(OPERATION_ENV, id.as_str());
    }
    line
}

/// `../<relative>` from the parity directory, or the path as given
fn source_arg(layout: &ParityLayout, source: &Path) -> OsString {
    match source.strip_prefix(&layout.basepath) {
        Ok(relative) if layout.parity_dir.parent() == Some(layout.basepath.as_path()) => {
            Path::new("..").join(relative).into_os_string()
        }
        _ => source.as_os_str().to_os_string(),
    }
}
