//! Subprocess plumbing: command construction, execution and discovery
//!
//! - [`command`]: par2 command lines with resource wrappers and operation tagging
//! - [`runner`]: spawn/wait/cancel with SIGTERM→SIGKILL escalation
//! - [`procfs`]: live PAR2 process discovery and PID liveness

pub mod command;
pub mod procfs;
pub mod runner;

pub use command::{CommandLine, OPERATION_ENV, Par2Action, Toolchain, argv_budget, par2_command};
pub use procfs::{ProcessSample, is_alive, scan_par2_processes};
pub use runner::{ProcessRunner, RunOptions, RunOutput, SpawnHook, cleanup_scratch, progress_log_path};
