//! Resource limits for PAR2 subprocesses
//!
//! Turns [`ResourceConfig`] (plus optional per-call overrides) into the par2
//! flags and the scheduling wrapper that prefix a command line. Nothing here
//! touches the filesystem or spawns anything; the command builder decides
//! whether the wrapper binaries are actually available.

use std::ffi::OsString;
use std::path::Path;

use crate::config::{ParallelHashing, ResourceConfig};

/// best-effort scheduling class for `ionice -c`
pub const IONICE_CLASS_BEST_EFFORT: u8 = 2;

/// Level used when the configured priority is unknown
pub const DEFAULT_IO_LEVEL: u8 = 4;

/// Per-call overrides layered over [`ResourceConfig`]
#[derive(Clone, Debug, Default)]
pub struct ResourceOverrides {
    /// Thread count override
    pub threads: Option<i64>,
    /// Memory cap override in MiB
    pub memory_limit_mb: Option<i64>,
    /// Parallel hashing override
    pub parallel_hashing: Option<ParallelHashing>,
    /// I/O priority override ("high", "normal", "low")
    pub io_priority: Option<String>,
}

/// I/O scheduling applied through `ionice`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoPriority {
    /// Scheduling class (`-c`)
    pub class: u8,
    /// Level within the class (`-n`), 0 is highest
    pub level: u8,
}

impl IoPriority {
    /// Map a configured priority name; unknown names fall back to level 4
    pub fn from_name(name: &str) -> Self {
        let level = match name.trim().to_ascii_lowercase().as_str() {
            "high" => 0,
            "normal" => 4,
            "low" => 7,
            other => {
                tracing::warn!(
                    io_priority = other,
                    fallback_level = DEFAULT_IO_LEVEL,
                    "invalid I/O priority, using default"
                );
                DEFAULT_IO_LEVEL
            }
        };
        Self {
            class: IONICE_CLASS_BEST_EFFORT,
            level,
        }
    }
}

/// Everything the resource policy contributes to one invocation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourcePlan {
    /// Flags appended after the par2 action (`-t`, `-m`, `-T`)
    pub par2_args: Vec<String>,
    /// I/O scheduling for the `ionice` wrapper
    pub io: IoPriority,
    /// CPU niceness for the `nice` wrapper
    pub nice: Option<i32>,
}

impl ResourcePlan {
    /// Arguments that prefix the par2 command line
    ///
    /// `ionice` comes first so its class applies to everything it execs,
    /// including `nice` and par2 itself.
    pub fn wrapper_args(&self, ionice: Option<&Path>, nice: Option<&Path>) -> Vec<OsString> {
        let mut args = Vec::new();
        if let Some(ionice) = ionice {
            args.push(ionice.as_os_str().to_os_string());
            args.push(format!("-c{}", self.io.class).into());
            args.push(format!("-n{}", self.io.level).into());
        }
        if let (Some(nice), Some(level)) = (nice, self.nice) {
            args.push(nice.as_os_str().to_os_string());
            args.push("-n".into());
            args.push(level.to_string().into());
        }
        args
    }
}

/// Build the resource plan for one invocation
pub fn plan(config: &ResourceConfig, overrides: Option<&ResourceOverrides>) -> ResourcePlan {
    let threads = overrides.and_then(|o| o.threads).or(config.threads);
    let memory = overrides
        .and_then(|o| o.memory_limit_mb)
        .or(config.memory_limit_mb);
    let hashing = overrides
        .and_then(|o| o.parallel_hashing)
        .unwrap_or(config.parallel_hashing);
    let io_name = overrides
        .and_then(|o| o.io_priority.as_deref())
        .unwrap_or(&config.io_priority);

    let mut par2_args = Vec::new();
    if let Some(n) = threads.filter(|n| *n > 0) {
        par2_args.push(format!("-t{}", n));
    }
    if let Some(mb) = memory.filter(|mb| *mb > 0) {
        par2_args.push(format!("-m{}", mb));
    }
    match hashing {
        ParallelHashing::Flag(true) => par2_args.push("-T".to_string()),
        ParallelHashing::Count(n) if n > 0 => par2_args.push(format!("-T{}", n)),
        _ => {}
    }

    ResourcePlan {
        par2_args,
        io: IoPriority::from_name(io_name),
        nice: config.cpu_nice,
    }
}
