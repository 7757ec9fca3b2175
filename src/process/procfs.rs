//! Live process discovery through `/proc`
//!
//! The proc root honours `HOST_PROC` so the scanner works from inside a
//! container with the host's `/proc` mounted elsewhere.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use super::command::OPERATION_ENV;
use crate::types::OperationId;

/// Executable names recognised as the PAR2 tool
pub const PAR2_BINARIES: &[&str] = &["par2", "par2create", "par2verify", "par2repair"];

static PROC_ROOT: OnceLock<PathBuf> = OnceLock::new();

/// Root of the proc filesystem
pub fn root_path() -> &'static Path {
    PROC_ROOT.get_or_init(|| match env::var("HOST_PROC") {
        Ok(v) if !v.is_empty() => v.into(),
        _ => "/proc".into(),
    })
}

/// Fields of `/proc/<pid>/stat` the scanner uses
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcStat {
    /// Single-letter state (`R`, `S`, `Z`, ...)
    pub state: char,
    /// User time in clock ticks
    pub utime: u64,
    /// System time in clock ticks
    pub stime: u64,
    /// Start time after boot in clock ticks
    pub starttime: u64,
}

/// Parse the contents of a `stat` file
///
/// The command name is parenthesised and may itself contain spaces or
/// parentheses, so parsing starts after the last `)`.
pub fn parse_stat(content: &str) -> Option<ProcStat> {
    let rest = &content[content.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    Some(ProcStat {
        state: fields.first()?.chars().next()?,
        utime: fields.get(11)?.parse().ok()?,
        stime: fields.get(12)?.parse().ok()?,
        starttime: fields.get(19)?.parse().ok()?,
    })
}

/// Read and parse `/proc/<pid>/stat`
pub fn read_stat(root: &Path, pid: u32) -> Option<ProcStat> {
    let content = fs::read_to_string(root.join(pid.to_string()).join("stat")).ok()?;
    parse_stat(&content)
}

/// Split raw `cmdline` bytes into arguments
pub fn parse_cmdline(raw: &[u8]) -> Vec<String> {
    let trimmed = match raw.iter().rposition(|b| *b != 0) {
        Some(end) => &raw[..=end],
        None => return Vec::new(),
    };
    trimmed
        .split(|b| *b == 0)
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect()
}

/// Arguments of a process; empty for kernel threads and vanished processes
pub fn read_cmdline(root: &Path, pid: u32) -> Vec<String> {
    fs::read(root.join(pid.to_string()).join("cmdline"))
        .map(|raw| parse_cmdline(&raw))
        .unwrap_or_default()
}

/// One variable from `/proc/<pid>/environ`
///
/// Readable only for processes owned by the same user (or as root).
pub fn read_environ_var(root: &Path, pid: u32, key: &str) -> Option<String> {
    let raw = fs::read(root.join(pid.to_string()).join("environ")).ok()?;
    raw.split(|b| *b == 0).find_map(|entry| {
        let entry = std::str::from_utf8(entry).ok()?;
        let (k, v) = entry.split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}

/// Resident set size in bytes from `/proc/<pid>/statm`
pub fn resident_bytes(root: &Path, pid: u32) -> Option<u64> {
    let statm = fs::read_to_string(root.join(pid.to_string()).join("statm")).ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * page_size())
}

/// Seconds since boot
pub fn uptime_secs(root: &Path) -> Option<f64> {
    let content = fs::read_to_string(root.join("uptime")).ok()?;
    content.split_whitespace().next()?.parse().ok()
}

/// Numeric entries of the proc root
pub fn list_pids(root: &Path) -> Vec<u32> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse().ok()))
        .collect()
}

/// Whether any argument names a PAR2 binary
pub fn is_par2_command(args: &[String]) -> bool {
    args.iter().any(|arg| {
        Path::new(arg)
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| PAR2_BINARIES.contains(&name))
    })
}

fn operation_token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // Literal pattern, compilation cannot fail
    #[allow(clippy::expect_used)]
    PATTERN.get_or_init(|| Regex::new(r"\bop_[0-9a-f]{1,64}\b").expect("valid token regex"))
}

/// Operation id embedded anywhere in the command line
pub fn operation_token(args: &[String]) -> Option<OperationId> {
    args.iter().find_map(|arg| {
        operation_token_pattern()
            .find(arg)
            .and_then(|m| OperationId::parse(m.as_str()).ok())
    })
}

/// Whether `pid` names a live, non-zombie process
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    #[cfg(unix)]
    {
        // SAFETY: signal 0 performs only the existence and permission check.
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EPERM) {
                return false;
            }
        }
        match read_stat(Path::new("/proc"), pid) {
            Some(stat) => stat.state != 'Z' && stat.state != 'X',
            None => true,
        }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// A PAR2 process found in the process table
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessSample {
    /// Process id
    pub pid: u32,
    /// Arguments
    pub args: Vec<String>,
    /// Operation id from the environment or the command line
    pub operation_id: Option<OperationId>,
    /// Lifetime average CPU usage, percent of one core
    pub cpu_percent: f32,
    /// Resident memory in bytes
    pub memory_bytes: u64,
    /// Seconds since the process started
    pub elapsed_secs: Option<u64>,
}

impl ProcessSample {
    /// Space-joined command line
    pub fn command_line(&self) -> String {
        self.args.join(" ")
    }
}

/// Scan the host proc root for PAR2 processes
pub fn scan_par2_processes() -> Vec<ProcessSample> {
    scan_par2_processes_in(root_path())
}

/// Scan a proc root for PAR2 processes
pub fn scan_par2_processes_in(root: &Path) -> Vec<ProcessSample> {
    let uptime = uptime_secs(root);
    let ticks = clock_ticks() as f64;
    let mut samples = Vec::new();

    for pid in list_pids(root) {
        let args = read_cmdline(root, pid);
        if args.is_empty() || !is_par2_command(&args) {
            continue;
        }
        let stat = read_stat(root, pid);
        if stat.is_some_and(|s| s.state == 'Z') {
            continue;
        }

        let operation_id = read_environ_var(root, pid, OPERATION_ENV)
            .and_then(|raw| OperationId::parse(&raw).ok())
            .or_else(|| operation_token(&args));

        let (cpu_percent, elapsed_secs) = match (stat, uptime) {
            (Some(stat), Some(uptime)) if ticks > 0.0 => {
                let elapsed = (uptime - stat.starttime as f64 / ticks).max(0.0);
                let busy = (stat.utime + stat.stime) as f64 / ticks;
                let cpu = if elapsed > 0.0 {
                    (busy / elapsed * 100.0) as f32
                } else {
                    0.0
                };
                (cpu, Some(elapsed as u64))
            }
            _ => (0.0, None),
        };

        samples.push(ProcessSample {
            pid,
            args,
            operation_id,
            cpu_percent,
            memory_bytes: resident_bytes(root, pid).unwrap_or(0),
            elapsed_secs,
        });
    }

    samples.sort_by_key(|s| s.pid);
    samples
}

fn clock_ticks() -> u64 {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions.
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if ticks > 0 { ticks as u64 } else { 100 }
    }
    #[cfg(not(unix))]
    {
        100
    }
}

fn page_size() -> u64 {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as u64 } else { 4096 }
    }
    #[cfg(not(unix))]
    {
        4096
    }
}
