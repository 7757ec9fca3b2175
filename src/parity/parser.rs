//! Parser for par2 command output

use regex::Regex;
use std::str;
use std::sync::OnceLock;

use super::traits::{RepairResult, VerifyReport};

/// par2cmdline exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Par2Exit {
    /// 0: success / all files correct
    Success,
    /// 1: damage found, enough recovery data to repair
    RepairPossible,
    /// 2: damage found, not enough recovery data
    RepairNotPossible,
    /// 3: invalid command line arguments
    InvalidArguments,
    /// 4: the PAR2 files themselves are unusable
    InsufficientCriticalData,
    /// 5: repair was attempted and failed
    RepairFailed,
    /// 6: file I/O error (includes "file already exists" on create)
    FileIoError,
    /// 7: internal logic error
    LogicError,
    /// 8: out of memory
    MemoryError,
    /// Any other code
    Other(i32),
    /// Killed by a signal
    Signalled,
}

impl Par2Exit {
    /// Classify an exit code (None = terminated by a signal)
    pub fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => Par2Exit::Success,
            Some(1) => Par2Exit::RepairPossible,
            Some(2) => Par2Exit::RepairNotPossible,
            Some(3) => Par2Exit::InvalidArguments,
            Some(4) => Par2Exit::InsufficientCriticalData,
            Some(5) => Par2Exit::RepairFailed,
            Some(6) => Par2Exit::FileIoError,
            Some(7) => Par2Exit::LogicError,
            Some(8) => Par2Exit::MemoryError,
            Some(other) => Par2Exit::Other(other),
            None => Par2Exit::Signalled,
        }
    }

    /// Returns `true` for exit code 0
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Whether a verify run produced a usable verdict (codes 0, 1, 2)
    pub fn is_verdict(self) -> bool {
        matches!(
            self,
            Self::Success | Self::RepairPossible | Self::RepairNotPossible
        )
    }
}

/// Parse output from `par2 v` (verify)
///
/// Handles par2cmdline's per-target lines (`Target: "name" - found.`,
/// `- damaged.`, `- missing.`) plus the summary lines about recovery blocks.
pub fn parse_verify_output(stdout: &[u8], stderr: &[u8], exit: Par2Exit) -> VerifyReport {
    let combined = combine(stdout, stderr);

    let mut report = VerifyReport {
        exit,
        ..Default::default()
    };
    let mut says_possible = false;
    let mut says_impossible = false;

    for line in combined.lines() {
        let line = line.trim();
        let lower = line.to_lowercase();

        if lower.starts_with("target:") {
            let Some(name) = extract_quoted(line) else {
                continue;
            };
            if lower.contains("- found") {
                push_unique(&mut report.intact_files, name);
            } else if lower.contains("- damaged") {
                push_unique(&mut report.damaged_files, name);
            } else if lower.contains("- missing") {
                push_unique(&mut report.missing_files, name);
            }
            continue;
        }

        if lower.contains("recovery block")
            && lower.contains("available")
            && let Some(n) = extract_number_before_blocks(&lower)
        {
            report.recovery_blocks_available = report.recovery_blocks_available.max(n);
        }

        if lower.contains("you need")
            && lower.contains("more recovery block")
            && let Some(n) = extract_number_before_blocks(&lower)
        {
            report.blocks_needed = Some(n);
        }

        if lower.starts_with("repair is possible") {
            says_possible = true;
        }
        if lower.starts_with("repair is not possible") {
            says_impossible = true;
        }
    }

    let damaged = !report.damaged_files.is_empty() || !report.missing_files.is_empty();
    report.repairable = match exit {
        Par2Exit::RepairPossible => true,
        Par2Exit::RepairNotPossible => false,
        _ => damaged && says_possible && !says_impossible,
    };
    report
}

/// Parse output from `par2 r` (repair)
pub fn parse_repair_output(stdout: &[u8], stderr: &[u8], exit: Par2Exit) -> RepairResult {
    let combined = combine(stdout, stderr);
    let error_output = str::from_utf8(stderr).unwrap_or_default();

    let mut repaired_files = Vec::new();
    let mut failed_files = Vec::new();
    let mut error = None;

    for line in combined.lines() {
        let lower = line.to_lowercase();

        if lower.trim_start().starts_with("repairing:")
            && let Some(name) = extract_quoted(line)
        {
            push_unique(&mut repaired_files, name);
        }

        if (lower.contains("could not repair") || lower.contains("failed to repair"))
            && let Some(name) = extract_quoted(line)
        {
            push_unique(&mut failed_files, name);
        }

        if error.is_none() && (lower.contains("error") || lower.contains("repair failed")) {
            error = Some(line.trim().to_string());
        }
    }

    if !exit.is_success() && error.is_none() && !error_output.trim().is_empty() {
        error = Some(error_output.trim().to_string());
    }
    if !exit.is_success() {
        // names announced before the failure were not actually restored
        for name in std::mem::take(&mut repaired_files) {
            push_unique(&mut failed_files, name);
        }
    }

    RepairResult {
        success: exit.is_success(),
        repaired_files,
        failed_files,
        error,
    }
}

/// Whether a create run refused to overwrite existing parity files
pub fn is_already_exists(stdout: &[u8], stderr: &[u8]) -> bool {
    combine(stdout, stderr)
        .to_lowercase()
        .contains("already exists")
}

fn progress_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // Literal pattern, compilation cannot fail
    #[allow(clippy::expect_used)]
    PATTERN.get_or_init(|| Regex::new(r"(\d{1,3}(?:\.\d+)?)%").expect("valid progress regex"))
}

/// Last progress percentage printed in `output`
///
/// par2 rewrites its progress line with carriage returns, so the output is
/// scanned as a whole rather than line by line.
pub fn last_progress(output: &str) -> Option<f32> {
    progress_pattern()
        .captures_iter(output)
        .filter_map(|c| c.get(1)?.as_str().parse::<f32>().ok())
        .filter(|p| (0.0..=100.0).contains(p))
        .last()
}

/// Failure detail for an unsuccessful run: stderr verbatim, else the tail of stdout
pub fn failure_detail(stdout: &str, stderr: &str) -> String {
    if !stderr.trim().is_empty() {
        return stderr.to_string();
    }
    let lines: Vec<&str> = stdout
        .split(['\n', '\r'])
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let start = lines.len().saturating_sub(10);
    lines[start..].join("\n")
}

fn combine(stdout: &[u8], stderr: &[u8]) -> String {
    let output = String::from_utf8_lossy(stdout);
    let error_output = String::from_utf8_lossy(stderr);
    format!("{}\n{}", output, error_output).replace('\r', "\n")
}

fn push_unique(list: &mut Vec<String>, name: String) {
    if !list.contains(&name) {
        list.push(name);
    }
}

/// Extract a number that appears before the word "block" or "blocks" in a line.
///
/// Handles par2cmdline formats such as "You have 577 recovery blocks available"
/// and "You need 3 more recovery blocks" where words sit between the number
/// and "blocks".
fn extract_number_before_blocks(line: &str) -> Option<u32> {
    let words: Vec<&str> = line.split_whitespace().collect();
    for i in 0..words.len() {
        if words[i].starts_with("block") {
            for j in (0..i).rev() {
                if let Ok(num) = words[j].parse::<u32>() {
                    return Some(num);
                }
            }
        }
    }
    None
}

fn extract_quoted(line: &str) -> Option<String> {
    let start = line.find('"')?;
    let end = line[start + 1..].find('"')?;
    Some(line[start + 1..start + 1 + end].to_string())
}
