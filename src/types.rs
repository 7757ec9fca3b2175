//! Core types for par2-protect

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::error::{Error, Result};

/// Prefix shared by every operation id
pub const OPERATION_ID_PREFIX: &str = "op_";

fn operation_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // Literal pattern, compilation cannot fail
    #[allow(clippy::expect_used)]
    PATTERN.get_or_init(|| Regex::new(r"^op_[0-9a-f]{1,64}$").expect("valid operation id regex"))
}

/// Unique identifier for an operation, always `op_<lowercase hex>`
///
/// The format is checked on every construction from outside input, so an id
/// can be embedded in process lookups and scratch file patterns safely.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    /// Generate a fresh random id
    pub fn generate() -> Self {
        let value: u64 = rand::random();
        let stamp = Utc::now().timestamp_micros() as u64;
        Self(format!("{}{:012x}{:016x}", OPERATION_ID_PREFIX, stamp & 0xffff_ffff_ffff, value))
    }

    /// Validate an id received from a caller
    pub fn parse(raw: &str) -> Result<Self> {
        if operation_id_pattern().is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(Error::validation(
                "operation_id",
                format!("invalid operation id format: {:?} (expected op_<hex>)", raw),
            ))
        }
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for OperationId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for OperationId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl sqlx::Type<sqlx::Sqlite> for OperationId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <String as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <String as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for OperationId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for OperationId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> std::result::Result<Self, sqlx::error::BoxDynError> {
        let raw = <String as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self::parse(&raw)?)
    }
}

/// Whether protection covers a single file or a directory tree
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtectionMode {
    /// A single file; parity lives in the parent's `.parity`
    File,
    /// A directory tree; parity lives in `<dir>/.parity`
    Directory,
}

impl ProtectionMode {
    /// Convert integer code to ProtectionMode
    pub fn from_i32(mode: i32) -> Self {
        match mode {
            0 => ProtectionMode::File,
            _ => ProtectionMode::Directory,
        }
    }

    /// Convert ProtectionMode to integer code
    pub fn to_i32(&self) -> i32 {
        match self {
            ProtectionMode::File => 0,
            ProtectionMode::Directory => 1,
        }
    }
}

/// Last known integrity status of a protected item
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ItemStatus {
    /// Parity exists and the last check found every file intact
    Protected,
    /// Files differ from their parity data
    Damaged,
    /// Protected files or the parity directory are gone
    Missing,
    /// The last operation on this item failed
    Error,
    /// Not yet checked
    Unknown,
}

impl ItemStatus {
    /// Convert integer status code to ItemStatus
    pub fn from_i32(status: i32) -> Self {
        match status {
            0 => ItemStatus::Protected,
            1 => ItemStatus::Damaged,
            2 => ItemStatus::Missing,
            3 => ItemStatus::Error,
            _ => ItemStatus::Unknown,
        }
    }

    /// Convert ItemStatus to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            ItemStatus::Protected => 0,
            ItemStatus::Damaged => 1,
            ItemStatus::Missing => 2,
            ItemStatus::Error => 3,
            ItemStatus::Unknown => 4,
        }
    }

    /// Name used in aggregate counts and status payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Protected => "PROTECTED",
            ItemStatus::Damaged => "DAMAGED",
            ItemStatus::Missing => "MISSING",
            ItemStatus::Error => "ERROR",
            ItemStatus::Unknown => "UNKNOWN",
        }
    }
}

/// Kind of work an operation performs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    /// Create parity for a path
    Protect,
    /// Check a path against its parity
    Verify,
    /// Rebuild damaged files from parity
    Repair,
    /// Delete parity and the catalog entry
    Remove,
}

impl OperationType {
    /// Convert integer code to OperationType
    pub fn from_i32(kind: i32) -> Self {
        match kind {
            0 => OperationType::Protect,
            1 => OperationType::Verify,
            2 => OperationType::Repair,
            _ => OperationType::Remove,
        }
    }

    /// Convert OperationType to integer code
    pub fn to_i32(&self) -> i32 {
        match self {
            OperationType::Protect => 0,
            OperationType::Verify => 1,
            OperationType::Repair => 2,
            OperationType::Remove => 3,
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationType::Protect => "protect",
            OperationType::Verify => "verify",
            OperationType::Repair => "repair",
            OperationType::Remove => "remove",
        };
        f.write_str(name)
    }
}

/// Operation lifecycle status
///
/// `Pending -> Processing -> {Completed | Failed | Cancelled | Skipped}`;
/// terminal states never change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationStatus {
    /// Waiting for a worker
    Pending,
    /// Claimed by a worker, subprocess running
    Processing,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Stopped by request
    Cancelled,
    /// Bypassed because existing state already satisfies it
    Skipped,
}

impl OperationStatus {
    /// Convert integer status code to OperationStatus
    pub fn from_i32(status: i32) -> Self {
        match status {
            0 => OperationStatus::Pending,
            1 => OperationStatus::Processing,
            2 => OperationStatus::Completed,
            3 => OperationStatus::Failed,
            4 => OperationStatus::Cancelled,
            5 => OperationStatus::Skipped,
            _ => OperationStatus::Failed, // Default to Failed for unknown status
        }
    }

    /// Convert OperationStatus to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            OperationStatus::Pending => 0,
            OperationStatus::Processing => 1,
            OperationStatus::Completed => 2,
            OperationStatus::Failed => 3,
            OperationStatus::Cancelled => 4,
            OperationStatus::Skipped => 5,
        }
    }

    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::Pending | OperationStatus::Processing)
    }
}

/// Operation priority; higher runs first, FIFO within a level
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work such as scheduled verify-all batches (-1)
    Low = -1,
    /// Explicit user requests (0)
    #[default]
    Normal = 0,
    /// Jump the queue (1)
    High = 1,
}

impl Priority {
    /// Convert integer priority code to Priority enum
    pub fn from_i32(priority: i32) -> Self {
        match priority {
            i32::MIN..=-1 => Priority::Low,
            0 => Priority::Normal,
            _ => Priority::High,
        }
    }

    /// Convert Priority to its integer code
    pub fn to_i32(&self) -> i32 {
        *self as i32
    }
}

/// A path under PAR2 protection, as recorded in the catalog
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProtectedItem {
    /// Absolute path of the protected file or directory (unique)
    pub path: PathBuf,
    /// File or directory protection
    pub mode: ProtectionMode,
    /// Parity redundancy percentage (1-100)
    pub redundancy: u8,
    /// Bytes of protected content when last measured
    pub size: u64,
    /// Number of protected files when last measured
    pub file_count: u64,
    /// Directory holding the `.par2` artifacts; always ends in `/.parity`
    pub parity_location: PathBuf,
    /// Outcome of the last protect/verify/repair
    pub last_status: ItemStatus,
    /// When parity was last (re)created
    pub protected_date: DateTime<Utc>,
    /// When the item was last verified (None = never)
    pub last_verified: Option<DateTime<Utc>>,
    /// Detail of the last failure, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Filter for [`Database::list_items`](crate::db::Database::list_items)
#[derive(Clone, Debug, Default)]
pub struct ItemFilter {
    /// Only items with this status
    pub status: Option<ItemStatus>,
    /// Only items with this mode
    pub mode: Option<ProtectionMode>,
    /// Only items at or below this path
    pub path_prefix: Option<PathBuf>,
}

/// Aggregate catalog statistics
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogStats {
    /// Number of catalog entries
    pub total_items: u64,
    /// Sum of protected file counts
    pub total_files: u64,
    /// Sum of protected bytes
    pub total_size: u64,
    /// Most recent verification across all items
    pub last_verification: Option<DateTime<Utc>>,
    /// Item count per status name
    pub counts_by_status: BTreeMap<String, u64>,
}

impl CatalogStats {
    /// Count of items with `status`
    pub fn count(&self, status: ItemStatus) -> u64 {
        self.counts_by_status
            .get(status.as_str())
            .copied()
            .unwrap_or(0)
    }
}

/// Overall protection health derived from [`CatalogStats`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    /// Every item is protected
    Good,
    /// Some items are missing but nothing is damaged
    Warning,
    /// Something is damaged or errored
    Error,
    /// No items, or only unverified ones
    Unknown,
}

impl Health {
    /// Classify aggregate counts
    pub fn classify(stats: &CatalogStats) -> Self {
        let protected = stats.count(ItemStatus::Protected);
        if stats.total_items > 0 && protected == stats.total_items {
            Health::Good
        } else if stats.count(ItemStatus::Damaged) > 0 || stats.count(ItemStatus::Error) > 0 {
            Health::Error
        } else if stats.count(ItemStatus::Missing) > 0 {
            Health::Warning
        } else {
            Health::Unknown
        }
    }
}

/// Parameters carried by an operation
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationParams {
    /// Target path for protect/verify/repair
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Paths for a remove batch
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<PathBuf>,
    /// Requested redundancy for protect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redundancy: Option<u8>,
    /// Bypass skip/freshness checks
    #[serde(default)]
    pub force: bool,
}

impl OperationParams {
    /// Parameters for a single-path operation
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }
}

/// File counts parsed from a verification run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyCounts {
    /// Files found intact
    pub verified: u32,
    /// Files present but damaged
    pub damaged: u32,
    /// Files missing
    pub missing: u32,
    /// Whether par2 reported enough recovery data to repair
    pub repairable: bool,
}

/// Per-path failure inside a remove batch
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveFailure {
    /// Path that could not be removed
    pub path: PathBuf,
    /// Why
    pub error: String,
}

/// Structured outcome persisted when an operation reaches a terminal state
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    /// Human-readable summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Error detail (stderr verbatim for tool failures)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Tool exit code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Verification counts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<VerifyCounts>,
    /// Item status written by this operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_status: Option<ItemStatus>,
    /// Paths removed by a remove batch
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<PathBuf>,
    /// Paths a remove batch failed on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<RemoveFailure>,
}

impl OperationResult {
    /// Result carrying only a message
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Result carrying only an error detail
    pub fn error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// A queued or historical operation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Operation id
    pub id: OperationId,
    /// What the operation does
    pub operation_type: OperationType,
    /// Request parameters
    pub params: OperationParams,
    /// Lifecycle status
    pub status: OperationStatus,
    /// Scheduling priority
    pub priority: Priority,
    /// Admission time
    pub created_at: DateTime<Utc>,
    /// When a worker claimed it
    pub started_at: Option<DateTime<Utc>>,
    /// When it reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
    /// Terminal outcome
    pub result: Option<OperationResult>,
    /// PID of the subprocess last spawned for it
    pub pid: Option<u32>,
}

impl Operation {
    /// Target path, if the operation has one
    pub fn path(&self) -> Option<&PathBuf> {
        self.params.path.as_ref()
    }
}

/// Aggregated verification statistics returned to callers
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyStats {
    /// Number of targets verified
    pub total_files: u64,
    /// Targets found intact
    pub verified_files: u64,
    /// Targets damaged, missing or errored
    pub failed_files: u64,
    /// Error messages, one per failed target
    pub errors: Vec<String>,
}

impl VerifyStats {
    /// Aggregate terminal verify operations
    ///
    /// Skipped (fresh) targets count as verified; non-verify operations are ignored.
    pub fn from_operations<'a>(operations: impl IntoIterator<Item = &'a Operation>) -> Self {
        let mut stats = VerifyStats::default();
        for op in operations {
            if op.operation_type != OperationType::Verify || !op.status.is_terminal() {
                continue;
            }
            stats.total_files += 1;
            let item_status = op.result.as_ref().and_then(|r| r.item_status);
            match (op.status, item_status) {
                (OperationStatus::Completed, Some(ItemStatus::Protected))
                | (OperationStatus::Skipped, _) => stats.verified_files += 1,
                _ => {
                    stats.failed_files += 1;
                    let path = op
                        .path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| op.id.to_string());
                    let detail = op
                        .result
                        .as_ref()
                        .and_then(|r| r.error.clone().or_else(|| r.message.clone()))
                        .unwrap_or_else(|| match item_status {
                            Some(status) => status.as_str().to_lowercase(),
                            None => format!("{:?}", op.status).to_lowercase(),
                        });
                    stats.errors.push(format!("{}: {}", path, detail));
                }
            }
        }
        stats
    }
}

/// What to verify
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VerifyTarget {
    /// Every catalog entry (`"all"`)
    All,
    /// A single path
    Path(PathBuf),
    /// Several paths
    Paths(Vec<PathBuf>),
}

impl VerifyTarget {
    /// Interpret a caller-supplied target string; `"all"` selects everything
    pub fn from_arg(raw: &str) -> Self {
        if raw == "all" {
            VerifyTarget::All
        } else {
            VerifyTarget::Path(PathBuf::from(raw))
        }
    }
}

/// Options for protect requests
#[derive(Clone, Debug, Default)]
pub struct ProtectOptions {
    /// Redundancy percentage (config default when None)
    pub redundancy: Option<u8>,
    /// Re-create parity even when the item is unchanged
    pub force: bool,
    /// Queue priority
    pub priority: Priority,
}

/// Options for verify requests
#[derive(Clone, Debug, Default)]
pub struct VerifyOptions {
    /// Ignore the freshness window
    pub force: bool,
    /// Queue priority (None = normal for explicit paths, low for "all")
    pub priority: Option<Priority>,
}

/// Result of an admission request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Admission {
    /// Operations enqueued (PENDING) by the request
    pub queued: Vec<OperationId>,
    /// Operations recorded as SKIPPED without running
    pub skipped: Vec<OperationId>,
}

impl Admission {
    /// Every operation id the request produced
    pub fn all_ids(&self) -> Vec<OperationId> {
        self.queued.iter().chain(&self.skipped).cloned().collect()
    }
}

/// Aggregate result of a remove batch
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoveReport {
    /// Operation that recorded the batch
    pub operation_id: Option<OperationId>,
    /// Paths fully removed
    pub removed: Vec<PathBuf>,
    /// Paths that failed, with reasons
    pub failures: Vec<RemoveFailure>,
}

impl RemoveReport {
    /// Every requested path succeeded
    pub fn is_complete_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Some but not all paths succeeded
    pub fn is_partial(&self) -> bool {
        !self.removed.is_empty() && !self.failures.is_empty()
    }
}

/// Result of a cancel request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CancelOutcome {
    /// The operation
    pub operation_id: OperationId,
    /// OS processes actually terminated
    pub killed_processes: u32,
    /// Status after the request
    pub status: OperationStatus,
    /// Scratch files removed
    pub scratch_files_removed: usize,
}

/// What one reconciliation pass changed
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// PROCESSING operations with no live process, now FAILED
    pub orphaned: Vec<OperationId>,
    /// PROCESSING operations whose process survived and is being watched
    pub adopted: Vec<OperationId>,
    /// Items whose path no longer exists, now MISSING
    pub missing_paths: Vec<PathBuf>,
    /// Items whose parity directory is gone, now ERROR
    pub missing_parity: Vec<PathBuf>,
}

/// A live PAR2 process, correlated to an operation when possible
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunningProcess {
    /// Process id
    pub pid: u32,
    /// Correlated operation, if any
    pub operation_id: Option<OperationId>,
    /// Full command line
    pub command_line: String,
    /// Average CPU usage over the process lifetime, percent of one core
    pub cpu_percent: f32,
    /// Resident memory in bytes
    pub memory_bytes: u64,
    /// Last progress percentage printed by par2
    pub progress: Option<f32>,
    /// Seconds since the process started
    pub elapsed_secs: Option<u64>,
}

/// One row of the status snapshot's active operations
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActiveOperation {
    /// Operation id, when known
    pub operation_id: Option<OperationId>,
    /// Operation type, when correlated
    pub operation_type: Option<OperationType>,
    /// Target path, when correlated
    pub path: Option<PathBuf>,
    /// Queue status, when correlated
    pub status: Option<OperationStatus>,
    /// Priority, when correlated
    pub priority: Option<Priority>,
    /// When the operation was claimed
    pub started_at: Option<DateTime<Utc>>,
    /// When the operation was admitted
    pub created_at: Option<DateTime<Utc>>,
    /// Live process backing the operation
    pub process: Option<RunningProcess>,
}

/// Host resource usage
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemResources {
    /// Logical CPUs
    pub cpu_count: usize,
    /// 1, 5 and 15 minute load averages
    pub load_average: Option<[f64; 3]>,
    /// Total memory in bytes
    pub memory_total_bytes: Option<u64>,
    /// Available memory in bytes
    pub memory_available_bytes: Option<u64>,
    /// Free bytes on the database volume
    pub disk_free_bytes: Option<u64>,
}

/// Point-in-time status for external consumers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Catalog aggregates
    pub stats: CatalogStats,
    /// Health classification of `stats`
    pub health: Health,
    /// Running and queued operations plus uncorrelated par2 processes
    pub active_operations: Vec<ActiveOperation>,
    /// Recently finished operations, newest first
    pub recent_activity: Vec<Operation>,
    /// Host resources
    pub system_resources: SystemResources,
    /// Running count of live processes that could not be matched to an operation
    pub correlation_failures: u64,
    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,
}

/// Event emitted during the operation lifecycle
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Operation admitted to the queue
    OperationQueued {
        /// Operation id
        id: OperationId,
        /// Operation type
        operation_type: OperationType,
        /// Target path
        path: Option<PathBuf>,
    },

    /// A worker claimed the operation
    OperationStarted {
        /// Operation id
        id: OperationId,
        /// Operation type
        operation_type: OperationType,
    },

    /// Operation finished successfully
    OperationCompleted {
        /// Operation id
        id: OperationId,
        /// Outcome
        result: OperationResult,
    },

    /// Operation failed
    OperationFailed {
        /// Operation id
        id: OperationId,
        /// Error detail
        error: String,
    },

    /// Operation cancelled
    OperationCancelled {
        /// Operation id
        id: OperationId,
        /// Processes terminated
        killed_processes: u32,
    },

    /// Operation bypassed
    OperationSkipped {
        /// Operation id
        id: OperationId,
        /// Why
        reason: String,
    },

    /// Parity created or refreshed for a path
    ItemProtected {
        /// Protected path
        path: PathBuf,
        /// Redundancy used
        redundancy: u8,
    },

    /// A catalog item's status changed
    ItemStatusChanged {
        /// Item path
        path: PathBuf,
        /// Previous status
        from: ItemStatus,
        /// New status
        to: ItemStatus,
    },

    /// A path was removed from protection
    ItemRemoved {
        /// Item path
        path: PathBuf,
    },

    /// Manager shutting down
    Shutdown,
}

impl Event {
    /// Operation this event concerns, if any
    pub fn operation_id(&self) -> Option<&OperationId> {
        match self {
            Event::OperationQueued { id, .. }
            | Event::OperationStarted { id, .. }
            | Event::OperationCompleted { id, .. }
            | Event::OperationFailed { id, .. }
            | Event::OperationCancelled { id, .. }
            | Event::OperationSkipped { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Whether this event marks an operation as terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::OperationCompleted { .. }
                | Event::OperationFailed { .. }
                | Event::OperationCancelled { .. }
                | Event::OperationSkipped { .. }
        )
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_pass_validation_and_differ() {
        let a = OperationId::generate();
        let b = OperationId::generate();
        assert!(OperationId::parse(a.as_str()).is_ok());
        assert_ne!(a, b);
        assert!(a.as_str().starts_with(OPERATION_ID_PREFIX));
    }

    #[test]
    fn malformed_ids_are_rejected() {
        for raw in [
            "op_bad-format",
            "op_",
            "OP_abc",
            "op_ABC",
            "op_12; kill -9 1",
            "12ab",
            "",
        ] {
            match OperationId::parse(raw) {
                Err(Error::Validation { field, .. }) => {
                    assert_eq!(field.as_deref(), Some("operation_id"), "{}", raw)
                }
                other => panic!("{:?} should be rejected, got {:?}", raw, other),
            }
        }
    }

    #[test]
    fn operation_id_deserialization_validates() {
        let ok: OperationId = serde_json::from_str("\"op_00ff\"").unwrap();
        assert_eq!(ok.as_str(), "op_00ff");
        assert!(serde_json::from_str::<OperationId>("\"op_zz\"").is_err());
    }

    #[test]
    fn status_codes_round_trip() {
        for status in [
            OperationStatus::Pending,
            OperationStatus::Processing,
            OperationStatus::Completed,
            OperationStatus::Failed,
            OperationStatus::Cancelled,
            OperationStatus::Skipped,
        ] {
            assert_eq!(OperationStatus::from_i32(status.to_i32()), status);
        }
        for status in [
            ItemStatus::Protected,
            ItemStatus::Damaged,
            ItemStatus::Missing,
            ItemStatus::Error,
            ItemStatus::Unknown,
        ] {
            assert_eq!(ItemStatus::from_i32(status.to_i32()), status);
        }
        assert_eq!(Priority::from_i32(-5), Priority::Low);
        assert_eq!(Priority::from_i32(9), Priority::High);
    }

    #[test]
    fn only_pending_and_processing_are_non_terminal() {
        assert!(!OperationStatus::Pending.is_terminal());
        assert!(!OperationStatus::Processing.is_terminal());
        assert!(OperationStatus::Skipped.is_terminal());
        assert!(OperationStatus::Cancelled.is_terminal());
    }

    fn stats_with(counts: &[(ItemStatus, u64)]) -> CatalogStats {
        let mut stats = CatalogStats::default();
        for (status, n) in counts {
            stats.total_items += n;
            stats
                .counts_by_status
                .insert(status.as_str().to_string(), *n);
        }
        stats
    }

    #[test]
    fn health_classification() {
        assert_eq!(Health::classify(&stats_with(&[(ItemStatus::Protected, 3)])), Health::Good);
        assert_eq!(
            Health::classify(&stats_with(&[
                (ItemStatus::Protected, 3),
                (ItemStatus::Damaged, 1)
            ])),
            Health::Error
        );
        assert_eq!(
            Health::classify(&stats_with(&[
                (ItemStatus::Missing, 1),
                (ItemStatus::Error, 1)
            ])),
            Health::Error
        );
        assert_eq!(
            Health::classify(&stats_with(&[
                (ItemStatus::Protected, 2),
                (ItemStatus::Missing, 1)
            ])),
            Health::Warning
        );
        assert_eq!(
            Health::classify(&stats_with(&[
                (ItemStatus::Protected, 2),
                (ItemStatus::Unknown, 1)
            ])),
            Health::Unknown
        );
        assert_eq!(Health::classify(&CatalogStats::default()), Health::Unknown);
    }

    fn verify_op(status: OperationStatus, item_status: Option<ItemStatus>) -> Operation {
        Operation {
            id: OperationId::generate(),
            operation_type: OperationType::Verify,
            params: OperationParams::for_path("/mnt/user/photos"),
            status,
            priority: Priority::Normal,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: Some(OperationResult {
                item_status,
                ..Default::default()
            }),
            pid: None,
        }
    }

    #[test]
    fn verify_stats_count_targets() {
        let ops = vec![
            verify_op(OperationStatus::Completed, Some(ItemStatus::Protected)),
            verify_op(OperationStatus::Completed, Some(ItemStatus::Damaged)),
            verify_op(OperationStatus::Skipped, None),
            verify_op(OperationStatus::Failed, None),
        ];
        let stats = VerifyStats::from_operations(&ops);
        assert_eq!(stats.total_files, 4);
        assert_eq!(stats.verified_files, 2);
        assert_eq!(stats.failed_files, 2);
        assert_eq!(stats.errors.len(), 2);
        assert!(stats.errors[0].contains("damaged"));
    }

    #[test]
    fn verify_target_all_keyword() {
        assert_eq!(VerifyTarget::from_arg("all"), VerifyTarget::All);
        assert_eq!(
            VerifyTarget::from_arg("/mnt/user/a"),
            VerifyTarget::Path(PathBuf::from("/mnt/user/a"))
        );
    }

    #[test]
    fn event_serialization_uses_snake_case_tags() {
        let event = Event::ItemRemoved {
            path: PathBuf::from("/mnt/user/a"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "item_removed");
        assert!(!event.is_terminal());
        assert!(Event::Shutdown.operation_id().is_none());
    }
}
