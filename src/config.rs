//! Configuration types for par2-protect

use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

use crate::error::{Error, Result};

/// Subprocess resource settings handed to the resource limiter
///
/// Groups CPU, memory, thread and I/O scheduling knobs for PAR2 runs.
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Number of threads for par2 (`-t`); omitted unless positive
    #[serde(default)]
    pub threads: Option<i64>,

    /// Memory cap in MiB for par2 (`-m`); omitted unless positive
    #[serde(default)]
    pub memory_limit_mb: Option<i64>,

    /// Parallel file hashing (`-T`): `true`, `false` or a file count
    #[serde(default)]
    pub parallel_hashing: ParallelHashing,

    /// I/O scheduling priority: "high", "normal" or "low" (default: "normal")
    #[serde(default = "default_io_priority")]
    pub io_priority: String,

    /// CPU niceness applied through `nice -n` (None = inherit)
    #[serde(default)]
    pub cpu_nice: Option<i32>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            threads: None,
            memory_limit_mb: None,
            parallel_hashing: ParallelHashing::default(),
            io_priority: default_io_priority(),
            cpu_nice: None,
        }
    }
}

/// Parallel-hashing setting as it appears in settings files
///
/// Accepts either a boolean (`true` = let par2 pick the parallelism) or an
/// integer file count. Zero, negative and `false` all disable the flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParallelHashing {
    /// Boolean toggle
    Flag(bool),
    /// Explicit number of files hashed in parallel
    Count(i64),
}

impl Default for ParallelHashing {
    fn default() -> Self {
        ParallelHashing::Flag(false)
    }
}

/// Operation queue and worker pool settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum operations in PROCESSING at once; also the worker pool size (default: 2)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_operations: usize,

    /// How often idle workers re-check the queue (default: 1 second)
    #[serde(default = "default_poll_interval", with = "duration_serde")]
    pub poll_interval: Duration,

    /// How long terminal operations stay in the active view (default: 24 hours)
    #[serde(default = "default_retention", with = "duration_serde")]
    pub retention: Duration,

    /// Number of finished operations reported as recent activity (default: 20)
    #[serde(default = "default_recent_activity_limit")]
    pub recent_activity_limit: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_operations: default_max_concurrent(),
            poll_interval: default_poll_interval(),
            retention: default_retention(),
            recent_activity_limit: default_recent_activity_limit(),
        }
    }
}

/// External tool paths and execution policy
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Path to par2 executable (auto-detected if None)
    #[serde(default)]
    pub par2_path: Option<PathBuf>,

    /// Whether to search PATH for external binaries if explicit paths not set (default: true)
    #[serde(default = "default_true")]
    pub search_path: bool,

    /// Path to ionice (default: "ionice", resolved through PATH)
    #[serde(default = "default_ionice_path")]
    pub ionice_path: PathBuf,

    /// Path to nice (default: "nice", resolved through PATH)
    #[serde(default = "default_nice_path")]
    pub nice_path: PathBuf,

    /// Upper bound on a single par2 invocation (None = unbounded)
    #[serde(default, with = "optional_duration_serde")]
    pub max_execution_time: Option<Duration>,

    /// Scratch directory for per-operation output logs (default: "/tmp/par2protect")
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            par2_path: None,
            search_path: true,
            ionice_path: default_ionice_path(),
            nice_path: default_nice_path(),
            max_execution_time: None,
            scratch_dir: default_scratch_dir(),
        }
    }
}

/// Protection defaults
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProtectionConfig {
    /// Redundancy percentage used when a request does not name one (default: 10)
    #[serde(default = "default_redundancy")]
    pub default_redundancy: u8,

    /// Skip re-protecting unchanged items at the same redundancy (default: true)
    #[serde(default = "default_true")]
    pub skip_unchanged: bool,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            default_redundancy: default_redundancy(),
            skip_unchanged: true,
        }
    }
}

/// Verification policy
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Items verified more recently than this are skipped unless forced (default: 24 hours)
    #[serde(default = "default_freshness", with = "duration_serde")]
    pub freshness: Duration,

    /// Queue a repair automatically when verification finds repairable damage (default: false)
    #[serde(default)]
    pub auto_repair: bool,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            freshness: default_freshness(),
            auto_repair: false,
        }
    }
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Database path (default: "./par2protect.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Retry configuration for transient storage failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Main configuration for [`ProtectionManager`](crate::ProtectionManager)
///
/// Fields are organized into logical sub-configs:
/// - [`resources`](ResourceConfig) - threads, memory, hashing, I/O priority
/// - [`queue`](QueueConfig) - concurrency ceiling, polling, retention
/// - [`tools`](ToolsConfig) - binary paths, execution time limit, scratch dir
/// - [`protection`](ProtectionConfig) and [`verify`](VerifyConfig) - policy
///
/// The flattened sub-configs keep the settings file a single flat object;
/// `persistence` and `retry` stay nested.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Subprocess resource limits
    #[serde(flatten)]
    pub resources: ResourceConfig,

    /// Queue and worker pool settings
    #[serde(flatten)]
    pub queue: QueueConfig,

    /// External tool settings
    #[serde(flatten)]
    pub tools: ToolsConfig,

    /// Protection defaults
    #[serde(flatten)]
    pub protection: ProtectionConfig,

    /// Verification policy
    #[serde(flatten)]
    pub verify: VerifyConfig,

    /// Data storage
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Storage retry/backoff policy
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Config {
    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.queue.max_concurrent_operations == 0 {
            return Err(Error::Config {
                message: "max_concurrent_operations must be at least 1".to_string(),
                key: Some("max_concurrent_operations".to_string()),
            });
        }
        if !(1..=100).contains(&self.protection.default_redundancy) {
            return Err(Error::Config {
                message: format!(
                    "default_redundancy must be between 1 and 100, got {}",
                    self.protection.default_redundancy
                ),
                key: Some("default_redundancy".to_string()),
            });
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::Config {
                message: "backoff_multiplier must be >= 1.0".to_string(),
                key: Some("retry.backoff_multiplier".to_string()),
            });
        }
        if let Some(limit) = self.tools.max_execution_time
            && limit.is_zero()
        {
            return Err(Error::Config {
                message: "max_execution_time must be positive when set".to_string(),
                key: Some("max_execution_time".to_string()),
            });
        }
        Ok(())
    }

    /// Load configuration from a JSON settings file
    pub fn from_json_file(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("failed to read {}: {}", path.display(), e),
            key: None,
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|e| Error::Config {
            message: format!("failed to parse {}: {}", path.display(), e),
            key: None,
        })?;
        config.validate()?;
        Ok(config)
    }
}

fn default_io_priority() -> String {
    "normal".to_string()
}

fn default_max_concurrent() -> usize {
    2
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_retention() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_recent_activity_limit() -> u32 {
    20
}

fn default_true() -> bool {
    true
}

fn default_ionice_path() -> PathBuf {
    PathBuf::from("ionice")
}

fn default_nice_path() -> PathBuf {
    PathBuf::from("nice")
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("/tmp/par2protect")
}

fn default_redundancy() -> u8 {
    10
}

fn default_freshness() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./par2protect.db")
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

// Duration serialization helper (seconds as integer)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Optional Duration serialization helper
mod optional_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
