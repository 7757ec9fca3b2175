//! Error types for par2-protect
//!
//! This module provides error handling for the library, including:
//! - Domain-specific error kinds (validation, execution, consistency, database)
//! - HTTP status code mapping for the embedding API layer
//! - Structured error responses with machine-readable error codes
//! - Context information (operation id, path, exit code, etc.)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for par2-protect operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for par2-protect
///
/// Each variant includes contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad input from the caller (missing path, malformed operation id, ...)
    ///
    /// Requests failing validation are never enqueued.
    #[error("validation error: {message}")]
    Validation {
        /// Human-readable description of what was wrong
        message: String,
        /// The request field that failed validation (e.g., "operation_id")
        field: Option<String>,
    },

    /// The PAR2 subprocess failed, timed out or was cancelled
    #[error("execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// Resource limits prevent the request from running right now
    #[error("resource error: {0}")]
    Resource(String),

    /// Database, filesystem and process table disagree
    #[error("consistency error: {0}")]
    Consistency(#[from] ConsistencyError),

    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "max_concurrent_operations")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Protected item or operation not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Shutdown in progress - not accepting new operations
    #[error("shutdown in progress: not accepting new operations")]
    ShuttingDown,

    /// External tool could not be located or started
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// Operation not supported (missing binary, unsupported platform, ...)
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a validation error on a named request field
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Database is locked by another writer
    #[error("database busy: {0}")]
    Busy(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),

    /// Constraint violation (e.g., duplicate key)
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
}

impl DatabaseError {
    /// Classify a sqlx error raised while running `context`
    ///
    /// SQLite lock contention (`SQLITE_BUSY` = 5, `SQLITE_LOCKED` = 6, and their
    /// extended codes) maps to [`DatabaseError::Busy`] so callers can retry it.
    pub(crate) fn from_sqlx(context: &str, e: sqlx::Error) -> Self {
        let busy = match &e {
            sqlx::Error::Database(db) => db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .is_some_and(|code| matches!(code & 0xff, 5 | 6)),
            sqlx::Error::PoolTimedOut => true,
            _ => false,
        };
        let message = format!("{}: {}", context, e);
        if busy {
            DatabaseError::Busy(message)
        } else {
            DatabaseError::QueryFailed(message)
        }
    }
}

/// Subprocess execution failures
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The tool exited with a nonzero status
    #[error("par2 exited with code {exit_code:?}: {stderr}")]
    NonZeroExit {
        /// Exit code, `None` when terminated by a signal
        exit_code: Option<i32>,
        /// Captured stderr, verbatim
        stderr: String,
    },

    /// The run exceeded the configured maximum execution time
    #[error("par2 exceeded the maximum execution time of {after_secs}s")]
    TimedOut {
        /// Configured limit in seconds
        after_secs: u64,
    },

    /// The run was cancelled by request
    #[error("par2 run was cancelled")]
    Cancelled,

    /// The process could not be spawned
    #[error("failed to start {program}: {reason}")]
    SpawnFailed {
        /// Program that failed to start
        program: String,
        /// OS error text
        reason: String,
    },

    /// The tool reported success but no parity files were written
    #[error("par2 reported success but no parity files exist in {parity_dir}")]
    ArtifactsMissing {
        /// Parity directory that was inspected
        parity_dir: PathBuf,
    },
}

/// Disagreements between the catalog, the queue, the filesystem and the process table
#[derive(Debug, Error)]
pub enum ConsistencyError {
    /// An operation was left PROCESSING with no live subprocess
    #[error("operation {id} orphaned by restart")]
    OrphanedOperation {
        /// The orphaned operation id
        id: String,
    },

    /// A catalog entry points at a parity directory that does not exist
    #[error("parity directory {parity_location} for {path} is missing")]
    ParityDirectoryMissing {
        /// Protected path
        path: PathBuf,
        /// Recorded parity location
        parity_location: PathBuf,
    },

    /// A parity location failed the `/.parity` suffix guard
    #[error("refusing to delete {path}: parity locations must end in /.parity")]
    UnsafeParityLocation {
        /// The offending location
        path: PathBuf,
    },

    /// Two catalog entries would address the same parity set
    #[error("parity set for {path} is already used by {owner}")]
    ParitySetConflict {
        /// Path being protected or removed
        path: PathBuf,
        /// Catalog entry owning the parity set
        owner: PathBuf,
    },
}

/// API error response format
///
/// Returned by the embedding layer when an operation fails.
///
/// # Example JSON Response
///
/// ```json
/// {
///   "error": {
///     "code": "validation_error",
///     "message": "validation error: invalid operation id format",
///     "details": {
///       "field": "operation_id"
///     }
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// The error details
    pub error: ErrorDetail,
}

/// Detailed error information for API responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Machine-readable error code (e.g., "not_found", "validation_error")
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Optional additional context about the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error with code and message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    /// Create an API error with additional details
    pub fn with_details(
        code: impl Into<String>,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: Some(details),
            },
        }
    }

    /// Create a "not found" error
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new("not_found", format!("{} not found", resource.into()))
    }

    /// Create a "validation error" error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new("validation_error", message)
    }

    /// Create an "internal server error"
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal_error", message)
    }
}

/// Convert errors to HTTP status codes for API responses
pub trait ToHttpStatus {
    /// Get the HTTP status code for this error
    fn status_code(&self) -> u16;

    /// Get the machine-readable error code
    fn error_code(&self) -> &str;
}

impl ToHttpStatus for Error {
    fn status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - Client error (invalid input)
            Error::Validation { .. } => 400,
            Error::Config { .. } => 400,

            // 404 Not Found
            Error::NotFound(_) => 404,
            Error::Database(DatabaseError::NotFound(_)) => 404,

            // 409 Conflict - disk and catalog disagree
            Error::Consistency(_) => 409,

            // 422 Unprocessable Entity - the tool ran and refused the work
            Error::Execution(ExecutionError::NonZeroExit { .. }) => 422,
            Error::Execution(ExecutionError::ArtifactsMissing { .. }) => 422,
            Error::Execution(ExecutionError::Cancelled) => 409,
            Error::Execution(ExecutionError::TimedOut { .. }) => 504,
            Error::Execution(ExecutionError::SpawnFailed { .. }) => 503,

            // 429 Too Many Requests
            Error::Resource(_) => 429,

            // 500 Internal Server Error - Server-side issues
            Error::Database(_) => 500,
            Error::Sqlx(_) => 500,
            Error::Io(_) => 500,
            Error::Serialization(_) => 500,
            Error::Other(_) => 500,

            // 503 Service Unavailable
            Error::ShuttingDown => 503,
            Error::ExternalTool(_) => 503,

            // 501 Not Implemented - Feature not supported
            Error::NotSupported(_) => 501,
        }
    }

    fn error_code(&self) -> &str {
        match self {
            Error::Validation { .. } => "validation_error",
            Error::Execution(e) => match e {
                ExecutionError::NonZeroExit { .. } => "execution_failed",
                ExecutionError::TimedOut { .. } => "execution_timeout",
                ExecutionError::Cancelled => "execution_cancelled",
                ExecutionError::SpawnFailed { .. } => "spawn_failed",
                ExecutionError::ArtifactsMissing { .. } => "artifacts_missing",
            },
            Error::Resource(_) => "resource_error",
            Error::Consistency(e) => match e {
                ConsistencyError::OrphanedOperation { .. } => "orphaned_operation",
                ConsistencyError::ParityDirectoryMissing { .. } => "parity_directory_missing",
                ConsistencyError::UnsafeParityLocation { .. } => "unsafe_parity_location",
                ConsistencyError::ParitySetConflict { .. } => "parity_set_conflict",
            },
            Error::Config { .. } => "config_error",
            Error::Database(DatabaseError::NotFound(_)) => "not_found",
            Error::Database(_) => "database_error",
            Error::Sqlx(_) => "database_error",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::NotFound(_) => "not_found",
            Error::ShuttingDown => "shutting_down",
            Error::ExternalTool(_) => "external_tool_error",
            Error::NotSupported(_) => "not_supported",
            Error::Other(_) => "internal_error",
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let code = error.error_code().to_string();
        let message = error.to_string();

        let details = match &error {
            Error::Validation {
                field: Some(field), ..
            } => Some(serde_json::json!({
                "field": field,
            })),
            Error::Config { key: Some(key), .. } => Some(serde_json::json!({
                "key": key,
            })),
            Error::Execution(ExecutionError::NonZeroExit { exit_code, stderr }) => {
                Some(serde_json::json!({
                    "exit_code": exit_code,
                    "stderr": stderr,
                }))
            }
            Error::Execution(ExecutionError::TimedOut { after_secs }) => Some(serde_json::json!({
                "timeout_secs": after_secs,
            })),
            Error::Execution(ExecutionError::ArtifactsMissing { parity_dir }) => {
                Some(serde_json::json!({
                    "parity_dir": parity_dir,
                }))
            }
            Error::Consistency(ConsistencyError::OrphanedOperation { id }) => {
                Some(serde_json::json!({
                    "operation_id": id,
                }))
            }
            Error::Consistency(ConsistencyError::ParityDirectoryMissing {
                path,
                parity_location,
            }) => Some(serde_json::json!({
                "path": path,
                "parity_location": parity_location,
            })),
            Error::Consistency(ConsistencyError::UnsafeParityLocation { path }) => {
                Some(serde_json::json!({
                    "path": path,
                }))
            }
            Error::Consistency(ConsistencyError::ParitySetConflict { path, owner }) => {
                Some(serde_json::json!({
                    "path": path,
                    "owner": owner,
                }))
            }
            _ => None,
        };

        ApiError {
            error: ErrorDetail {
                code,
                message,
                details,
            },
        }
    }
}
