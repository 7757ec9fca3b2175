//! JSON response bodies returned by the facade
//!
//! Every body carries `success`; failures add a human-readable `error`, the
//! machine-readable `code`, the HTTP status an outer layer should use, and an
//! optional structured `context`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{ApiError, Error, ToHttpStatus};
use crate::types::{OperationId, OperationStatus, ProtectedItem, StatusSnapshot, VerifyStats};

/// Error fields flattened into a failed response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    /// Human-readable message
    pub error: String,
    /// Machine-readable code (e.g. "validation_error")
    pub code: String,
    /// HTTP status an outer layer should answer with
    pub http_status: u16,
    /// Structured diagnostics
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl From<Error> for Failure {
    fn from(error: Error) -> Self {
        let http_status = error.status_code();
        let api: ApiError = error.into();
        Self {
            error: api.error.message,
            code: api.error.code,
            http_status,
            context: api.error.details,
        }
    }
}

/// Response to `protect`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectResponse {
    /// Whether the request was admitted
    pub success: bool,
    /// Operation recording the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<OperationId>,
    /// The item was unchanged and no parity will be created
    #[serde(default)]
    pub skipped: bool,
    /// Set when `success` is false
    #[serde(flatten)]
    pub failure: Option<Failure>,
}

/// Response to `verify`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyResponse {
    /// Whether the request was admitted; damage found is reported in `stats`
    pub success: bool,
    /// Aggregate results, present when the caller waited for completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<VerifyStats>,
    /// Operations queued or skipped for the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<OperationId>>,
    /// Set when the request itself failed
    #[serde(flatten)]
    pub failure: Option<Failure>,
}

/// Response to `remove`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveResponse {
    /// Every requested path was removed
    pub success: bool,
    /// Some paths were removed and some were not
    #[serde(default)]
    pub partial: bool,
    /// Summary line
    pub message: String,
    /// Paths removed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<PathBuf>,
    /// One line per failed path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
    /// Set when the request was rejected as a whole
    #[serde(flatten)]
    pub failure: Option<Failure>,
}

/// Response to `status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Whether the snapshot could be taken
    pub success: bool,
    /// The snapshot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<StatusSnapshot>,
    /// Set when `success` is false
    #[serde(flatten)]
    pub failure: Option<Failure>,
}

/// Response to `cancel`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelResponse {
    /// Whether the operation ended up cancelled (or was already finished)
    pub success: bool,
    /// OS processes terminated
    pub killed_processes: u32,
    /// Operation status after the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<OperationStatus>,
    /// Set when `success` is false
    #[serde(flatten)]
    pub failure: Option<Failure>,
}

/// Response to `list`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListResponse {
    /// Whether the catalog could be read
    pub success: bool,
    /// Catalog entries
    pub items: Vec<ProtectedItem>,
    /// Set when `success` is false
    #[serde(flatten)]
    pub failure: Option<Failure>,
}
