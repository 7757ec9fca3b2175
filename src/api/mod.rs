//! JSON-shaped request/response facade
//!
//! Thin wrappers over [`ProtectionManager`] for an outer HTTP or UI layer.
//! Each function turns a manager call into a response body that always
//! carries `success`; errors become [`Failure`] fields instead of `Err`.
//! None of them block on an operation finishing except [`verify_and_wait`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ProtectionManager;
use crate::error::Error;
use crate::types::{ItemFilter, ProtectOptions, VerifyOptions, VerifyStats, VerifyTarget};

pub mod responses;

pub use responses::{
    CancelResponse, Failure, ListResponse, ProtectResponse, RemoveResponse, StatusResponse,
    VerifyResponse,
};

fn failure(action: &str, error: Error) -> Failure {
    tracing::debug!(action, error = %error, "request failed");
    Failure::from(error)
}

/// `protect(path, redundancy?)`
pub async fn protect(
    manager: &ProtectionManager,
    path: &Path,
    redundancy: Option<u8>,
) -> ProtectResponse {
    let options = ProtectOptions {
        redundancy,
        ..Default::default()
    };
    match manager.protect(path, options).await {
        Ok(admission) => {
            let skipped = admission.queued.is_empty();
            ProtectResponse {
                success: true,
                operation_id: admission.all_ids().into_iter().next(),
                skipped,
                failure: None,
            }
        }
        Err(e) => ProtectResponse {
            success: false,
            operation_id: None,
            skipped: false,
            failure: Some(failure("protect", e)),
        },
    }
}

/// `verify(target, force?)`, returning the queued tasks immediately
pub async fn verify(manager: &ProtectionManager, target: VerifyTarget, force: bool) -> VerifyResponse {
    let options = VerifyOptions {
        force,
        priority: None,
    };
    match manager.verify(target, options).await {
        Ok(admission) => VerifyResponse {
            success: true,
            stats: None,
            tasks: Some(admission.all_ids()),
            failure: None,
        },
        Err(e) => VerifyResponse {
            success: false,
            stats: None,
            tasks: None,
            failure: Some(failure("verify", e)),
        },
    }
}

/// `verify(target, force?)`, waiting up to `timeout` for aggregate stats
pub async fn verify_and_wait(
    manager: &ProtectionManager,
    target: VerifyTarget,
    force: bool,
    timeout: Duration,
) -> VerifyResponse {
    let options = VerifyOptions {
        force,
        priority: None,
    };
    let admission = match manager.verify(target, options).await {
        Ok(admission) => admission,
        Err(e) => {
            return VerifyResponse {
                success: false,
                stats: None,
                tasks: None,
                failure: Some(failure("verify", e)),
            };
        }
    };

    let tasks = admission.all_ids();
    match manager.wait_for_operations(&tasks, timeout).await {
        Ok(operations) => VerifyResponse {
            success: true,
            stats: Some(VerifyStats::from_operations(&operations)),
            tasks: Some(tasks),
            failure: None,
        },
        // Still running; the caller can poll the tasks
        Err(e) => VerifyResponse {
            success: false,
            stats: None,
            tasks: Some(tasks),
            failure: Some(failure("verify", e)),
        },
    }
}

/// `remove(paths)`
pub async fn remove(manager: &ProtectionManager, paths: &[PathBuf]) -> RemoveResponse {
    match manager.remove(paths).await {
        Ok(report) => {
            let message = if report.is_complete_success() {
                format!("Removed protection from {} item(s)", report.removed.len())
            } else if report.is_partial() {
                format!(
                    "Removed protection from {} of {} item(s)",
                    report.removed.len(),
                    paths.len()
                )
            } else {
                "No items were removed".to_string()
            };
            let errors = (!report.failures.is_empty()).then(|| {
                report
                    .failures
                    .iter()
                    .map(|f| format!("{}: {}", f.path.display(), f.error))
                    .collect()
            });
            RemoveResponse {
                success: report.is_complete_success(),
                partial: report.is_partial(),
                message,
                removed: report.removed,
                errors,
                failure: None,
            }
        }
        Err(e) => {
            let failure = failure("remove", e);
            RemoveResponse {
                success: false,
                partial: false,
                message: failure.error.clone(),
                removed: Vec::new(),
                errors: None,
                failure: Some(failure),
            }
        }
    }
}

/// `status()`
pub async fn status(manager: &ProtectionManager) -> StatusResponse {
    match manager.status().await {
        Ok(snapshot) => StatusResponse {
            success: true,
            data: Some(snapshot),
            failure: None,
        },
        Err(e) => StatusResponse {
            success: false,
            data: None,
            failure: Some(failure("status", e)),
        },
    }
}

/// `cancel(operation_id)`
pub async fn cancel(manager: &ProtectionManager, operation_id: &str) -> CancelResponse {
    match manager.cancel(operation_id).await {
        Ok(outcome) => CancelResponse {
            success: true,
            killed_processes: outcome.killed_processes,
            status: Some(outcome.status),
            failure: None,
        },
        Err(e) => CancelResponse {
            success: false,
            killed_processes: 0,
            status: None,
            failure: Some(failure("cancel", e)),
        },
    }
}

/// `list()`
pub async fn list(manager: &ProtectionManager, filter: &ItemFilter) -> ListResponse {
    match manager.list(filter).await {
        Ok(items) => ListResponse {
            success: true,
            items,
            failure: None,
        },
        Err(e) => ListResponse {
            success: false,
            items: Vec::new(),
            failure: Some(failure("list", e)),
        },
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
