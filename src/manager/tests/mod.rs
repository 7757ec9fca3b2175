use super::test_helpers::{FakeParityHandler, create_test_manager, populate_dir, test_config};
use super::*;
use crate::types::{
    ItemFilter, ItemStatus, Operation, OperationStatus, OperationType, ProtectOptions,
    VerifyOptions, VerifyTarget,
};
use std::path::Path;
use std::time::Duration;

mod cancel;
mod protect;
mod recovery;
mod remove;

const WAIT: Duration = Duration::from_secs(10);

/// Wait until every id is terminal, panicking after [`WAIT`]
async fn wait_all(manager: &ProtectionManager, ids: &[OperationId]) -> Vec<Operation> {
    manager.wait_for_operations(ids, WAIT).await.unwrap()
}

/// Protect `path` with defaults and wait for the outcome
async fn protect_and_wait(manager: &ProtectionManager, path: &Path, redundancy: u8) -> Operation {
    let admission = manager
        .protect(
            path,
            ProtectOptions {
                redundancy: Some(redundancy),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    wait_all(manager, &admission.all_ids()).await.remove(0)
}

/// Verify one path, ignoring freshness, and wait for the outcome
async fn verify_and_wait(manager: &ProtectionManager, path: &Path) -> Operation {
    let admission = manager
        .verify(
            VerifyTarget::Path(path.to_path_buf()),
            VerifyOptions {
                force: true,
                priority: None,
            },
        )
        .await
        .unwrap();
    wait_all(manager, &admission.all_ids()).await.remove(0)
}

fn fake() -> Arc<FakeParityHandler> {
    Arc::new(FakeParityHandler::new())
}
