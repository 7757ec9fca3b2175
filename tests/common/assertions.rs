//! Custom test assertions for E2E tests

use std::path::Path;
use std::time::Duration;
use par2_protect::types::{ProtectOptions, VerifyOptions, VerifyTarget};
use par2_protect::{ItemStatus, Operation, OperationStatus, ProtectionManager};

/// Generous bound for a real par2 run over a small dataset
pub const PAR2_TIMEOUT: Duration = Duration::from_secs(120);

/// Protect `path` and wait for the operation to finish
pub async fn protect_and_wait(manager: &ProtectionManager, path: &Path, redundancy: u8) -> Operation {
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
    manager
        .wait_for_operations(&admission.all_ids(), PAR2_TIMEOUT)
        .await
        .unwrap()
        .remove(0)
}

/// Verify `path` (ignoring freshness) and wait for the operation to finish
pub async fn verify_and_wait(manager: &ProtectionManager, path: &Path) -> Operation {
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
    manager
        .wait_for_operations(&admission.all_ids(), PAR2_TIMEOUT)
        .await
        .unwrap()
        .remove(0)
}

/// Assert the operation completed, printing its result otherwise
pub fn assert_completed(op: &Operation) {
    assert_eq!(
        op.status,
        OperationStatus::Completed,
        "operation {} ended {:?}: {:?}",
        op.id,
        op.status,
        op.result
    );
}

/// Assert the catalog holds `path` with `status`
pub async fn assert_item_status(manager: &ProtectionManager, path: &Path, status: ItemStatus) {
    let item = manager
        .db
        .get_item(path)
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("{} is not in the catalog", path.display()));
    assert_eq!(item.last_status, status, "last_error: {:?}", item.last_error);
}
