//! Verify and repair: admission and execution

use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::{ConsistencyError, Error, ExecutionError, Result};
use crate::parity::{ExecutionContext, ParityLayout};
use crate::types::{
    Admission, Event, ItemFilter, ItemStatus, Operation, OperationId, OperationParams,
    OperationResult, OperationStatus, OperationType, Priority, ProtectedItem, VerifyOptions,
    VerifyTarget,
};

use super::ProtectionManager;
use super::protect::normalize_target;
use super::worker::{Disposition, operation_path};

impl ProtectionManager {
    /// Queue verification of one path, several paths, or the whole catalog
    ///
    /// Each target becomes its own VERIFY operation, so one failing target
    /// never blocks status updates for the others. Targets verified within
    /// the freshness window are recorded as SKIPPED unless `options.force`.
    ///
    /// # Errors
    ///
    /// Every explicit path must be in the catalog; otherwise nothing is
    /// enqueued and [`Error::NotFound`] names the first unknown path.
    pub async fn verify(&self, target: VerifyTarget, options: VerifyOptions) -> Result<Admission> {
        self.ensure_accepting()?;

        let (items, default_priority) = match target {
            VerifyTarget::All => (
                self.db.list_items(&ItemFilter::default()).await?,
                Priority::Low,
            ),
            VerifyTarget::Path(path) => (self.catalog_items(&[path]).await?, Priority::Normal),
            VerifyTarget::Paths(paths) => (self.catalog_items(&paths).await?, Priority::Normal),
        };
        let priority = options.priority.unwrap_or(default_priority);

        let mut admission = Admission {
            queued: Vec::new(),
            skipped: Vec::new(),
        };
        for item in items {
            let params = OperationParams {
                path: Some(item.path.clone()),
                force: options.force,
                ..Default::default()
            };

            if !options.force
                && let Some(reason) = self.fresh_reason(&item)
            {
                let op = self
                    .db
                    .record_skipped_operation(OperationType::Verify, &params, priority, &reason)
                    .await?;
                tracing::debug!(operation_id = %op.id, path = %item.path.display(), "verify skipped");
                self.emit_event(Event::OperationSkipped {
                    id: op.id.clone(),
                    reason,
                });
                admission.skipped.push(op.id);
                continue;
            }

            if let Some(existing) = self
                .pending_operation(&item.path, OperationType::Verify)
                .await?
            {
                admission.queued.push(existing);
                continue;
            }

            let op = self
                .db
                .enqueue_operation(OperationType::Verify, &params, priority)
                .await?;
            self.admitted(&op);
            admission.queued.push(op.id);
        }

        Ok(admission)
    }

    /// Queue a repair of `path` from its parity
    pub async fn repair(&self, path: &Path) -> Result<OperationId> {
        self.ensure_accepting()?;
        let item = self
            .catalog_items(&[path.to_path_buf()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("{} is not protected", path.display())))?;
        self.enqueue_repair(&item.path).await
    }

    pub(crate) async fn enqueue_repair(&self, path: &Path) -> Result<OperationId> {
        if let Some(existing) = self.pending_operation(path, OperationType::Repair).await? {
            return Ok(existing);
        }
        let op = self
            .db
            .enqueue_operation(
                OperationType::Repair,
                &OperationParams::for_path(path),
                Priority::Normal,
            )
            .await?;
        self.admitted(&op);
        Ok(op.id)
    }

    async fn catalog_items(&self, paths: &[PathBuf]) -> Result<Vec<ProtectedItem>> {
        if paths.is_empty() {
            return Err(Error::validation("target", "no paths to verify"));
        }
        let mut items = Vec::with_capacity(paths.len());
        for raw in paths {
            let path = normalize_target(raw)?;
            let item = self
                .db
                .get_item(&path)
                .await?
                .ok_or_else(|| Error::NotFound(format!("{} is not protected", path.display())))?;
            items.push(item);
        }
        Ok(items)
    }

    async fn pending_operation(
        &self,
        path: &Path,
        operation_type: OperationType,
    ) -> Result<Option<OperationId>> {
        Ok(self
            .db
            .operations_for_path(path, OperationStatus::Pending)
            .await?
            .into_iter()
            .find(|op| op.operation_type == operation_type)
            .map(|op| op.id))
    }

    fn fresh_reason(&self, item: &ProtectedItem) -> Option<String> {
        if item.last_status != ItemStatus::Protected {
            return None;
        }
        let verified = item.last_verified?;
        let age = Utc::now().signed_duration_since(verified).to_std().ok()?;
        (age < self.config.verify.freshness).then(|| {
            format!(
                "verified {}s ago, within the {}s freshness window",
                age.as_secs(),
                self.config.verify.freshness.as_secs()
            )
        })
    }

    /// Run a claimed VERIFY operation and record the item's status
    pub(crate) async fn execute_verify(
        &self,
        op: &Operation,
        ctx: ExecutionContext,
    ) -> Result<Disposition> {
        let path = operation_path(op)?;
        let item = self
            .db
            .get_item(&path)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} is not protected", path.display())))?;

        if tokio::fs::symlink_metadata(&path).await.is_err() {
            self.set_item_status(
                &item,
                ItemStatus::Missing,
                Some(Utc::now()),
                Some("path no longer exists"),
            )
            .await?;
            return Ok(Disposition::Completed(OperationResult {
                message: Some(format!("{} no longer exists", path.display())),
                item_status: Some(ItemStatus::Missing),
                ..Default::default()
            }));
        }

        let layout = item_layout(&item)?;
        if !layout.index_present() {
            return self.parity_missing(&item).await;
        }

        let report = match self.parity.verify(&layout, ctx).await {
            Ok(report) => report,
            Err(e @ Error::Execution(ExecutionError::Cancelled)) => return Err(e),
            Err(e) => {
                self.set_item_status(&item, ItemStatus::Error, None, Some(&e.to_string()))
                    .await?;
                return Err(e);
            }
        };

        let status = report.item_status();
        let counts = report.counts();
        let detail = (status != ItemStatus::Protected).then(|| {
            format!(
                "{} damaged, {} missing{}",
                counts.damaged,
                counts.missing,
                if counts.repairable { ", repairable" } else { "" }
            )
        });
        self.set_item_status(&item, status, Some(Utc::now()), detail.as_deref())
            .await?;

        tracing::info!(
            path = %path.display(),
            status = status.as_str(),
            verified = counts.verified,
            damaged = counts.damaged,
            missing = counts.missing,
            repairable = counts.repairable,
            "verification finished"
        );

        if self.config.verify.auto_repair
            && counts.repairable
            && matches!(status, ItemStatus::Damaged | ItemStatus::Missing)
        {
            match self.enqueue_repair(&path).await {
                Ok(repair_id) => {
                    tracing::info!(path = %path.display(), operation_id = %repair_id, "repair queued automatically")
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to queue automatic repair")
                }
            }
        }

        Ok(Disposition::Completed(OperationResult {
            message: detail,
            verify: Some(counts),
            item_status: Some(status),
            ..Default::default()
        }))
    }

    /// Run a claimed REPAIR operation
    pub(crate) async fn execute_repair(
        &self,
        op: &Operation,
        ctx: ExecutionContext,
    ) -> Result<Disposition> {
        let path = operation_path(op)?;
        let item = self
            .db
            .get_item(&path)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} is not protected", path.display())))?;
        let layout = item_layout(&item)?;
        if !layout.index_present() {
            return self.parity_missing(&item).await;
        }

        let result = self.parity.repair(&layout, ctx).await?;
        if result.success {
            self.set_item_status(&item, ItemStatus::Protected, Some(Utc::now()), None)
                .await?;
            tracing::info!(path = %path.display(), repaired = result.repaired_files.len(), "repair finished");
            Ok(Disposition::Completed(OperationResult {
                message: Some(format!("repaired {} files", result.repaired_files.len())),
                item_status: Some(ItemStatus::Protected),
                ..Default::default()
            }))
        } else {
            let error = result.error.clone().unwrap_or_else(|| {
                format!("{} files could not be repaired", result.failed_files.len())
            });
            self.set_item_status(&item, ItemStatus::Damaged, None, Some(&error))
                .await?;
            Ok(Disposition::Failed(OperationResult {
                error: Some(error),
                item_status: Some(ItemStatus::Damaged),
                ..Default::default()
            }))
        }
    }

    /// Record that an item's parity index is gone and fail the operation
    async fn parity_missing(&self, item: &ProtectedItem) -> Result<Disposition> {
        let detail = ConsistencyError::ParityDirectoryMissing {
            path: item.path.clone(),
            parity_location: item.parity_location.clone(),
        }
        .to_string();
        tracing::warn!(path = %item.path.display(), parity_location = %item.parity_location.display(), "parity index missing");
        self.set_item_status(item, ItemStatus::Error, None, Some(&detail))
            .await?;
        Ok(Disposition::Failed(OperationResult {
            error: Some(detail),
            item_status: Some(ItemStatus::Error),
            ..Default::default()
        }))
    }

    /// Update an item's status, announcing the change
    pub(crate) async fn set_item_status(
        &self,
        item: &ProtectedItem,
        status: ItemStatus,
        verified_at: Option<chrono::DateTime<Utc>>,
        error: Option<&str>,
    ) -> Result<()> {
        let previous = self
            .db
            .update_item_status(&item.path, status, verified_at, error)
            .await?;
        if let Some(from) = previous
            && from != status
        {
            self.emit_event(Event::ItemStatusChanged {
                path: item.path.clone(),
                from,
                to: status,
            });
        }
        Ok(())
    }
}

/// Layout of a catalog item, addressing its recorded parity location
pub(crate) fn item_layout(item: &ProtectedItem) -> Result<ParityLayout> {
    let mut layout = ParityLayout::new(&item.path, item.mode)?;
    layout.parity_dir = item.parity_location.clone();
    Ok(layout)
}
