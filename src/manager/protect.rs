//! Protect admission and parity creation

use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::{ConsistencyError, Error, Result};
use crate::parity::layout::{StagedArtifacts, remove_layout_artifacts, stage_artifacts};
use crate::parity::{CreateOutcome, ExecutionContext, ParityLayout, SourceFiles};
use crate::types::{
    Admission, Event, ItemStatus, Operation, OperationParams, OperationResult, OperationStatus,
    OperationType, ProtectOptions, ProtectedItem, ProtectionMode,
};

use super::ProtectionManager;
use super::verify::item_layout;
use super::worker::{Disposition, join_error, operation_path};

impl ProtectionManager {
    /// Queue parity creation for `path`
    ///
    /// Returns immediately with the admitted operation. The request is
    /// recorded as SKIPPED instead when the catalog already holds a PROTECTED
    /// entry at the same redundancy whose file count and size are unchanged
    /// (unless `options.force`), and it joins an identical PENDING protect
    /// when one is already queued.
    ///
    /// # Errors
    ///
    /// Validation errors (relative, missing or unreadable path, redundancy
    /// outside 1-100) are returned without enqueueing anything, as is
    /// [`ConsistencyError::ParitySetConflict`] when another catalog entry
    /// already owns the parity set `path` would use.
    pub async fn protect(&self, path: &Path, options: ProtectOptions) -> Result<Admission> {
        self.ensure_accepting()?;

        let redundancy = options
            .redundancy
            .unwrap_or(self.config.protection.default_redundancy);
        validate_redundancy(redundancy)?;

        let path = normalize_target(path)?;
        let layout = inspect_target(path.clone()).await?;
        self.ensure_parity_set_free(&layout).await?;

        let params = OperationParams {
            path: Some(path.clone()),
            redundancy: Some(redundancy),
            force: options.force,
            ..Default::default()
        };

        if !options.force
            && self.config.protection.skip_unchanged
            && let Some(reason) = self.unchanged_reason(&layout, redundancy).await?
        {
            let op = self
                .db
                .record_skipped_operation(OperationType::Protect, &params, options.priority, &reason)
                .await?;
            tracing::info!(operation_id = %op.id, path = %path.display(), reason = %reason, "protect skipped");
            self.emit_event(Event::OperationSkipped {
                id: op.id.clone(),
                reason,
            });
            return Ok(Admission {
                queued: Vec::new(),
                skipped: vec![op.id],
            });
        }

        let pending = self
            .db
            .operations_for_path(&path, OperationStatus::Pending)
            .await?;
        if let Some(existing) = pending.iter().find(|op| {
            op.operation_type == OperationType::Protect
                && op.params.redundancy == Some(redundancy)
                && op.params.force == options.force
        }) {
            tracing::debug!(operation_id = %existing.id, path = %path.display(), "protect already queued");
            return Ok(Admission {
                queued: vec![existing.id.clone()],
                skipped: Vec::new(),
            });
        }

        let op = self
            .db
            .enqueue_operation(OperationType::Protect, &params, options.priority)
            .await?;
        self.admitted(&op);
        Ok(Admission {
            queued: vec![op.id],
            skipped: Vec::new(),
        })
    }

    /// Why an item needs no new parity, if it doesn't
    async fn unchanged_reason(
        &self,
        layout: &ParityLayout,
        redundancy: u8,
    ) -> Result<Option<String>> {
        let Some(item) = self.db.get_item(&layout.target).await? else {
            return Ok(None);
        };
        if item.last_status != ItemStatus::Protected || item.redundancy != redundancy {
            return Ok(None);
        }

        let measured = layout.clone();
        let (sources, index_present) = tokio::task::spawn_blocking(move || {
            measured
                .collect_sources()
                .map(|sources| (sources, measured.index_present()))
        })
        .await
        .map_err(join_error)??;

        let unchanged = index_present
            && sources.total_size == item.size
            && sources.files.len() as u64 == item.file_count;
        Ok(unchanged.then(|| {
            format!(
                "already protected at {}% redundancy and unchanged",
                redundancy
            )
        }))
    }

    /// Catalog entry other than `layout.target` addressing the same parity set
    pub(crate) async fn parity_set_owner(&self, layout: &ParityLayout) -> Result<Option<PathBuf>> {
        let neighbours = self
            .db
            .items_at_parity_location(&layout.parity_dir, &layout.target)
            .await?;
        Ok(neighbours
            .into_iter()
            .find(|item| item_layout(item).is_ok_and(|other| other.same_parity_set(layout)))
            .map(|item| item.path))
    }

    async fn ensure_parity_set_free(&self, layout: &ParityLayout) -> Result<()> {
        match self.parity_set_owner(layout).await? {
            Some(owner) => Err(ConsistencyError::ParitySetConflict {
                path: layout.target.clone(),
                owner,
            }
            .into()),
            None => Ok(()),
        }
    }

    /// Log, announce and wake a worker for a freshly enqueued operation
    pub(crate) fn admitted(&self, op: &Operation) {
        tracing::info!(
            operation_id = %op.id,
            operation_type = %op.operation_type,
            path = ?op.params.path,
            priority = ?op.priority,
            "operation queued"
        );
        self.emit_event(Event::OperationQueued {
            id: op.id.clone(),
            operation_type: op.operation_type,
            path: op.params.path.clone(),
        });
        self.state.wake.notify_waiters();
    }

    /// Create parity for a claimed PROTECT operation
    pub(crate) async fn execute_protect(
        &self,
        op: &Operation,
        ctx: ExecutionContext,
    ) -> Result<Disposition> {
        let path = operation_path(op)?;
        let redundancy = op
            .params
            .redundancy
            .unwrap_or(self.config.protection.default_redundancy);
        let existing = self.db.get_item(&path).await?;
        let replace = existing.is_some() || op.params.force;

        let target = path.clone();
        let (layout, sources) =
            tokio::task::spawn_blocking(move || -> Result<(ParityLayout, SourceFiles)> {
                let layout = ParityLayout::detect(&target)?;
                let sources = layout.collect_sources()?;
                if sources.files.is_empty() {
                    return Err(Error::validation(
                        "path",
                        format!("no files to protect under {}", target.display()),
                    ));
                }
                Ok((layout, sources))
            })
            .await
            .map_err(join_error)??;
        self.ensure_parity_set_free(&layout).await?;

        // par2 refuses to overwrite, so the previous set waits aside until
        // the new one exists
        let had_index = layout.index_present();
        let staged = if replace && had_index {
            let aside = layout.clone();
            let staged = tokio::task::spawn_blocking(move || stage_artifacts(&aside))
                .await
                .map_err(join_error)??;
            tracing::debug!(path = %path.display(), moved = staged.len(), "previous parity moved aside");
            Some(staged)
        } else {
            None
        };

        let outcome = match self
            .parity
            .create(&layout, &sources.files, redundancy, ctx)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.abandon_create(existing.as_ref(), &layout, staged, had_index, &e)
                    .await;
                return Err(e);
            }
        };

        if let Some(staged) = staged {
            let discarded = tokio::task::spawn_blocking(move || staged.discard())
                .await
                .map_err(join_error)
                .and_then(|result| result);
            match discarded {
                Ok(count) => {
                    tracing::debug!(path = %path.display(), removed = count, "removed previous parity files")
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to delete previous parity files")
                }
            }
        }

        match outcome {
            CreateOutcome::Created { artifacts } => {
                let item = ProtectedItem {
                    path: path.clone(),
                    mode: layout.mode,
                    redundancy,
                    size: sources.total_size,
                    file_count: sources.files.len() as u64,
                    parity_location: layout.parity_dir.clone(),
                    last_status: ItemStatus::Protected,
                    protected_date: Utc::now(),
                    last_verified: None,
                    last_error: None,
                };
                self.db.upsert_item(&item).await?;

                tracing::info!(
                    path = %path.display(),
                    redundancy,
                    files = item.file_count,
                    size = item.size,
                    parity_files = artifacts.len(),
                    "parity created"
                );
                self.emit_event(Event::ItemProtected {
                    path: path.clone(),
                    redundancy,
                });
                if let Some(previous) = existing
                    && previous.last_status != ItemStatus::Protected
                {
                    self.emit_event(Event::ItemStatusChanged {
                        path,
                        from: previous.last_status,
                        to: ItemStatus::Protected,
                    });
                }

                Ok(Disposition::Completed(OperationResult {
                    message: Some(format!(
                        "created {} parity files for {} source files",
                        artifacts.len(),
                        item.file_count
                    )),
                    item_status: Some(ItemStatus::Protected),
                    ..Default::default()
                }))
            }
            CreateOutcome::AlreadyExists => {
                if existing.is_none() {
                    // Parity from an earlier install; catalog it until a verify says more
                    let item = ProtectedItem {
                        path: path.clone(),
                        mode: layout.mode,
                        redundancy,
                        size: sources.total_size,
                        file_count: sources.files.len() as u64,
                        parity_location: layout.parity_dir.clone(),
                        last_status: ItemStatus::Unknown,
                        protected_date: Utc::now(),
                        last_verified: None,
                        last_error: None,
                    };
                    self.db.upsert_item(&item).await?;
                }
                Ok(Disposition::Skipped(format!(
                    "parity files already exist in {}",
                    layout.parity_dir.display()
                )))
            }
        }
    }
}

impl ProtectionManager {
    /// Undo a failed create: drop partial output and put the previous set back
    ///
    /// A catalog entry left without usable parity is marked ERROR.
    async fn abandon_create(
        &self,
        existing: Option<&ProtectedItem>,
        layout: &ParityLayout,
        staged: Option<StagedArtifacts>,
        had_index: bool,
        cause: &Error,
    ) {
        let target = layout.clone();
        let cleanup = tokio::task::spawn_blocking(move || -> Result<bool> {
            match staged {
                Some(staged) => staged.restore(&target).map(|_| true),
                None if !had_index => remove_layout_artifacts(&target).map(|_| false),
                None => Ok(false),
            }
        })
        .await
        .map_err(join_error)
        .and_then(|result| result);

        let restored = match cleanup {
            Ok(restored) => restored,
            Err(e) => {
                tracing::error!(path = %layout.target.display(), error = %e, "failed to restore previous parity files");
                false
            }
        };
        if restored {
            tracing::info!(path = %layout.target.display(), "kept previous parity after failed create");
            return;
        }

        let Some(item) = existing else {
            return;
        };
        let detail = format!("parity could not be recreated: {}", cause);
        if let Err(e) = self
            .set_item_status(item, ItemStatus::Error, None, Some(&detail))
            .await
        {
            tracing::error!(path = %item.path.display(), error = %e, "failed to record parity loss");
        }
    }
}

pub(crate) fn validate_redundancy(redundancy: u8) -> Result<()> {
    if (1..=100).contains(&redundancy) {
        Ok(())
    } else {
        Err(Error::validation(
            "redundancy",
            format!("redundancy must be between 1 and 100, got {}", redundancy),
        ))
    }
}

/// Absolute path with trailing separators and `.` components dropped
pub(crate) fn normalize_target(path: &Path) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(Error::validation("path", "path is required"));
    }
    if !path.is_absolute() {
        return Err(Error::validation(
            "path",
            format!("path must be absolute: {}", path.display()),
        ));
    }
    Ok(path.components().collect())
}

/// Check that `path` exists and is readable, and work out its layout
async fn inspect_target(path: PathBuf) -> Result<ParityLayout> {
    tokio::task::spawn_blocking(move || {
        let layout = ParityLayout::detect(&path)?;
        let readable = match layout.mode {
            ProtectionMode::Directory => std::fs::read_dir(&path).map(|_| ()),
            ProtectionMode::File => std::fs::File::open(&path).map(|_| ()),
        };
        readable.map_err(|e| {
            Error::validation("path", format!("cannot read {}: {}", path.display(), e))
        })?;
        Ok(layout)
    })
    .await
    .map_err(join_error)?
}
