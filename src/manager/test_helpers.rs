//! Shared test helpers for creating ProtectionManager instances in tests.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::{TempDir, tempdir};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::ExecutionError;
use crate::manager::ProtectionManager;
use crate::parity::{
    CreateOutcome, ExecutionContext, Par2Exit, ParityCapabilities, ParityHandler, ParityLayout,
    RepairResult, VerifyReport,
};

/// Parity handler that writes a sha256 manifest instead of running par2
///
/// `create` writes `<base>.par2` (one `hash  relative/path` line per source)
/// and a `<base>.vol00+01.par2` volume. `verify` re-hashes the sources
/// against the manifest. An optional delay keeps runs PROCESSING long enough
/// to observe, and honours cancellation. [`FakeParityHandler::fail_creates`]
/// makes `create` leave a partial index behind and exit nonzero.
#[derive(Default)]
pub(crate) struct FakeParityHandler {
    delay: Duration,
    fail_creates: AtomicBool,
    running: AtomicUsize,
    max_running: AtomicUsize,
    runs: AtomicUsize,
}

impl FakeParityHandler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Make every following `create` fail like a full disk
    pub(crate) fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Highest number of runs observed at the same time
    pub(crate) fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// Total runs started
    pub(crate) fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    async fn occupy(&self, cancel: &CancellationToken) -> crate::Result<()> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(ExecutionError::Cancelled.into()),
            _ = tokio::time::sleep(self.delay) => Ok(()),
        };
        self.running.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

fn hash_file(path: &Path) -> std::io::Result<String> {
    Ok(format!("{:x}", Sha256::digest(std::fs::read(path)?)))
}

fn read_manifest(layout: &ParityLayout) -> std::io::Result<Vec<(String, PathBuf)>> {
    let content = std::fs::read_to_string(layout.index_file())?;
    Ok(content
        .lines()
        .filter_map(|line| line.split_once("  "))
        .map(|(hash, rel)| (hash.to_string(), layout.basepath.join(rel)))
        .collect())
}

#[async_trait]
impl ParityHandler for FakeParityHandler {
    async fn create(
        &self,
        layout: &ParityLayout,
        sources: &[PathBuf],
        redundancy: u8,
        ctx: ExecutionContext,
    ) -> crate::Result<CreateOutcome> {
        self.occupy(&ctx.cancel).await?;
        if layout.index_present() {
            return Ok(CreateOutcome::AlreadyExists);
        }

        std::fs::create_dir_all(&layout.parity_dir)?;
        if self.fail_creates.load(Ordering::SeqCst) {
            std::fs::write(layout.index_file(), "partial")?;
            return Err(ExecutionError::NonZeroExit {
                exit_code: Some(1),
                stderr: "disk full\n".to_string(),
            }
            .into());
        }
        let mut manifest = String::new();
        for source in sources {
            let rel = source.strip_prefix(&layout.basepath).unwrap_or(source);
            manifest.push_str(&format!("{}  {}\n", hash_file(source)?, rel.display()));
        }
        let index = layout.index_file();
        std::fs::write(&index, manifest)?;
        let volume = layout
            .parity_dir
            .join(format!("{}.vol00+01.par2", layout.base_name));
        std::fs::write(&volume, format!("redundancy={}", redundancy))?;
        Ok(CreateOutcome::Created {
            artifacts: vec![index, volume],
        })
    }

    async fn verify(
        &self,
        layout: &ParityLayout,
        ctx: ExecutionContext,
    ) -> crate::Result<VerifyReport> {
        self.occupy(&ctx.cancel).await?;
        let mut report = VerifyReport::default();
        for (hash, file) in read_manifest(layout)? {
            let name = file.display().to_string();
            match hash_file(&file) {
                Ok(actual) if actual == hash => report.intact_files.push(name),
                Ok(_) => report.damaged_files.push(name),
                Err(_) => report.missing_files.push(name),
            }
        }
        if !report.damaged_files.is_empty() || !report.missing_files.is_empty() {
            report.exit = Par2Exit::RepairPossible;
            report.repairable = true;
        }
        Ok(report)
    }

    async fn repair(
        &self,
        layout: &ParityLayout,
        ctx: ExecutionContext,
    ) -> crate::Result<RepairResult> {
        self.occupy(&ctx.cancel).await?;
        // Hashes cannot rebuild content; accept the current bytes as repaired
        let mut repaired = Vec::new();
        let mut manifest = String::new();
        for (hash, file) in read_manifest(layout)? {
            let rel = file.strip_prefix(&layout.basepath).unwrap_or(&file).to_path_buf();
            match hash_file(&file) {
                Ok(actual) => {
                    if actual != hash {
                        repaired.push(rel.display().to_string());
                    }
                    manifest.push_str(&format!("{}  {}\n", actual, rel.display()));
                }
                Err(_) => {
                    return Ok(RepairResult {
                        success: false,
                        repaired_files: repaired,
                        failed_files: vec![rel.display().to_string()],
                        error: Some(format!("{} is missing", rel.display())),
                    });
                }
            }
        }
        std::fs::write(layout.index_file(), manifest)?;
        Ok(RepairResult {
            success: true,
            repaired_files: repaired,
            failed_files: Vec::new(),
            error: None,
        })
    }

    fn capabilities(&self) -> ParityCapabilities {
        ParityCapabilities {
            can_create: true,
            can_verify: true,
            can_repair: true,
        }
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Config rooted in `dir` with a fast poll interval
pub(crate) fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.persistence.database_path = dir.join("test.db");
    config.tools.scratch_dir = dir.join("scratch");
    config.queue.poll_interval = Duration::from_millis(20);
    config.retry.initial_delay = Duration::from_millis(10);
    config.retry.jitter = false;
    config
}

/// Helper to create a test ProtectionManager with a persistent database.
/// Returns the manager and the tempdir (which must be kept alive).
pub(crate) async fn create_test_manager(
    handler: Arc<dyn ParityHandler>,
) -> (ProtectionManager, TempDir) {
    let temp_dir = tempdir().unwrap();
    let config = test_config(temp_dir.path());
    let manager = ProtectionManager::with_parity_handler(config, handler)
        .await
        .unwrap();
    (manager, temp_dir)
}

/// Create `<root>/<name>` holding `files` small distinct files
pub(crate) fn populate_dir(root: &Path, name: &str, files: usize) -> PathBuf {
    let dir = root.join(name);
    std::fs::create_dir_all(dir.join("nested")).unwrap();
    for i in 0..files {
        let file = if i % 2 == 0 {
            dir.join(format!("file{}.jpg", i))
        } else {
            dir.join("nested").join(format!("file{}.jpg", i))
        };
        std::fs::write(file, format!("content of file {} ", i).repeat(64)).unwrap();
    }
    dir
}
