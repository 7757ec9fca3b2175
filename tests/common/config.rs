//! Test configuration helpers for locating par2 and creating test managers

use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use par2_protect::{CliParityHandler, Config, ProtectionManager};

/// Whether a par2 binary is on PATH
pub fn has_par2() -> bool {
    CliParityHandler::from_path().is_some()
}

/// Config rooted in `dir`, tuned for fast polling
pub fn live_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.persistence.database_path = dir.join("par2protect.db");
    config.tools.scratch_dir = dir.join("scratch");
    config.tools.search_path = true;
    config.queue.poll_interval = Duration::from_millis(100);
    config
}

/// Create a manager backed by the real par2 binary
///
/// Returns the manager and temp directory (keep temp_dir alive for test duration)
pub async fn create_live_manager() -> (ProtectionManager, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let manager = ProtectionManager::new(live_config(temp_dir.path()))
        .await
        .unwrap();
    (manager, temp_dir)
}

/// Write `count` files of pseudo-random content under `root/name`
pub fn create_dataset(root: &Path, name: &str, count: usize, size: usize) -> PathBuf {
    let dir = root.join(name);
    std::fs::create_dir_all(dir.join("sub")).unwrap();
    for i in 0..count {
        let content: Vec<u8> = (0..size)
            .map(|n| ((n * 31 + i * 17) % 251) as u8)
            .collect();
        let file = if i % 2 == 0 {
            dir.join(format!("data{}.bin", i))
        } else {
            dir.join("sub").join(format!("data{}.bin", i))
        };
        std::fs::write(file, content).unwrap();
    }
    dir
}
