//! Host resource helpers: disk space, load average and memory

use crate::process::procfs;
use crate::types::SystemResources;
use std::path::Path;

/// Get available disk space for a given path
///
/// Returns the number of bytes available to unprivileged users on the
/// filesystem containing `path`.
///
/// # Platform Support
///
/// - Linux: statvfs
/// - macOS: statvfs
/// - Other platforms: returns an `Unsupported` error
///
/// # Errors
///
/// Returns an error if the path doesn't exist or the filesystem cannot be queried.
pub fn get_available_space(path: &Path) -> std::io::Result<u64> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: c_path is a valid NUL-terminated string, stat is zeroed
        // before the call and only read after statvfs reports success.
        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(std::io::Error::last_os_error());
            }

            // f_bavail: blocks available to unprivileged users; f_frsize: fragment size
            #[allow(clippy::unnecessary_cast)]
            let available_bytes = (stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64);
            Ok(available_bytes)
        }
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "Disk space checking is not supported on this platform",
        ))
    }
}

/// Parse `/proc/loadavg` content into 1, 5 and 15 minute averages
pub fn parse_loadavg(content: &str) -> Option<[f64; 3]> {
    let mut fields = content.split_whitespace().map(str::parse::<f64>);
    let one = fields.next()?.ok()?;
    let five = fields.next()?.ok()?;
    let fifteen = fields.next()?.ok()?;
    Some([one, five, fifteen])
}

/// Parse `/proc/meminfo` content into (total, available) bytes
///
/// Kernels without `MemAvailable` fall back to `MemFree`.
pub fn parse_meminfo(content: &str) -> (Option<u64>, Option<u64>) {
    let mut total = None;
    let mut available = None;
    let mut free = None;

    for line in content.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let kib = rest
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v.saturating_mul(1024));
        match key {
            "MemTotal" => total = kib,
            "MemAvailable" => available = kib,
            "MemFree" => free = kib,
            _ => {}
        }
    }

    (total, available.or(free))
}

/// Snapshot of host resources
///
/// `disk_path` selects the volume whose free space is reported (normally the
/// database location). Every field degrades to `None` when unreadable.
pub fn system_resources(disk_path: &Path) -> SystemResources {
    let root = procfs::root_path();

    let load_average = std::fs::read_to_string(root.join("loadavg"))
        .ok()
        .and_then(|c| parse_loadavg(&c));
    let (memory_total_bytes, memory_available_bytes) =
        match std::fs::read_to_string(root.join("meminfo")) {
            Ok(content) => parse_meminfo(&content),
            Err(_) => (None, None),
        };

    // The database file may not exist yet; measure its directory instead
    let disk_target = if disk_path.exists() {
        disk_path
    } else {
        disk_path.parent().unwrap_or(disk_path)
    };
    let disk_free_bytes = match get_available_space(disk_target) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::debug!(path = %disk_target.display(), error = %e, "disk space unavailable");
            None
        }
    };

    SystemResources {
        cpu_count: std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
        load_average,
        memory_total_bytes,
        memory_available_bytes,
        disk_free_bytes,
    }
}
