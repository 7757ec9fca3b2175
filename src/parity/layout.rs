//! On-disk `.parity` directory convention
//!
//! DIRECTORY items keep their artifacts in `<dir>/.parity/<dirname>.par2`,
//! FILE items in `<parent>/.parity/<filename>.par2`. Recovery volumes sit next
//! to the index as `<base>.vol*.par2`. Several FILE items (and the DIRECTORY
//! item of their parent) can therefore share one parity directory.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{ConsistencyError, Error, Result};
use crate::types::ProtectionMode;

/// Name of the directory holding parity artifacts
pub const PARITY_DIR_NAME: &str = ".parity";

/// Where a target's parity lives and how par2 should address its files
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParityLayout {
    /// Protected file or directory
    pub target: PathBuf,
    /// File or directory protection
    pub mode: ProtectionMode,
    /// `.parity` directory
    pub parity_dir: PathBuf,
    /// Artifact base name
    pub base_name: String,
    /// Directory passed to par2 as `-B` so stored names are relative
    pub basepath: PathBuf,
}

/// Protected content found under a target
#[derive(Clone, Debug, Default)]
pub struct SourceFiles {
    /// Regular files, sorted
    pub files: Vec<PathBuf>,
    /// Sum of file sizes in bytes
    pub total_size: u64,
}

impl ParityLayout {
    /// Layout for `target` in the given mode
    pub fn new(target: &Path, mode: ProtectionMode) -> Result<Self> {
        if !target.is_absolute() {
            return Err(Error::validation(
                "path",
                format!("path must be absolute: {}", target.display()),
            ));
        }
        if target
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(Error::validation(
                "path",
                format!("path must not contain '..': {}", target.display()),
            ));
        }
        let base_name = target
            .file_name()
            .and_then(OsStr::to_str)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::validation("path", format!("cannot protect {}", target.display()))
            })?;
        if base_name == PARITY_DIR_NAME {
            return Err(Error::validation(
                "path",
                "parity directories cannot be protected themselves",
            ));
        }

        let (parity_dir, basepath) = match mode {
            ProtectionMode::Directory => (target.join(PARITY_DIR_NAME), target.to_path_buf()),
            ProtectionMode::File => {
                let parent = target.parent().ok_or_else(|| {
                    Error::validation("path", format!("{} has no parent", target.display()))
                })?;
                (parent.join(PARITY_DIR_NAME), parent.to_path_buf())
            }
        };

        Ok(Self {
            target: target.to_path_buf(),
            mode,
            parity_dir,
            base_name,
            basepath,
        })
    }

    /// Layout for an existing target, choosing the mode from its file type
    pub fn detect(target: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(target).map_err(|e| {
            Error::validation(
                "path",
                format!("cannot read {}: {}", target.display(), e),
            )
        })?;
        let mode = if metadata.is_dir() {
            ProtectionMode::Directory
        } else if metadata.is_file() {
            ProtectionMode::File
        } else {
            return Err(Error::validation(
                "path",
                format!("{} is neither a file nor a directory", target.display()),
            ));
        };
        Self::new(target, mode)
    }

    /// The `<base>.par2` index file
    pub fn index_file(&self) -> PathBuf {
        self.parity_dir.join(format!("{}.par2", self.base_name))
    }

    /// Whether `file_name` is one of this layout's artifacts
    ///
    /// Matches `<base>.par2` and recovery volumes `<base>.vol<N>+<M>.par2`.
    pub fn is_artifact(&self, file_name: &str) -> bool {
        let Some(rest) = file_name
            .strip_prefix(self.base_name.as_str())
            .and_then(|rest| rest.strip_suffix(".par2"))
        else {
            return false;
        };
        if rest.is_empty() {
            return true;
        }
        let Some((first, count)) = rest
            .strip_prefix(".vol")
            .and_then(|range| range.split_once('+'))
        else {
            return false;
        };
        let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        digits(first) && digits(count)
    }

    /// Whether `other` addresses the same index file, and so the same parity set
    pub fn same_parity_set(&self, other: &ParityLayout) -> bool {
        self.index_file() == other.index_file()
    }

    /// Artifacts currently on disk, sorted
    pub fn artifacts(&self) -> std::io::Result<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(&self.parity_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str()
                && self.is_artifact(name)
                && entry.file_type()?.is_file()
            {
                found.push(entry.path());
            }
        }
        found.sort();
        Ok(found)
    }

    /// Whether the index file exists
    pub fn index_present(&self) -> bool {
        self.index_file().is_file()
    }

    /// Files covered by this layout and their total size
    ///
    /// DIRECTORY mode walks the tree without following symlinks and skips every
    /// `.parity` directory; FILE mode covers the single target.
    pub fn collect_sources(&self) -> Result<SourceFiles> {
        match self.mode {
            ProtectionMode::File => {
                let metadata = std::fs::metadata(&self.target)?;
                Ok(SourceFiles {
                    files: vec![self.target.clone()],
                    total_size: metadata.len(),
                })
            }
            ProtectionMode::Directory => {
                let mut sources = SourceFiles::default();
                let walker = WalkDir::new(&self.target)
                    .follow_links(false)
                    .into_iter()
                    .filter_entry(|e| e.file_name() != OsStr::new(PARITY_DIR_NAME));
                for entry in walker {
                    let entry = entry.map_err(|e| {
                        Error::Io(std::io::Error::other(format!(
                            "failed to walk {}: {}",
                            self.target.display(),
                            e
                        )))
                    })?;
                    if entry.file_type().is_file() {
                        let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
                        sources.total_size += len;
                        sources.files.push(entry.into_path());
                    }
                }
                sources.files.sort();
                Ok(sources)
            }
        }
    }
}

/// Refuse any parity location that is not an absolute `.../.parity` path
pub fn check_parity_location(path: &Path) -> Result<()> {
    let bytes = path.as_os_str().as_encoded_bytes();
    let safe = path.is_absolute()
        && bytes.ends_with(b"/.parity")
        && path.parent().is_some_and(|p| p != Path::new("/"))
        && !path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::CurDir));
    if safe {
        Ok(())
    } else {
        Err(ConsistencyError::UnsafeParityLocation {
            path: path.to_path_buf(),
        }
        .into())
    }
}

/// Delete a whole parity directory
///
/// Files go first, then empty subdirectories deepest first, then the directory
/// itself. The first failed file removal aborts with an error. A directory that
/// is already gone counts as removed. Returns the number of files deleted.
pub fn remove_parity_dir(dir: &Path) -> Result<usize> {
    check_parity_location(dir)?;
    if std::fs::symlink_metadata(dir).is_err() {
        return Ok(0);
    }
    if std::fs::symlink_metadata(dir)?.file_type().is_symlink() {
        return Err(ConsistencyError::UnsafeParityLocation {
            path: dir.to_path_buf(),
        }
        .into());
    }

    let mut files = Vec::new();
    let mut dirs = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|e| {
            Error::Io(std::io::Error::other(format!(
                "failed to walk {}: {}",
                dir.display(),
                e
            )))
        })?;
        if entry.file_type().is_dir() {
            dirs.push((entry.depth(), entry.into_path()));
        } else {
            files.push(entry.into_path());
        }
    }

    for file in &files {
        std::fs::remove_file(file).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("failed to delete {}: {}", file.display(), e),
            ))
        })?;
    }

    dirs.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, sub) in &dirs {
        std::fs::remove_dir(sub)?;
    }
    std::fs::remove_dir(dir)?;

    tracing::debug!(parity_dir = %dir.display(), files = files.len(), "removed parity directory");
    Ok(files.len())
}

/// Delete only `layout`'s artifacts, then the parity directory if it is now empty
pub fn remove_layout_artifacts(layout: &ParityLayout) -> Result<usize> {
    check_parity_location(&layout.parity_dir)?;
    let artifacts = layout.artifacts()?;
    for file in &artifacts {
        std::fs::remove_file(file).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("failed to delete {}: {}", file.display(), e),
            ))
        })?;
    }
    let empty = std::fs::read_dir(&layout.parity_dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false);
    if empty {
        std::fs::remove_dir(&layout.parity_dir)?;
    }
    Ok(artifacts.len())
}

/// Suffix of artifacts moved aside while their replacement is built
const STAGED_SUFFIX: &str = ".replaced";

/// A previous parity set moved out of the way of a re-create
///
/// The old files keep their content under `<artifact>.replaced` until the new
/// set is either accepted with [`StagedArtifacts::discard`] or rejected with
/// [`StagedArtifacts::restore`].
#[derive(Debug)]
#[must_use = "staged artifacts must be discarded or restored"]
pub struct StagedArtifacts {
    moved: Vec<(PathBuf, PathBuf)>,
}

impl StagedArtifacts {
    /// Number of artifacts moved aside
    pub fn len(&self) -> usize {
        self.moved.len()
    }

    /// Whether nothing was moved
    pub fn is_empty(&self) -> bool {
        self.moved.is_empty()
    }

    /// Delete the previous set once the new one is in place
    pub fn discard(self) -> Result<usize> {
        for (_, staged) in &self.moved {
            std::fs::remove_file(staged)?;
        }
        Ok(self.moved.len())
    }

    /// Drop whatever the failed run left behind and put the previous set back
    pub fn restore(self, layout: &ParityLayout) -> Result<usize> {
        for partial in layout.artifacts()? {
            std::fs::remove_file(&partial)?;
        }
        for (original, staged) in &self.moved {
            std::fs::rename(staged, original)?;
        }
        Ok(self.moved.len())
    }
}

/// Move `layout`'s artifacts aside so a new set can be created in their place
///
/// A failure part way through puts the already moved files back.
pub fn stage_artifacts(layout: &ParityLayout) -> Result<StagedArtifacts> {
    check_parity_location(&layout.parity_dir)?;
    let mut staged = StagedArtifacts { moved: Vec::new() };
    for original in layout.artifacts()? {
        let mut aside = original.clone().into_os_string();
        aside.push(STAGED_SUFFIX);
        let aside = PathBuf::from(aside);
        if let Err(e) = std::fs::rename(&original, &aside) {
            for (back, moved) in &staged.moved {
                let _ = std::fs::rename(moved, back);
            }
            return Err(e.into());
        }
        staged.moved.push((original, aside));
    }
    Ok(staged)
}
