//! Resctrl pseudo-filesystem access primitives
//!
//! All paths handed to a [`ResctrlFs`] are relative to the resctrl mount
//! point. [`LocalFs`] is the implementation backed by the real filesystem;
//! tests point it at a temporary directory holding a mock resctrl tree.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Relative path of the kernel's last command status file
pub const LAST_CMD_STATUS: &str = "info/last_cmd_status";

/// Blocking operations on a resctrl filesystem tree
pub trait ResctrlFs: fmt::Debug + Send + Sync {
    /// Mount point all relative paths are resolved against
    fn root(&self) -> &Path;

    /// Read a whole file into a string
    fn read_to_string(&self, rel: &Path) -> io::Result<String>;

    /// Write (replace) the contents of a file
    fn write(&self, rel: &Path, data: &[u8]) -> io::Result<()>;

    /// Append to a file with a single write call
    fn append(&self, rel: &Path, data: &[u8]) -> io::Result<()>;

    /// Create a directory. Fails with `AlreadyExists` if it exists.
    fn create_dir(&self, rel: &Path) -> io::Result<()>;

    /// Remove a resctrl group directory
    fn remove_group(&self, rel: &Path) -> io::Result<()>;

    /// Names of the entries of a directory, sorted
    fn read_dir_names(&self, rel: &Path) -> io::Result<Vec<String>>;

    /// True if the path exists and is a regular file
    fn is_file(&self, rel: &Path) -> bool;

    /// True if the path exists and is a directory
    fn is_dir(&self, rel: &Path) -> bool;

    /// Absolute path of a relative resctrl path
    fn path(&self, rel: &Path) -> PathBuf {
        self.root().join(rel)
    }
}

/// [`ResctrlFs`] implementation operating on a local directory tree
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ResctrlFs for LocalFs {
    fn root(&self) -> &Path {
        &self.root
    }

    fn read_to_string(&self, rel: &Path) -> io::Result<String> {
        fs::read_to_string(self.path(rel))
    }

    fn write(&self, rel: &Path, data: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .custom_flags(libc::O_SYNC)
            .open(self.path(rel))?;
        file.write_all(data)
    }

    fn append(&self, rel: &Path, data: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .custom_flags(libc::O_SYNC)
            .open(self.path(rel))?;
        file.write_all(data)
    }

    fn create_dir(&self, rel: &Path) -> io::Result<()> {
        fs::create_dir(self.path(rel))
    }

    fn remove_group(&self, rel: &Path) -> io::Result<()> {
        let path = self.path(rel);
        // The kernel removes a whole group with a single rmdir. Plain
        // directory trees (e.g. mock filesystems) need a recursive removal.
        match fs::remove_dir(&path) {
            Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => fs::remove_dir_all(&path),
            other => other,
        }
    }

    fn read_dir_names(&self, rel: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.path(rel))? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort_unstable();
        Ok(names)
    }

    fn is_file(&self, rel: &Path) -> bool {
        fs::metadata(self.path(rel))
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    fn is_dir(&self, rel: &Path) -> bool {
        fs::metadata(self.path(rel))
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }
}

/// Read the kernel's in-band status of the last failed resctrl command
///
/// Returns `None` if the status cannot be read or reports success.
pub fn last_cmd_status(fs: &dyn ResctrlFs) -> Option<String> {
    let status = fs.read_to_string(Path::new(LAST_CMD_STATUS)).ok()?;
    let status = status.trim();
    if status.is_empty() || status == "ok" {
        None
    } else {
        Some(status.to_string())
    }
}
