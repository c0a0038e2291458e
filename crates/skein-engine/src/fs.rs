//! Filesystem wrappers
//!
//! Each call runs the blocking `std::fs` operation on the worker pool and
//! suspends the calling coroutine until it returns. Bulk data transfers use
//! the slow-IO lane and the `Read`/`Write` default timeouts; metadata calls
//! use the general lane without a deadline.

use crate::config::{timeout_default, TimeoutCategory};
use crate::error::Result;
use crate::scheduler::{submit_work_kind, WorkKind};
use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};

fn fast<T, F>(op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
{
    submit_work_kind(WorkKind::FastIo, move |_| Ok(op()?), None)
}

/// Read a whole file.
pub fn read(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref().to_path_buf();
    submit_work_kind(
        WorkKind::SlowIo,
        move |_| Ok(fs::read(&path)?),
        timeout_default(TimeoutCategory::Read),
    )
}

/// Read a whole file as UTF-8.
pub fn read_to_string(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref().to_path_buf();
    submit_work_kind(
        WorkKind::SlowIo,
        move |_| Ok(fs::read_to_string(&path)?),
        timeout_default(TimeoutCategory::Read),
    )
}

/// Create or truncate a file and write `contents` to it.
pub fn write(path: impl AsRef<Path>, contents: impl Into<Vec<u8>>) -> Result<()> {
    let path = path.as_ref().to_path_buf();
    let contents = contents.into();
    submit_work_kind(
        WorkKind::SlowIo,
        move |_| Ok(fs::write(&path, contents)?),
        timeout_default(TimeoutCategory::Write),
    )
}

/// Metadata, following symlinks.
pub fn metadata(path: impl AsRef<Path>) -> Result<Metadata> {
    let path = path.as_ref().to_path_buf();
    fast(move || fs::metadata(path))
}

/// Metadata of the link itself.
pub fn symlink_metadata(path: impl AsRef<Path>) -> Result<Metadata> {
    let path = path.as_ref().to_path_buf();
    fast(move || fs::symlink_metadata(path))
}

/// Remove a file.
pub fn remove_file(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref().to_path_buf();
    fast(move || fs::remove_file(path))
}

/// Rename a file or directory.
pub fn rename(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<()> {
    let (from, to) = (from.as_ref().to_path_buf(), to.as_ref().to_path_buf());
    fast(move || fs::rename(from, to))
}

/// Create a hard link `link` pointing at `original`.
pub fn hard_link(original: impl AsRef<Path>, link: impl AsRef<Path>) -> Result<()> {
    let (original, link) = (original.as_ref().to_path_buf(), link.as_ref().to_path_buf());
    fast(move || fs::hard_link(original, link))
}

/// Create a symbolic link `link` pointing at `original`.
#[cfg(unix)]
pub fn symlink(original: impl AsRef<Path>, link: impl AsRef<Path>) -> Result<()> {
    let (original, link) = (original.as_ref().to_path_buf(), link.as_ref().to_path_buf());
    fast(move || std::os::unix::fs::symlink(original, link))
}

/// Create a directory and all missing parents.
pub fn create_dir_all(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref().to_path_buf();
    fast(move || fs::create_dir_all(path))
}

/// List a directory. Entries come back sorted by path.
pub fn read_dir(path: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let path = path.as_ref().to_path_buf();
    submit_work_kind(
        WorkKind::SlowIo,
        move |token| {
            let mut entries = Vec::new();
            for entry in fs::read_dir(&path)? {
                token.check()?;
                entries.push(entry?.path());
            }
            entries.sort();
            Ok(entries)
        },
        timeout_default(TimeoutCategory::Read),
    )
}
