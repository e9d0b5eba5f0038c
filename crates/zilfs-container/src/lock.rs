//! Exclusive advisory lock on a container.
//!
//! The lock is taken on a sidecar `<container>.lock` file because every
//! commit renames a fresh inode over the container itself. Contention
//! never blocks: it is reported as `Busy` straight away.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use zilfs_core::{ZilError, ZilResult};

pub fn lock_path(container: &Path) -> PathBuf {
    let mut name = container
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    container.with_file_name(name)
}

#[derive(Debug)]
pub struct ContainerLock {
    file: File,
    path: PathBuf,
}

/// Attempts before giving up on a sidecar that keeps being replaced.
const MAX_ATTEMPTS: usize = 8;

impl ContainerLock {
    /// Take the lock, or fail with `Busy` if another session holds it.
    ///
    /// The sidecar may be unlinked by [`ContainerLock::remove`] between our
    /// open and our lock; a lock on such an orphaned inode guards nothing,
    /// so it is dropped and the open retried.
    pub fn acquire(container: &Path) -> ZilResult<Self> {
        let path = lock_path(container);
        for _ in 0..MAX_ATTEMPTS {
            let file = open_sidecar(&path)?;
            if let Some(lock) = Self::lock_handle(file, &path, container)? {
                return Ok(lock);
            }
            tracing::debug!(lock = %path.display(), "lock sidecar replaced, retrying");
        }
        Err(ZilError::Busy(format!(
            "{} lock sidecar keeps changing",
            container.display()
        )))
    }

    /// Lock an opened sidecar handle. `None` when the handle no longer
    /// names the file at `path`.
    fn lock_handle(file: File, path: &Path, container: &Path) -> ZilResult<Option<Self>> {
        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if is_contended(&e) => {
                return Err(ZilError::Busy(format!(
                    "{} is open in another session",
                    container.display()
                )))
            }
            Err(e) => return Err(e.into()),
        }
        if !names_same_file(&file, path)? {
            return Ok(None);
        }
        tracing::debug!(lock = %path.display(), "container lock acquired");
        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
        }))
    }

    /// Unlink the sidecar, then release the lock. Openers racing with the
    /// unlink see the inode change and retry on a fresh sidecar.
    pub fn remove(self) -> ZilResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether another session currently holds the lock.
    pub fn is_held(container: &Path) -> ZilResult<bool> {
        if !lock_path(container).exists() {
            return Ok(false);
        }
        match Self::acquire(container) {
            Ok(_) => Ok(false),
            Err(ZilError::Busy(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_sidecar(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
}

/// Whether `file` is still the file at `path`.
#[cfg(unix)]
fn names_same_file(file: &File, path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(current) => Ok(held.dev() == current.dev() && held.ino() == current.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

// Open files cannot be unlinked here, so the sidecar cannot be swapped out.
#[cfg(not(unix))]
fn names_same_file(_file: &File, path: &Path) -> io::Result<bool> {
    Ok(path.exists())
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl Drop for ContainerLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(lock = %self.path.display(), "failed to release container lock: {e}");
        }
    }
}
