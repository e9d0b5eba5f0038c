//! Transactional rewrite of a container file.
//!
//! 1. stage the new image into a temp file beside the target
//! 2. fsync the temp file
//! 3. rename it over the target
//! 4. fsync the directory
//!
//! A failure before step 3 leaves the target untouched. Staged bytes go
//! straight to disk so images larger than memory can be committed.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use zilfs_core::{ZilError, ZilResult};

/// Suffix of staging files; a name looks like `.<container>.<random>.zil-tmp`.
pub const STAGING_SUFFIX: &str = ".zil-tmp";

fn parent_dir(target: &Path) -> &Path {
    match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn staging_prefix(target: &Path) -> ZilResult<String> {
    let name = target
        .file_name()
        .ok_or_else(|| ZilError::bad_argument(format!("{} has no file name", target.display())))?;
    Ok(format!(".{}.", name.to_string_lossy()))
}

pub struct Transaction {
    target: PathBuf,
    staged: NamedTempFile,
    written: u64,
}

impl Transaction {
    /// Open a staging file in the target's directory.
    pub fn begin(target: &Path) -> ZilResult<Self> {
        let staged = tempfile::Builder::new()
            .prefix(&staging_prefix(target)?)
            .suffix(STAGING_SUFFIX)
            .rand_bytes(8)
            .tempfile_in(parent_dir(target))?;
        tracing::debug!(container = %target.display(), staging = %staged.path().display(), "transaction begun");
        Ok(Self {
            target: target.to_path_buf(),
            staged,
            written: 0,
        })
    }

    pub fn stage(&mut self, bytes: &[u8]) -> ZilResult<()> {
        self.write_all(bytes)?;
        Ok(())
    }

    pub fn staged_len(&self) -> u64 {
        self.written
    }

    pub fn staging_path(&self) -> &Path {
        self.staged.path()
    }

    /// Flush and fsync the staging file (step 2).
    pub fn prepare(&mut self) -> ZilResult<()> {
        self.staged.flush()?;
        self.staged.as_file().sync_all()?;
        Ok(())
    }

    /// Steps 2 to 4. On error the staging file is removed and the target
    /// keeps its previous content.
    pub fn commit(mut self) -> ZilResult<()> {
        self.prepare()?;
        let dir = parent_dir(&self.target).to_path_buf();
        let target = self.target;
        let written = self.written;
        self.staged
            .persist(&target)
            .map_err(|e| ZilError::Io(e.error))?;
        sync_dir(&dir)?;
        tracing::debug!(container = %target.display(), bytes = written, "transaction committed");
        Ok(())
    }

    /// Discard the staged image.
    pub fn rollback(self) -> ZilResult<()> {
        tracing::debug!(container = %self.target.display(), "transaction rolled back");
        self.staged.close()?;
        Ok(())
    }
}

impl Write for Transaction {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.staged.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.staged.flush()
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> ZilResult<()> {
    std::fs::File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> ZilResult<()> {
    Ok(())
}

/// Remove staging files left behind by an interrupted commit of `target`.
///
/// Only call this while holding the container lock.
pub fn sweep_stale(target: &Path) -> ZilResult<usize> {
    let prefix = staging_prefix(target)?;
    let dir = parent_dir(target);
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(&prefix) && name.ends_with(STAGING_SUFFIX) {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
    if removed > 0 {
        tracing::info!(container = %target.display(), removed, "removed stale staging files");
    }
    Ok(removed)
}
