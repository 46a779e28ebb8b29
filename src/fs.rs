//! Blocking file capability.
//!
//! A thin wrapper over [`std::fs::File`] exposing exactly the surface
//! the threaded readers and writers need: open with a disposition and
//! permission level, size, seek, read, write, truncate-at-position,
//! fsync, mtime. All calls block; they are only ever made from worker
//! threads or with the relevant locks dropped.

use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::SystemTime;

/// Access mode for [`BlockingFile::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only access to an existing file.
    Reading,
    /// Write access, creating the file as needed.
    Writing,
}

/// What to do with existing content when opening for writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Disposition {
    /// Create the file, or truncate it to zero if it exists.
    #[default]
    Empty,
    /// Open existing content without truncation, creating if absent.
    Existing,
}

/// Permission level for newly created files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Permissions {
    /// Whatever the process umask produces.
    #[default]
    Inherit,
    /// Owner read/write only (0o600 on Unix).
    CurrentUserOnly,
    /// Owner read/write, group read (0o640 on Unix).
    CurrentUserAndAdminsOnly,
}

/// A blocking file handle.
pub struct BlockingFile {
    inner: File,
}

impl BlockingFile {
    /// Open `path` with the given mode. `disposition` and `permissions`
    /// apply only when writing.
    pub fn open(
        path: &Path,
        mode: OpenMode,
        disposition: Disposition,
        permissions: Permissions,
    ) -> Result<Self> {
        let mut options = OpenOptions::new();
        match mode {
            OpenMode::Reading => {
                options.read(true);
            }
            OpenMode::Writing => {
                options.write(true).create(true);
                if disposition == Disposition::Empty {
                    options.truncate(true);
                }
            }
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            match permissions {
                Permissions::Inherit => {}
                Permissions::CurrentUserOnly => {
                    options.mode(0o600);
                }
                Permissions::CurrentUserAndAdminsOnly => {
                    options.mode(0o640);
                }
            }
        }
        #[cfg(not(unix))]
        let _ = permissions;

        Ok(Self {
            inner: options.open(path)?,
        })
    }

    /// Current size in bytes, or `None` if it cannot be determined.
    pub fn size(&self) -> Option<u64> {
        self.inner.metadata().ok().map(|m| m.len())
    }

    /// Seek and return the new position.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(self.inner.seek(pos)?)
    }

    /// Current position.
    pub fn position(&mut self) -> Result<u64> {
        Ok(self.inner.stream_position()?)
    }

    /// Read into `buf`, returning the number of bytes read. Zero means
    /// end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.inner.read(buf)?)
    }

    /// Write from `buf`, returning the number of bytes written.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(self.inner.write(buf)?)
    }

    /// Truncate the file at the current position.
    pub fn truncate(&mut self) -> Result<()> {
        let pos = self.position()?;
        self.inner.set_len(pos)?;
        Ok(())
    }

    /// Flush file content and metadata to stable storage.
    pub fn fsync(&self) -> Result<()> {
        Ok(self.inner.sync_all()?)
    }

    /// Set the file's modification time.
    pub fn set_modified(&self, t: SystemTime) -> Result<()> {
        Ok(self.inner.set_modified(t)?)
    }
}
