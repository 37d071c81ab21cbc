use crate::error::StoreError;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Exclusive advisory lock on one container id.
///
/// Held for the whole of an operation and released when dropped, or when
/// the owning process dies. Mutating store calls take it as proof that the
/// caller owns the id.
#[derive(Debug)]
pub struct IdLock {
    id: String,
    file: File,
    path: PathBuf,
}

impl IdLock {
    /// Blocks until the lock is acquired.
    pub(crate) fn acquire(id: String, path: PathBuf) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StoreError::Lock(format!("failed to open lock file {:?}: {}", path, e)))?;

        loop {
            // SAFETY: fd stays valid for the lifetime of `file`.
            let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if result == 0 {
                break;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(StoreError::Lock(format!("failed to acquire lock: {}", err)));
            }
        }

        tracing::debug!(container_id = %id, lock_path = %path.display(), "Acquired id lock");

        Ok(Self { id, file, path })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for IdLock {
    fn drop(&mut self) {
        // SAFETY: fd stays valid until `file` drops after this.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        tracing::debug!(container_id = %self.id, "Released id lock");
    }
}
