use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another update or rollback is already running")]
    Busy,
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl LockError {
    fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }
}

/// Exclusive advisory lock held for the duration of an update or rollback.
///
/// Released when dropped.
#[derive(Debug)]
pub struct OperationLock {
    _file: File,
    path: PathBuf,
}

impl OperationLock {
    /// Take the lock without waiting.
    ///
    /// # Errors
    /// Returns [`LockError::Busy`] when another holder exists, in this or any
    /// other process.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|error| LockError::io("failed to create lock directory", error))?;
        }
        let mut lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|error| LockError::io("failed to open update lock file", error))?;

        match lock_file.try_lock_exclusive() {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(LockError::Busy);
            }
            Err(error) => return Err(LockError::io("failed to acquire update lock", error)),
        }

        lock_file
            .set_len(0)
            .and_then(|()| lock_file.seek(SeekFrom::Start(0)).map(|_| ()))
            .and_then(|()| writeln!(lock_file, "{}", std::process::id()))
            .map_err(|error| LockError::io("failed to write update lock metadata", error))?;

        Ok(Self {
            _file: lock_file,
            path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::{LockError, OperationLock};

    #[test]
    fn second_acquire_is_busy_until_first_is_dropped() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("config/.update.lock");

        let first = OperationLock::acquire(&path).expect("first lock should succeed");
        assert!(matches!(OperationLock::acquire(&path), Err(LockError::Busy)));

        drop(first);
        assert!(OperationLock::acquire(&path).is_ok());
    }

    #[test]
    fn lock_file_records_pid() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join(".update.lock");

        let lock = OperationLock::acquire(&path).expect("lock should succeed");

        let content = std::fs::read_to_string(lock.path()).expect("lock file should be readable");
        assert_eq!(content.trim(), std::process::id().to_string());
    }
}
