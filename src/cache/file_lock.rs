//! Exclusive lock on a cache directory.
//!
//! Each store directory holds a `.lock` file. A store keeps the file open
//! for its lifetime but only locks it (`flock` on Unix, `LockFileEx` on
//! Windows) around each write, compaction and log catch-up. Several
//! processes may therefore share one directory; their writes are
//! serialised and each one re-reads what the others appended. Locking
//! blocks until the current holder releases it.

use std::fs::{File, OpenOptions};
use std::io::{Error as IoError, Result as IoResult};
use std::path::{Path, PathBuf};

use crate::error::StorageError;

/// Name of the lock file inside a store directory.
pub const LOCK_FILE: &str = ".lock";

/// Open lock file of a store directory.
#[derive(Debug)]
pub struct DirLock {
    file: File,
    path: PathBuf,
}

/// Held exclusive lock; released on drop.
#[derive(Debug)]
pub struct DirLockGuard<'a> {
    lock: &'a DirLock,
}

impl DirLock {
    /// Opens the lock file of `dir`, creating it if needed. Does not lock.
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StorageError::io(format!("open {}", path.display()), e))?;
        Ok(Self { file, path })
    }

    /// Blocks until the exclusive lock is held.
    pub fn exclusive(&self) -> Result<DirLockGuard<'_>, StorageError> {
        lock(&self.file)
            .map_err(|e| StorageError::io(format!("lock {}", self.path.display()), e))?;
        Ok(DirLockGuard { lock: self })
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = unlock(&self.lock.file) {
            tracing::warn!(
                path = %self.lock.path.display(),
                error = %e,
                "Failed to release cache directory lock"
            );
        }
    }
}

#[cfg(unix)]
fn flock(file: &File, operation: libc::c_int) -> IoResult<()> {
    use std::os::unix::io::AsRawFd;

    loop {
        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let result = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if result == 0 {
            return Ok(());
        }
        let err = IoError::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(unix)]
fn lock(file: &File) -> IoResult<()> {
    flock(file, libc::LOCK_EX)
}

#[cfg(unix)]
fn unlock(file: &File) -> IoResult<()> {
    flock(file, libc::LOCK_UN)
}

#[cfg(windows)]
fn lock(file: &File) -> IoResult<()> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::HANDLE;
    use windows_sys::Win32::Storage::FileSystem::{LockFileEx, LOCKFILE_EXCLUSIVE_LOCK};

    let handle = file.as_raw_handle() as HANDLE;
    // SAFETY: the handle is owned by `file`; OVERLAPPED is plain data.
    let result = unsafe {
        let mut overlapped = std::mem::zeroed::<windows_sys::Win32::System::IO::OVERLAPPED>();
        LockFileEx(handle, LOCKFILE_EXCLUSIVE_LOCK, 0, 1, 0, &mut overlapped)
    };
    if result == 0 {
        return Err(IoError::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
fn unlock(file: &File) -> IoResult<()> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::HANDLE;
    use windows_sys::Win32::Storage::FileSystem::UnlockFileEx;

    let handle = file.as_raw_handle() as HANDLE;
    // SAFETY: the handle is owned by `file`; OVERLAPPED is plain data.
    let result = unsafe {
        let mut overlapped = std::mem::zeroed::<windows_sys::Win32::System::IO::OVERLAPPED>();
        UnlockFileEx(handle, 0, 1, 0, &mut overlapped)
    };
    if result == 0 {
        return Err(IoError::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn lock(_file: &File) -> IoResult<()> {
    #[cfg(feature = "allow_no_lock")]
    {
        tracing::warn!("file locking unsupported on this platform; cache directory is unguarded");
        Ok(())
    }

    #[cfg(not(feature = "allow_no_lock"))]
    {
        Err(IoError::new(
            std::io::ErrorKind::Unsupported,
            "file locking not supported on this platform",
        ))
    }
}

#[cfg(not(any(unix, windows)))]
fn unlock(_file: &File) -> IoResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_lock_acquire_release() {
        let dir = tempdir().unwrap();
        let lock = DirLock::open(dir.path()).unwrap();
        assert!(lock.path().exists());
        drop(lock.exclusive().unwrap());
        drop(lock.exclusive().unwrap());
    }

    #[test]
    fn test_second_holder_waits_for_release() {
        let dir = tempdir().unwrap();
        let first = DirLock::open(dir.path()).unwrap();
        let guard = first.exclusive().unwrap();

        let acquired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&acquired);
        let path = dir.path().to_path_buf();
        let waiter = thread::spawn(move || {
            let second = DirLock::open(&path).unwrap();
            let _guard = second.exclusive().unwrap();
            flag.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(guard);
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }
}
