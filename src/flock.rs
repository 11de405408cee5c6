use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use crate::error::Result;
use crate::Error;

/// Advisory exclusive lock on a database path.
///
/// Held for the lifetime of a [`Database`](crate::Database). A second owner
/// of the same path (another process, or an open that bypassed the registry)
/// fails with [`Error::AlreadyOpen`]. The lock file carries the owning
/// process ID for debugging and is released when the lock is dropped.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Creates the lock file if needed and acquires the lock, without
    /// blocking.
    pub fn lock<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .map_err(Error::from)?;

        Self::try_lock(&file)?;

        // Only the lock holder rewrites the file, so the PID is stamped
        // after acquisition.
        file.set_len(0).map_err(Error::from)?;
        writeln!(file, "{}", std::process::id()).map_err(Error::from)?;
        file.flush().map_err(Error::from)?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        if unsafe { flock(fd, LOCK_EX | LOCK_NB) } != 0 {
            let err = std::io::Error::last_os_error();
            return match err.kind() {
                std::io::ErrorKind::WouldBlock => Err(Error::AlreadyOpen),
                _ => Err(err.into()),
            };
        }
        Ok(())
    }

    #[cfg(windows)]
    fn try_lock(file: &File) -> Result<()> {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::LockFileEx;
        use winapi::um::minwinbase::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};

        let handle = file.as_raw_handle();
        let result = unsafe {
            LockFileEx(
                handle as *mut _,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                !0,
                !0,
                std::ptr::null_mut(),
            )
        };
        if result == 0 {
            return Err(Error::AlreadyOpen);
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn try_lock(_file: &File) -> Result<()> {
        // No lock support on this platform; single ownership is then only
        // guaranteed within the process, by the registry.
        Ok(())
    }

    /// The lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // The OS releases the lock when the file handle closes. The file
        // itself stays behind; removing it here would race a new owner.
    }
}
