use std::fs::File;
use std::os::unix::io::AsRawFd;

use crate::core::{Error, Result};

/// Exclusive advisory lock on a file, held until dropped.
///
/// `flock` locks belong to the open file description, so two handles opened
/// separately on the same path exclude each other even inside one process.
pub struct FileLockGuard<'a> {
    file: &'a File,
}

impl<'a> FileLockGuard<'a> {
    /// Blocks until the lock is acquired.
    pub fn acquire(file: &'a File) -> Result<Self> {
        loop {
            let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if res == 0 {
                return Ok(Self { file });
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(Error::Io(err));
            }
        }
    }
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}
