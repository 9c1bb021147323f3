//! Cross-process wake signal on a 32-bit word inside a shared mapping.
//!
//! On Linux this is a shared (non-private) futex, so a waker in one process
//! releases waiters in every process mapping the same file. Elsewhere the
//! wait degrades to a sleep of the full timeout.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::core::Result;

pub struct WakeWord<'a> {
    word: &'a AtomicU32,
}

impl<'a> WakeWord<'a> {
    pub fn new(word: &'a AtomicU32) -> Self {
        Self { word }
    }

    pub fn load(&self) -> u32 {
        self.word.load(Ordering::Acquire)
    }

    /// Blocks while the word still equals `seen`, for at most `timeout`.
    pub fn wait(&self, seen: u32, timeout: Duration) -> Result<()> {
        if self.load() != seen {
            return Ok(());
        }
        futex_wait(self.word, seen, timeout)
    }

    /// Advances the word and wakes every waiter.
    pub fn bump(&self) -> Result<()> {
        self.word.fetch_add(1, Ordering::AcqRel);
        futex_wake(self.word)
    }
}

#[cfg(target_os = "linux")]
fn futex_wait(word: &AtomicU32, expected: u32, timeout: Duration) -> Result<()> {
    use libc::{syscall, timespec, SYS_futex, EAGAIN, EINTR, ETIMEDOUT, FUTEX_WAIT};

    let ts = timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };
    let res = unsafe {
        syscall(
            SYS_futex,
            word.as_ptr(),
            FUTEX_WAIT,
            expected,
            &ts as *const timespec,
            std::ptr::null::<u32>(),
            0,
        )
    };
    if res == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == EAGAIN || code == EINTR || code == ETIMEDOUT => Ok(()),
        _ => Err(err.into()),
    }
}

#[cfg(target_os = "linux")]
fn futex_wake(word: &AtomicU32) -> Result<()> {
    use libc::{syscall, SYS_futex, FUTEX_WAKE};

    let res = unsafe {
        syscall(
            SYS_futex,
            word.as_ptr(),
            FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<u32>(),
            std::ptr::null::<u32>(),
            0,
        )
    };
    if res < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn futex_wait(_word: &AtomicU32, _expected: u32, timeout: Duration) -> Result<()> {
    std::thread::sleep(timeout);
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn futex_wake(_word: &AtomicU32) -> Result<()> {
    Ok(())
}
