//! Full-range advisory write lock on a capture file.
//!
//! The capture worker takes a lock over the whole file around each append.
//! Readers take the same lock only long enough to sample the end of file or
//! to retry a short transport write. The guard releases on drop so every
//! exit path unlocks.

use std::fs::File;
use std::io;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Held write lock on a capture file. Released when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct CaptureLock<'a> {
    file: &'a File,
}

impl<'a> CaptureLock<'a> {
    /// Block until a write lock over the whole file is granted.
    pub fn acquire(file: &'a File) -> io::Result<Self> {
        set_lock(file, LockOp::Write, true)?;
        Ok(Self { file })
    }
}

impl Drop for CaptureLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = set_lock(self.file, LockOp::Unlock, false) {
            tracing::warn!("Couldn't unlock capture file: {}", e);
        }
    }
}

#[derive(Clone, Copy)]
enum LockOp {
    Write,
    Unlock,
}

/// Issue an fcntl record lock covering the whole file (Unix only)
#[cfg(unix)]
fn set_lock(file: &File, op: LockOp, wait: bool) -> io::Result<()> {
    use libc::{c_short, fcntl, flock, F_SETLK, F_SETLKW, F_UNLCK, F_WRLCK, SEEK_SET};

    // SAFETY: flock is a plain C struct; all-zero is a valid value and
    // l_start = l_len = 0 selects the whole file.
    let mut lock: flock = unsafe { std::mem::zeroed() };
    lock.l_type = match op {
        LockOp::Write => F_WRLCK as c_short,
        LockOp::Unlock => F_UNLCK as c_short,
    };
    lock.l_whence = SEEK_SET as c_short;
    lock.l_start = 0;
    lock.l_len = 0;

    let cmd = if wait { F_SETLKW } else { F_SETLK };
    loop {
        // SAFETY: the descriptor is owned by `file` and outlives the call.
        let result = unsafe { fcntl(file.as_raw_fd(), cmd, &lock as *const flock) };
        if result == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// No-op lock for non-Unix platforms
#[cfg(not(unix))]
fn set_lock(_file: &File, _op: LockOp, _wait: bool) -> io::Result<()> {
    Ok(())
}
