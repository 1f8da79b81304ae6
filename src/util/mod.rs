//! Small shared helpers for raw-fd plumbing, generalized from the donor's
//! `util::resource` / `util::buffer` split: everything here is a thin,
//! well-tested wrapper around a single syscall rather than a subsystem of
//! its own.

use crate::error::{Error, Result};
use std::os::unix::io::RawFd;

/// Create a non-blocking pipe, returning `(read_fd, write_fd)`.
///
/// Uses `pipe2(O_NONBLOCK)` where available (Linux) to avoid a TOCTOU window
/// between `pipe()` and the subsequent `fcntl`.
pub(crate) fn nonblocking_pipe() -> Result<(RawFd, RawFd)> {
    let mut fds: [libc::c_int; 2] = [-1, -1];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

/// Create a plain blocking pipe, returning `(read_fd, write_fd)`.
///
/// Used for the per-worker `splice(2)` trampoline pipe in the bulk transfer
/// dispatcher, where the worker thread is expected to block on it rather
/// than spin on `EAGAIN`.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn blocking_pipe() -> Result<(RawFd, RawFd)> {
    let mut fds: [libc::c_int; 2] = [-1, -1];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc < 0 {
        return Err(Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

/// Drain a non-blocking fd completely, ignoring `EAGAIN`/`EWOULDBLOCK`.
///
/// All signaling descriptors this crate exposes are non-blocking single-byte
/// wakeups; harvesting must always drain them fully so a stale readable
/// state never causes the event loop to spin.
pub(crate) fn drain(fd: RawFd) {
    let mut buf = [0u8; 4096];
    loop {
        let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if rc > 0 {
            continue;
        }
        break;
    }
}

/// Write a single wakeup byte to `fd`, ignoring `EAGAIN` (the reader may not
/// have drained yet, or the descriptor may already carry a pending wakeup).
pub(crate) fn write_wakeup_byte(fd: RawFd) {
    let byte: u8 = 1;
    unsafe {
        libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
    }
}

pub(crate) fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Initialize `env_logger` once per test binary, ignoring the "already
/// initialized" error from a prior test in the same run -- same pattern as
/// `tokio-rs-mio`'s `tests/util/mod.rs`.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = env_logger::try_init();
}
