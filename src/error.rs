//! The typed error taxonomy shared by every subsystem in this crate.
//!
//! Every public operation fails into one of a small set of categories rather
//! than a single opaque error: callers that drive an event loop need to
//! distinguish "you gave me a bad argument" from "the kernel rejected this"
//! from "you called this out of order".

use std::fmt;

/// Result alias used throughout the public API.
pub type Result<T> = std::result::Result<T, Error>;

/// The error taxonomy for AIO, signal capture, and bulk transfer operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A precondition violation detectable synchronously: bad capacity,
    /// negative argument, mis-sized memory region, wrong mode.
    #[error("invalid value: {0}")]
    Value(String),

    /// The wrong kind of argument was supplied.
    #[error("wrong type: {0}")]
    Type(String),

    /// The operation is invalid in the object's current state (already
    /// submitted, already queued, remaining length zero).
    #[error("invalid state: {0}")]
    State(String),

    /// An underlying OS call failed. Carries the original `io::Error` (and
    /// therefore the errno) untouched.
    #[error("system call failed: {0}")]
    System(#[from] std::io::Error),

    /// An integer conversion went out of range.
    #[error("integer overflow: {0}")]
    Overflow(String),

    /// A memory allocation failed.
    #[error("allocation failed: {0}")]
    Memory(String),

    /// An internal consistency check failed. Reserved for situations the
    /// kernel contract says should be unreachable (see the AIO `rc()`
    /// accessor's handling of a positive secondary status).
    #[error("internal error: {0}")]
    Runtime(String),
}

impl Error {
    pub(crate) fn value(msg: impl Into<String>) -> Self {
        Error::Value(msg.into())
    }

    pub(crate) fn state(msg: impl Into<String>) -> Self {
        Error::State(msg.into())
    }

    pub(crate) fn runtime(msg: impl Into<String>) -> Self {
        Error::Runtime(msg.into())
    }

    /// Build a `System` error from the current value of `errno`.
    pub(crate) fn last_os_error() -> Self {
        Error::System(std::io::Error::last_os_error())
    }

    pub(crate) fn from_errno(errno: i32) -> Self {
        Error::System(std::io::Error::from_raw_os_error(errno))
    }
}

/// The outcome of a partially-accepted AIO `submit` batch: the kernel error
/// that stopped submission, how many requests it actually accepted (and
/// which therefore remain submitted), and the unsubmitted remainder handed
/// back to the caller.
#[derive(Debug)]
pub struct SubmitError<R> {
    pub source: Error,
    pub accepted: usize,
    pub rejected: Vec<R>,
}

impl<R: fmt::Debug> fmt::Display for SubmitError<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "submit failed after accepting {} request(s): {}",
            self.accepted, self.source
        )
    }
}

impl<R: fmt::Debug> std::error::Error for SubmitError<R> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}
