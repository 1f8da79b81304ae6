//! A single queued bulk transfer, the unit of work a [`super::Dispatcher`]
//! worker processes.

use crate::error::{Error, Result};
use std::os::unix::io::RawFd;

/// One side of a transfer: either an open file descriptor (optionally at a
/// fixed offset, like `pread`/`pwrite`) or an owned memory buffer.
///
/// Memory endpoints own their buffer outright rather than borrowing it,
/// because a queued request is moved onto a worker thread for the duration
/// of the transfer -- the same transient-ownership discipline the AIO
/// Manager uses for in-flight requests, just with an owned buffer standing
/// in for a borrowed [`crate::region::ByteRegion`] since no lifetime can
/// span an arbitrary worker thread hop.
#[derive(Debug)]
pub enum Endpoint {
    File { fd: RawFd, offset: Option<u64> },
    Memory(Vec<u8>),
}

/// A transfer of `length` bytes from `src` to `dst`, along with an opaque
/// caller tag carried through unmodified.
///
/// Moves through `Created -> Queued -> Completed`, same as an `AioRequest`:
/// [`BulkRequest::queue`] hands ownership to a [`super::Dispatcher`], and
/// [`super::Dispatcher::harvest`] hands it back.
pub struct BulkRequest {
    pub(super) src: Endpoint,
    pub(super) dst: Endpoint,
    pub(super) len: u64,
    pub(super) rem: u64,
    pub(super) tmpbuf: Vec<u8>,
    pub(super) tmpbuf_off: usize,
    opaque: u64,
    errno: i32,
}

impl BulkRequest {
    /// Build a new, unqueued transfer.
    pub fn new(src: Endpoint, dst: Endpoint, length: u64, opaque: u64) -> Result<Self> {
        if length == 0 {
            return Err(Error::value("bulk transfer length must be greater than zero"));
        }
        if let Endpoint::Memory(buf) = &src {
            if (buf.len() as u64) < length {
                return Err(Error::value("source memory buffer shorter than the requested length"));
            }
        }
        if let Endpoint::Memory(buf) = &dst {
            if (buf.len() as u64) < length {
                return Err(Error::value(
                    "destination memory buffer shorter than the requested length",
                ));
            }
        }
        Ok(BulkRequest {
            src,
            dst,
            len: length,
            rem: length,
            tmpbuf: Vec::new(),
            tmpbuf_off: 0,
            opaque,
            errno: 0,
        })
    }

    pub fn opaque(&self) -> u64 {
        self.opaque
    }

    pub fn set_opaque(&mut self, value: u64) {
        self.opaque = value;
    }

    pub fn errno(&self) -> i32 {
        self.errno
    }

    pub(super) fn set_errno(&mut self, value: i32) {
        self.errno = value;
    }

    /// Bytes not yet transferred. Nonzero after [`Dispatcher::harvest`]
    /// means the request stopped early (see [`errno`](Self::errno)) and can
    /// be handed to [`queue`](Self::queue) again to resume it.
    pub fn missing_byte_count(&self) -> u64 {
        self.rem
    }

    /// `Ok(())` if the last transfer attempt completed cleanly, otherwise
    /// the OS error captured from it.
    pub fn get_errors(&self) -> Result<()> {
        if self.errno == 0 {
            Ok(())
        } else {
            Err(Error::from_errno(self.errno))
        }
    }

    /// Consume ownership of both endpoints, e.g. to read a `Memory`
    /// destination buffer back out after a completed transfer.
    pub fn into_endpoints(self) -> (Endpoint, Endpoint) {
        (self.src, self.dst)
    }

    /// Hand this request to `dispatcher`'s worker pool.
    ///
    /// The `Unqueued` precondition is enforced structurally: `queue` takes
    /// `self` by value, and the only way to get a `BulkRequest` back once
    /// queued is from [`super::Dispatcher::harvest`], which is exactly when
    /// the state machine says it becomes `Unqueued` again. The one runtime
    /// precondition left to check is `missing_byte_count() > 0`.
    pub fn queue(mut self, dispatcher: &super::Dispatcher) -> Result<()> {
        if self.rem == 0 {
            return Err(Error::value("bulk transfer has no remaining bytes to queue"));
        }
        self.errno = 0;
        dispatcher.enqueue(self)
    }
}
