//! A single pread/pwrite request submitted to an [`super::Manager`].

use super::sys::{Iocb, IOCB_CMD_PREAD, IOCB_CMD_PWRITE};
use crate::error::{Error, Result};
use crate::region::ByteRegion;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether a request reads into, or writes from, its [`ByteRegion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AioMode {
    Read,
    Write,
}

/// A single kernel-AIO read or write, bound to one open file descriptor.
///
/// Created unsubmitted; becomes submitted exactly once when handed to a
/// [`super::Manager::submit`], and completed once returned from
/// [`super::Manager::harvest`]. See the crate-level state machine:
/// `Created -> Submitted -> Completed`.
pub struct AioRequest<'a> {
    pub(super) region: ByteRegion<'a>,
    pub(super) fd: RawFd,
    pub(super) offset: u64,
    pub(super) mode: AioMode,
    submitted: AtomicBool,
    pub(super) res: i64,
    pub(super) res2: i64,
}

impl<'a> AioRequest<'a> {
    /// Create a new, unsubmitted request.
    ///
    /// WRITE requests need only a readable region; READ requests need a
    /// writable one (the kernel will write into it). `file` is borrowed only
    /// to obtain its descriptor -- the caller retains ownership and must
    /// keep it open until the request completes.
    pub fn new(
        mode: AioMode,
        region: ByteRegion<'a>,
        file: &impl AsRawFd,
        offset: u64,
    ) -> Result<Self> {
        // WRITE accepts either access level (the kernel only reads the
        // region); READ needs ReadWrite so the kernel has somewhere to
        // write the result.
        if mode == AioMode::Read && region.access() != crate::region::Access::ReadWrite {
            return Err(Error::value("READ requests need a writable ByteRegion"));
        }

        Ok(AioRequest {
            region,
            fd: file.as_raw_fd(),
            offset,
            mode,
            submitted: AtomicBool::new(false),
            res: 0,
            res2: 0,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn mode(&self) -> AioMode {
        self.mode
    }

    pub fn submitted(&self) -> bool {
        self.submitted.load(Ordering::Acquire)
    }

    /// Mark this request submitted. Returns an error if it already was.
    pub(super) fn mark_submitted(&self) -> Result<()> {
        if self
            .submitted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::state("request was already submitted"));
        }
        Ok(())
    }

    /// Unmark submission; used to roll back a request that the kernel
    /// rejected as part of a partially-accepted batch.
    pub(super) fn unmark_submitted(&self) {
        self.submitted.store(false, Ordering::Release);
    }

    /// The primary/secondary result fields set by `harvest`.
    ///
    /// Matches `io_event.res`/`res2` semantics exactly: `res2 == 0` or
    /// `res2 < 0` both report `res` as the return code. A positive `res2` is
    /// outside the documented kernel contract for PREAD/PWRITE completions
    /// and is surfaced as `Error::Runtime` rather than silently accepted.
    pub fn rc(&self) -> Result<i64> {
        if self.res2 <= 0 {
            return Ok(self.res);
        }
        Err(Error::runtime(format!(
            "positive secondary status (res2={}) is not a valid AIO completion",
            self.res2
        )))
    }

    /// Build the kernel `iocb` for submission. Caller must have already
    /// validated `submitted == false`.
    pub(super) fn build_iocb(&self, resfd: RawFd) -> Iocb {
        let mut iocb = Iocb::zeroed();
        iocb.aio_data = self as *const Self as u64;
        iocb.aio_lio_opcode = match self.mode {
            AioMode::Read => IOCB_CMD_PREAD,
            AioMode::Write => IOCB_CMD_PWRITE,
        };
        iocb.aio_fildes = self.fd as u32;
        iocb.aio_buf = self.region.as_mut_ptr() as u64;
        iocb.aio_nbytes = self.region.len() as u64;
        iocb.aio_offset = self.offset as i64;
        iocb.aio_flags = super::sys::IOCB_FLAG_RESFD;
        iocb.aio_resfd = resfd as u32;
        iocb
    }
}

// Safety: an AioRequest only exposes its region through the kernel, which is
// handed a raw pointer/length pair for the submission's duration; no two
// requests alias the same bytes unless the caller violates the ByteRegion
// borrow contract.
unsafe impl Send for AioRequest<'_> {}
