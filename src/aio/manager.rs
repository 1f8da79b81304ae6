//! The kernel-AIO context manager: owns the `io_context_t`, the completion
//! eventfd, and every [`AioRequest`] currently in flight.

use super::request::AioRequest;
use super::sys::{self, AioContextT, Iocb, IoEvent};
use crate::error::{Error, Result, SubmitError};
use anyhow::Context;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Owns a kernel AIO context sized for up to `capacity` concurrent requests,
/// plus the eventfd requests are bound to at submission time.
///
/// Requests move into the `Manager` on [`Manager::submit`] and back out of
/// it on [`Manager::harvest`] -- the manager, not the caller, is the sole
/// owner of a request while it is in flight, which is what lets the kernel
/// safely hold a raw pointer to it for the duration.
pub struct Manager<'a> {
    ctx: AioContextT,
    fd: RawFd,
    capacity: u32,
    pending: Vec<AioRequest<'a>>,
    iocb_scratch: Vec<Iocb>,
    ptr_scratch: Vec<*mut Iocb>,
    event_scratch: Vec<IoEvent>,
}

impl<'a> Manager<'a> {
    /// Set up a kernel AIO context able to hold `capacity` concurrent
    /// requests, and a non-blocking completion eventfd.
    pub fn new(capacity: u32) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::value("capacity must be greater than zero"));
        }

        let mut ctx: AioContextT = 0;
        let rc = unsafe { sys::io_setup(capacity as libc::c_int, &mut ctx) };
        if rc < 0 {
            // anyhow::Context chains a diagnostic message onto the raw errno
            // for the log line; the typed Error that actually crosses the
            // API boundary keeps the untouched io::Error so the caller's
            // errno survives, the same split the donor's engine modules use.
            let err = std::io::Error::last_os_error();
            let diagnostic: std::result::Result<(), anyhow::Error> = Err(std::io::Error::last_os_error())
                .context(format!("io_setup failed with capacity={}", capacity));
            log::debug!("aio::Manager::new: {:#}", diagnostic.unwrap_err());
            return Err(Error::System(err));
        }

        let fd = match sys::new_nonblocking_eventfd() {
            Ok(fd) => fd,
            Err(e) => {
                unsafe {
                    sys::io_destroy(ctx);
                }
                return Err(Error::System(e));
            }
        };

        Ok(Manager {
            ctx,
            fd,
            capacity,
            // Reserved up front and never exceeded (submit() enforces the
            // capacity precondition before pushing), so elements never move
            // once pushed: io_submit is handed each request's address
            // inside this Vec, and harvest() later matches completions back
            // to a pending entry by that same address.
            pending: Vec::with_capacity(capacity as usize),
            iocb_scratch: Vec::new(),
            ptr_scratch: Vec::new(),
            event_scratch: Vec::with_capacity(capacity as usize),
        })
    }

    /// The eventfd a caller's event loop should poll for readability; one or
    /// more completions are ready to [`harvest`](Self::harvest) whenever it
    /// becomes readable.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Number of requests currently submitted and awaiting completion.
    pub fn pending(&self) -> u32 {
        self.pending.len() as u32
    }

    /// Submit a batch of unsubmitted requests.
    ///
    /// Checked against remaining capacity before anything is touched, the
    /// same order of operations as the reference `IOManager_submit`: a
    /// request that would overflow the context is rejected before any
    /// `io_submit` call is made, so a capacity error never leaves a partial
    /// batch bound to the eventfd.
    ///
    /// The kernel itself may still only accept a prefix of the batch (e.g.
    /// if the underlying file rejects the operation immediately). On that
    /// path this returns `Err(SubmitError)` reporting how many requests were
    /// accepted -- those remain owned by the manager and will eventually
    /// complete -- and hands the unaccepted remainder back in `rejected`.
    pub fn submit(&mut self, reqs: Vec<AioRequest<'a>>) -> std::result::Result<(), SubmitError<AioRequest<'a>>> {
        let n = reqs.len();
        if n as u32 > self.capacity - self.pending.len() as u32 {
            return Err(SubmitError {
                source: Error::value("submit would exceed manager capacity"),
                accepted: 0,
                rejected: reqs,
            });
        }
        if reqs.iter().any(|r| r.submitted()) {
            return Err(SubmitError {
                source: Error::state("request was already submitted"),
                accepted: 0,
                rejected: reqs,
            });
        }

        // Move the batch into `pending` *before* taking each request's
        // address for its `iocb`: `pending`'s capacity is reserved for the
        // manager's lifetime, so this is the last time these requests move.
        // Building `iocb`s against addresses in the (about to be dropped)
        // caller-supplied `reqs` Vec would hand the kernel pointers that go
        // stale the instant `extend` relocates the requests.
        let start = self.pending.len();
        self.pending.extend(reqs);

        for req in &self.pending[start..] {
            req.mark_submitted().expect("submitted flag checked above");
        }

        self.iocb_scratch.clear();
        self.ptr_scratch.clear();
        for req in &self.pending[start..] {
            self.iocb_scratch.push(req.build_iocb(self.fd));
        }
        for iocb in self.iocb_scratch.iter_mut() {
            self.ptr_scratch.push(iocb as *mut Iocb);
        }

        let rc = unsafe {
            sys::io_submit(self.ctx, self.ptr_scratch.len() as libc::c_long, self.ptr_scratch.as_mut_ptr())
        };

        if rc < 0 {
            let rejected = self.pending.split_off(start);
            for req in &rejected {
                req.unmark_submitted();
            }
            return Err(SubmitError {
                source: Error::last_os_error(),
                accepted: 0,
                rejected,
            });
        }

        let accepted = rc as usize;
        log::debug!("aio::Manager::submit: {}/{} requests accepted", accepted, n);

        if accepted < n {
            let rejected = self.pending.split_off(start + accepted);
            for req in &rejected {
                req.unmark_submitted();
            }
            return Err(SubmitError {
                source: Error::state("kernel accepted only a prefix of the submitted batch"),
                accepted,
                rejected,
            });
        }

        Ok(())
    }

    /// Wait for at least `min_nr` completions (or until `timeout` elapses,
    /// if given) and return the completed requests, removed from the
    /// manager's ownership.
    ///
    /// Mirrors `IOManager_getevents`: a `min_nr` greater than the number of
    /// requests actually pending is rejected synchronously rather than
    /// blocking forever, and `pending` is left unchanged on that path.
    pub fn harvest(&mut self, min_nr: usize, timeout: Option<Duration>) -> Result<Vec<AioRequest<'a>>> {
        if min_nr > self.pending.len() {
            return Err(Error::value(format!(
                "min_nr ({}) exceeds pending request count ({})",
                min_nr,
                self.pending.len()
            )));
        }

        self.event_scratch.clear();
        self.event_scratch.resize(self.pending.len().max(1), IoEvent::zeroed());

        let mut ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_mut()
            .map(|t| t as *mut libc::timespec)
            .unwrap_or(std::ptr::null_mut());

        let rc = unsafe {
            sys::io_getevents(
                self.ctx,
                min_nr as libc::c_long,
                self.event_scratch.len() as libc::c_long,
                self.event_scratch.as_mut_ptr(),
                ts_ptr,
            )
        };

        if rc < 0 {
            return Err(Error::last_os_error());
        }

        let n = rc as usize;
        crate::util::drain(self.fd);

        let mut completed = Vec::with_capacity(n);
        for event in &self.event_scratch[..n] {
            let ptr = event.data as *const AioRequest<'a>;
            let idx = self
                .pending
                .iter()
                .position(|r| r as *const AioRequest<'a> == ptr)
                .ok_or_else(|| Error::runtime("completion for a request this manager does not own"))?;
            let mut req = self.pending.remove(idx);
            req.res = event.res;
            req.res2 = event.res2;
            completed.push(req);
        }

        log::debug!("aio::Manager::harvest: {} completion(s)", completed.len());
        Ok(completed)
    }
}

impl Drop for Manager<'_> {
    fn drop(&mut self) {
        unsafe {
            sys::io_destroy(self.ctx);
        }
        crate::util::close(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aio::{AioMode, AioRequest};
    use crate::region::ByteRegion;
    use std::fs::OpenOptions;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_read_roundtrip() {
        crate::util::init_test_logging();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("block.dat");
        let pattern: Vec<u8> = (0..65536u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &pattern).unwrap();

        let file = OpenOptions::new().read(true).open(&path).unwrap();
        let mut buf = vec![0u8; pattern.len()];
        let mut manager = Manager::new(4).unwrap();

        let req = AioRequest::new(AioMode::Read, ByteRegion::writable(&mut buf), &file, 0).unwrap();
        manager.submit(vec![req]).unwrap();
        assert_eq!(manager.pending(), 1);

        let mut completed = manager.harvest(1, None).unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(manager.pending(), 0);
        let rc = completed.remove(0).rc().unwrap();
        assert_eq!(rc, pattern.len() as i64);
        assert_eq!(buf, pattern);
    }

    #[test]
    fn test_submit_exceeding_capacity_rejected_before_kernel_submission() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("small.dat");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        let file = OpenOptions::new().read(true).open(&path).unwrap();

        let mut bufs: Vec<Vec<u8>> = (0..5).map(|_| vec![0u8; 4096]).collect();
        let mut manager = Manager::new(4).unwrap();

        let reqs: Vec<AioRequest> = bufs
            .iter_mut()
            .map(|b| AioRequest::new(AioMode::Read, ByteRegion::writable(b), &file, 0).unwrap())
            .collect();

        let err = manager.submit(reqs).unwrap_err();
        assert!(matches!(err.source, Error::Value(_)));
        assert_eq!(err.accepted, 0);
        assert_eq!(err.rejected.len(), 5);
        assert_eq!(manager.pending(), 0);
    }

    #[test]
    fn test_resubmitting_a_harvested_request_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("block.dat");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        let file = OpenOptions::new().read(true).open(&path).unwrap();

        let mut buf = vec![0u8; 4096];
        let mut manager = Manager::new(2).unwrap();
        let req = AioRequest::new(AioMode::Read, ByteRegion::writable(&mut buf), &file, 0).unwrap();
        manager.submit(vec![req]).unwrap();
        let mut completed = manager.harvest(1, None).unwrap();
        assert_eq!(completed.len(), 1);
        let req = completed.remove(0);
        assert!(req.submitted());

        let err = manager.submit(vec![req]).unwrap_err();
        assert!(matches!(err.source, Error::State(_)));
    }

    #[test]
    fn test_harvest_min_nr_exceeding_pending_is_rejected() {
        let mut manager = Manager::new(2).unwrap();
        let err = manager.harvest(1, Some(Duration::from_millis(10))).unwrap_err();
        assert!(matches!(err, Error::Value(_)));
        assert_eq!(manager.pending(), 0);
    }

    #[test]
    fn test_idempotent_harvest_on_idle_manager() {
        let mut manager = Manager::new(2).unwrap();
        let completed = manager.harvest(0, Some(Duration::from_millis(10))).unwrap();
        assert!(completed.is_empty());
        assert_eq!(manager.pending(), 0);
    }

    #[test]
    fn test_write_request_needs_only_read_access() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.dat");
        let file = OpenOptions::new().write(true).create(true).truncate(true).open(&path).unwrap();

        let payload = b"hello from a read-only source region".to_vec();
        let mut manager = Manager::new(2).unwrap();
        let req = AioRequest::new(AioMode::Write, ByteRegion::readonly(&payload), &file, 0).unwrap();
        manager.submit(vec![req]).unwrap();
        let mut completed = manager.harvest(1, None).unwrap();
        let rc = completed.remove(0).rc().unwrap();
        assert_eq!(rc, payload.len() as i64);

        drop(file);
        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(on_disk, payload);
    }
}
