//! The bulk transfer worker pool: a FIFO request queue feeding a fixed set
//! of worker threads, a shared result set, and a single signal pipe whose
//! read end a caller's event loop polls for readability.

use super::copy;
use super::request::{BulkRequest, Endpoint};
use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

type ReqQueue = Arc<(Mutex<VecDeque<BulkRequest>>, Condvar)>;
type ResultSet = Arc<Mutex<Vec<BulkRequest>>>;

/// A fixed-size pool of worker threads that perform bulk data transfers off
/// the caller's thread, surfaced through a single pollable descriptor.
pub struct Dispatcher {
    reqs: ReqQueue,
    active: Arc<AtomicBool>,
    results: ResultSet,
    spfd: (RawFd, RawFd),
    workers: Vec<thread::JoinHandle<()>>,
    worker_pipes: Vec<Option<(RawFd, RawFd)>>,
}

impl Dispatcher {
    /// Spin up `worker_count` worker threads, each with its own private
    /// splice trampoline pipe on Linux.
    pub fn new(worker_count: usize) -> Result<Self> {
        if worker_count == 0 {
            return Err(Error::value("worker_count must be greater than zero"));
        }

        let (spfd_r, spfd_w) = crate::util::nonblocking_pipe()?;
        let reqs: ReqQueue = Arc::new((Mutex::new(VecDeque::new()), Condvar::new()));
        let active = Arc::new(AtomicBool::new(true));
        let results: ResultSet = Arc::new(Mutex::new(Vec::new()));

        let mut workers = Vec::with_capacity(worker_count);
        let mut worker_pipes = Vec::with_capacity(worker_count);

        for _ in 0..worker_count {
            let worker_pipe = new_worker_pipe()?;
            worker_pipes.push(worker_pipe);

            let reqs = Arc::clone(&reqs);
            let active = Arc::clone(&active);
            let results = Arc::clone(&results);
            workers.push(thread::spawn(move || {
                worker_loop(reqs, active, results, spfd_w, worker_pipe);
            }));
        }

        log::debug!("bulk::Dispatcher::new: {} worker thread(s) started", worker_count);
        Ok(Dispatcher {
            reqs,
            active,
            results,
            spfd: (spfd_r, spfd_w),
            workers,
            worker_pipes,
        })
    }

    pub(super) fn enqueue(&self, req: BulkRequest) -> Result<()> {
        let (mtx, cond) = &*self.reqs;
        let mut guard = mtx.lock().unwrap();
        guard.push_back(req);
        cond.notify_one();
        Ok(())
    }

    /// Every request that has completed (or stopped early) since the last
    /// call, in the order their transfers finished.
    pub fn harvest(&self) -> Vec<BulkRequest> {
        let mut res = self.results.lock().unwrap();
        let drained = std::mem::take(&mut *res);
        drop(res);
        crate::util::drain(self.spfd.0);
        drained
    }

    /// Requests queued but not yet picked up by a worker.
    pub fn pending_count(&self) -> usize {
        let (mtx, _) = &*self.reqs;
        mtx.lock().unwrap().len()
    }

    /// Descriptor a caller's event loop should poll for readability;
    /// readable whenever [`harvest`](Self::harvest) has something to
    /// return.
    pub fn fileno(&self) -> RawFd {
        self.spfd.0
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn new_worker_pipe() -> Result<Option<(RawFd, RawFd)>> {
    Ok(Some(crate::util::blocking_pipe()?))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn new_worker_pipe() -> Result<Option<(RawFd, RawFd)>> {
    Ok(None)
}

fn worker_loop(
    reqs: ReqQueue,
    active: Arc<AtomicBool>,
    results: ResultSet,
    spfd_write: RawFd,
    worker_pipe: Option<(RawFd, RawFd)>,
) {
    loop {
        let mut req = {
            let (mtx, cond) = &*reqs;
            let mut guard = mtx.lock().unwrap();
            while active.load(Ordering::SeqCst) && guard.is_empty() {
                guard = cond.wait(guard).unwrap();
            }
            match guard.pop_front() {
                Some(req) => req,
                None => return,
            }
        };

        copy::copy_data(&mut req, worker_pipe);

        let mut res = results.lock().unwrap();
        let was_empty = res.is_empty();
        res.push(req);
        drop(res);
        if was_empty {
            crate::util::write_wakeup_byte(spfd_write);
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        {
            let (mtx, cond) = &*self.reqs;
            let _guard = mtx.lock().unwrap();
            self.active.store(false, Ordering::SeqCst);
            cond.notify_all();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        for pipe in self.worker_pipes.drain(..) {
            if let Some((r, w)) = pipe {
                crate::util::close(r);
                crate::util::close(w);
            }
        }
        crate::util::close(self.spfd.0);
        crate::util::close(self.spfd.1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::BulkRequest;
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;
    use tempfile::TempDir;

    /// Poll `fd` for readability, up to `timeout_ms`. Used by tests instead
    /// of a full event loop to wait for the dispatcher's completion pipe.
    fn wait_readable(fd: RawFd, timeout_ms: i32) -> bool {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        rc > 0 && (pfd.revents & libc::POLLIN) != 0
    }

    fn harvest_all(dispatcher: &Dispatcher, expected: usize, timeout_ms: i32) -> Vec<BulkRequest> {
        let mut out = Vec::new();
        while out.len() < expected {
            assert!(wait_readable(dispatcher.fileno(), timeout_ms), "timed out waiting for a result");
            out.extend(dispatcher.harvest());
        }
        out
    }

    #[test]
    fn test_worker_count_zero_rejected() {
        assert!(matches!(Dispatcher::new(0), Err(Error::Value(_))));
    }

    #[test]
    fn test_mem2mem_roundtrip() {
        crate::util::init_test_logging();
        let dispatcher = Dispatcher::new(1).unwrap();
        let src = vec![7u8; 4096];
        let dst = vec![0u8; 4096];
        let req = BulkRequest::new(
            Endpoint::Memory(src.clone()),
            Endpoint::Memory(dst),
            4096,
            42,
        )
        .unwrap();
        req.queue(&dispatcher).unwrap();

        let mut completed = harvest_all(&dispatcher, 1, 1000);
        assert_eq!(completed.len(), 1);
        let req = completed.remove(0);
        assert_eq!(req.missing_byte_count(), 0);
        req.get_errors().unwrap();
        assert_eq!(req.opaque(), 42);

        let (_, dst) = req.into_endpoints();
        match dst {
            Endpoint::Memory(buf) => assert_eq!(buf, src),
            _ => panic!("expected a memory destination"),
        }
    }

    #[test]
    fn test_fd2fd_roundtrip_multiple_transfers() {
        let dir = TempDir::new().unwrap();
        let src_path = dir.path().join("src.dat");
        let dst_path = dir.path().join("dst.dat");
        let payload: Vec<u8> = (0..(4096 * 4)).map(|i| (i % 256) as u8).collect();
        std::fs::write(&src_path, &payload).unwrap();
        std::fs::write(&dst_path, vec![0u8; payload.len() * 10]).unwrap();

        let src_file = OpenOptions::new().read(true).open(&src_path).unwrap();
        let dst_file = OpenOptions::new().write(true).open(&dst_path).unwrap();

        let dispatcher = Dispatcher::new(2).unwrap();
        const TRANSFERS: u64 = 10;
        for i in 0..TRANSFERS {
            let req = BulkRequest::new(
                Endpoint::File { fd: src_file.as_raw_fd(), offset: Some(0) },
                Endpoint::File { fd: dst_file.as_raw_fd(), offset: Some(i * payload.len() as u64) },
                payload.len() as u64,
                i,
            )
            .unwrap();
            req.queue(&dispatcher).unwrap();
        }

        let completed = harvest_all(&dispatcher, TRANSFERS as usize, 5000);
        assert_eq!(completed.len(), TRANSFERS as usize);
        for req in &completed {
            assert_eq!(req.missing_byte_count(), 0);
            req.get_errors().unwrap();
        }
        assert_eq!(dispatcher.pending_count(), 0);

        let on_disk = std::fs::read(&dst_path).unwrap();
        for i in 0..TRANSFERS as usize {
            let start = i * payload.len();
            assert_eq!(&on_disk[start..start + payload.len()], &payload[..]);
        }
    }

    #[test]
    fn test_fd2mem_and_mem2fd_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("block.dat");
        let payload: Vec<u8> = (0..8192u32).map(|i| (i % 256) as u8).collect();
        std::fs::write(&path, &payload).unwrap();

        let dispatcher = Dispatcher::new(1).unwrap();
        let read_file = OpenOptions::new().read(true).open(&path).unwrap();
        let dst_buf = vec![0u8; payload.len()];
        let req = BulkRequest::new(
            Endpoint::File { fd: read_file.as_raw_fd(), offset: Some(0) },
            Endpoint::Memory(dst_buf),
            payload.len() as u64,
            0,
        )
        .unwrap();
        req.queue(&dispatcher).unwrap();
        let mut completed = harvest_all(&dispatcher, 1, 1000);
        let req = completed.remove(0);
        assert_eq!(req.missing_byte_count(), 0);
        let (_, dst) = req.into_endpoints();
        match dst {
            Endpoint::Memory(buf) => assert_eq!(buf, payload),
            _ => panic!("expected a memory destination"),
        }

        let out_path = dir.path().join("out.dat");
        let write_file = OpenOptions::new().write(true).create(true).truncate(true).open(&out_path).unwrap();
        let req = BulkRequest::new(
            Endpoint::Memory(payload.clone()),
            Endpoint::File { fd: write_file.as_raw_fd(), offset: Some(0) },
            payload.len() as u64,
            0,
        )
        .unwrap();
        req.queue(&dispatcher).unwrap();
        let completed = harvest_all(&dispatcher, 1, 1000);
        assert_eq!(completed[0].missing_byte_count(), 0);
        drop(write_file);
        assert_eq!(std::fs::read(&out_path).unwrap(), payload);
    }

    #[test]
    fn test_resumption_on_a_slow_pipe_destination() {
        let mut fds: [libc::c_int; 2] = [-1, -1];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
        assert_eq!(rc, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);
        // Shrink the pipe so a single write is guaranteed to be short against
        // the transfer length below (falls back to the default size if the
        // platform/kernel disallows F_SETPIPE_SZ, which only shrinks the
        // margin of the test, not its correctness).
        unsafe {
            libc::fcntl(write_fd, libc::F_SETPIPE_SZ, 4096);
        }

        let payload: Vec<u8> = (0..(64 * 1024u32)).map(|i| (i % 256) as u8).collect();
        let dispatcher = Dispatcher::new(1).unwrap();
        let mut req = Some(
            BulkRequest::new(
                Endpoint::Memory(payload.clone()),
                Endpoint::File { fd: write_fd, offset: None },
                payload.len() as u64,
                0,
            )
            .unwrap(),
        );

        let mut received = Vec::new();
        let mut read_buf = [0u8; 4096];
        let mut cycles = 0;
        while received.len() < payload.len() {
            cycles += 1;
            assert!(cycles < 10_000, "resumption never converged");

            if let Some(r) = req.take() {
                r.queue(&dispatcher).unwrap();
            }
            if wait_readable(dispatcher.fileno(), 50) {
                for r in dispatcher.harvest() {
                    if r.missing_byte_count() > 0 {
                        req = Some(r);
                    }
                }
            }

            // Drain whatever the writer has managed to push so far, so the
            // pipe has room for the next round.
            loop {
                let n = unsafe {
                    libc::read(read_fd, read_buf.as_mut_ptr() as *mut libc::c_void, read_buf.len())
                };
                if n <= 0 {
                    break;
                }
                received.extend_from_slice(&read_buf[..n as usize]);
            }
        }

        assert_eq!(received, payload);
        crate::util::close(read_fd);
        crate::util::close(write_fd);
    }
}
