//! The four transfer strategies a [`super::Dispatcher`] worker runs,
//! selected by which kind of [`Endpoint`] each side of a request is.

use super::request::{BulkRequest, Endpoint};
use std::os::unix::io::RawFd;
use std::ptr;

/// Size of the heap buffer used for the portable (non-`splice`) fd-to-fd
/// fallback, matching the donor lineage's 1 MiB bounce-buffer constant.
const FALLBACK_BUF_SIZE: usize = 1024 * 1024;

/// Run one transfer attempt for `req`, advancing `req`'s remaining-length
/// counter and leaving an errno on `req` if it stopped early.
///
/// Always returns with either `req.missing_byte_count() == 0` (the whole
/// transfer completed) or a nonzero errno recorded on `req` explaining why
/// it stopped (including `EAGAIN`, which is not fatal -- the caller may
/// queue the same, now-partially-complete request again).
pub(super) fn copy_data(req: &mut BulkRequest, worker_pipe: Option<(RawFd, RawFd)>) {
    let errno = match (&req.src, &req.dst) {
        (Endpoint::File { .. }, Endpoint::File { .. }) => copy_fd2fd(req, worker_pipe),
        (Endpoint::Memory(_), Endpoint::File { .. }) => copy_mem2fd(req),
        (Endpoint::File { .. }, Endpoint::Memory(_)) => copy_fd2mem(req),
        (Endpoint::Memory(_), Endpoint::Memory(_)) => copy_mem2mem(req),
    };
    req.set_errno(errno.unwrap_or(0));
}

fn file_fd(ep: &Endpoint) -> RawFd {
    match ep {
        Endpoint::File { fd, .. } => *fd,
        Endpoint::Memory(_) => unreachable!("file_fd called on a Memory endpoint"),
    }
}

/// Bytes read from the source into the per-worker pipe but not accepted by
/// the destination on the same `copy_data` call land here, as plain owned
/// bytes rather than spliced pipe contents, so that:
///   1. the per-worker pipe is always empty again before this function
///      returns -- it is reused by whatever request this worker picks up
///      next, and leftover pipe bytes would silently corrupt that transfer;
///   2. the next `queue` on this request can resume with a plain `write`/
///      `pwrite` instead of re-deriving a splice offset for data that
///      already left the source.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn drain_pipe_into_stash(pipe_r: RawFd, leftover: usize) -> Vec<u8> {
    let mut stash = vec![0u8; leftover];
    let mut got = 0usize;
    while got < leftover {
        let rc = unsafe {
            libc::read(pipe_r, stash[got..].as_mut_ptr() as *mut libc::c_void, leftover - got)
        };
        if rc <= 0 {
            break;
        }
        got += rc as usize;
    }
    stash.truncate(got);
    stash
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn copy_fd2fd(req: &mut BulkRequest, worker_pipe: Option<(RawFd, RawFd)>) -> Option<i32> {
    let (pipe_r, pipe_w) = worker_pipe.expect("fd2fd transfers require a worker splice pipe");
    let src_fd = file_fd(&req.src);
    let dst_fd = file_fd(&req.dst);
    let src_base = match &req.src {
        Endpoint::File { offset: Some(o), .. } => Some(*o),
        _ => None,
    };
    let dst_base = match &req.dst {
        Endpoint::File { offset: Some(o), .. } => Some(*o),
        _ => None,
    };

    // Phase 1: a previous call may have left bytes stashed after a short
    // destination splice. Flush those to the destination with a plain
    // write before pulling anything further from the source -- resuming
    // the splice trampoline with unflushed stash content around would
    // reorder bytes.
    while req.tmpbuf_off < req.tmpbuf.len() {
        let delivered = req.len - req.rem;
        let off = dst_base.map(|o| o + delivered);
        match pwrite_or_write(dst_fd, &req.tmpbuf[req.tmpbuf_off..], off) {
            Ok(0) => return Some(libc::EIO),
            Ok(n) => {
                req.tmpbuf_off += n;
                req.rem -= n as u64;
            }
            Err(e) => return Some(e),
        }
    }
    if !req.tmpbuf.is_empty() {
        req.tmpbuf = Vec::new();
        req.tmpbuf_off = 0;
    }

    let mut src_pos = src_base.map(|o| (o + (req.len - req.rem)) as i64);
    let mut dst_pos = dst_base.map(|o| (o + (req.len - req.rem)) as i64);

    while req.rem > 0 {
        let chunk = req.rem.min(FALLBACK_BUF_SIZE as u64) as usize;
        let n_in = match splice_once(src_fd, src_pos.as_mut(), pipe_w, None, chunk) {
            Ok(0) => return Some(libc::EIO),
            Ok(n) => n,
            Err(e) => return Some(e),
        };

        let mut moved = 0usize;
        let mut stop = None;
        while moved < n_in {
            match splice_once(pipe_r, None, dst_fd, dst_pos.as_mut(), n_in - moved) {
                Ok(0) => {
                    stop = Some(libc::EIO);
                    break;
                }
                Ok(n) => moved += n,
                Err(e) => {
                    stop = Some(e);
                    break;
                }
            }
        }
        req.rem -= moved as u64;

        if moved < n_in {
            // The destination took a short splice: the remainder is stuck
            // in the worker's pipe and must come out now, win or lose.
            req.tmpbuf = drain_pipe_into_stash(pipe_r, n_in - moved);
            req.tmpbuf_off = 0;
            return stop;
        }
    }
    None
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn copy_fd2fd(req: &mut BulkRequest, _worker_pipe: Option<(RawFd, RawFd)>) -> Option<i32> {
    let src_fd = file_fd(&req.src);
    let dst_fd = file_fd(&req.dst);
    let src_offset = match &req.src {
        Endpoint::File { offset: Some(o), .. } => Some(*o),
        _ => None,
    };
    let dst_offset = match &req.dst {
        Endpoint::File { offset: Some(o), .. } => Some(*o),
        _ => None,
    };

    // Phase 1: flush whatever a short write left stashed on a previous call
    // before reading anything further from the source -- identical policy
    // to the splice trampoline's stash, just backed by a plain heap buffer.
    while req.tmpbuf_off < req.tmpbuf.len() {
        let delivered = req.len - req.rem;
        let off = dst_offset.map(|o| o + delivered);
        match pwrite_or_write(dst_fd, &req.tmpbuf[req.tmpbuf_off..], off) {
            Ok(0) => return Some(libc::EIO), // unexpected EOF before `rem` bytes were seen
            Ok(n) => {
                req.tmpbuf_off += n;
                req.rem -= n as u64;
            }
            Err(e) => return Some(e),
        }
    }
    if !req.tmpbuf.is_empty() {
        req.tmpbuf = Vec::new();
        req.tmpbuf_off = 0;
    }

    let mut buf = vec![0u8; FALLBACK_BUF_SIZE];
    while req.rem > 0 {
        let progress = req.len - req.rem;
        let chunk = req.rem.min(FALLBACK_BUF_SIZE as u64) as usize;

        let n_read = match pread_or_read(src_fd, &mut buf[..chunk], src_offset.map(|o| o + progress)) {
            Ok(0) => return Some(libc::EIO), // unexpected EOF before `rem` bytes were seen
            Ok(n) => n,
            Err(e) => return Some(e),
        };

        let mut written = 0usize;
        let mut stop = None;
        while written < n_read {
            let off = dst_offset.map(|o| o + progress + written as u64);
            match pwrite_or_write(dst_fd, &buf[written..n_read], off) {
                Ok(0) => {
                    stop = Some(libc::EIO); // unexpected EOF before `rem` bytes were seen
                    break;
                }
                Ok(n) => written += n,
                Err(e) => {
                    stop = Some(e);
                    break;
                }
            }
        }
        req.rem -= written as u64;

        if written < n_read {
            // The destination took a short write: stash what's left of this
            // chunk so the next call flushes it before reading further.
            req.tmpbuf = buf[written..n_read].to_vec();
            req.tmpbuf_off = 0;
            return stop;
        }
    }
    None
}

fn copy_mem2fd(req: &mut BulkRequest) -> Option<i32> {
    let dst_fd = file_fd(&req.dst);
    let dst_offset = match &req.dst {
        Endpoint::File { offset: Some(o), .. } => Some(*o),
        _ => None,
    };
    let src = match &req.src {
        Endpoint::Memory(buf) => buf,
        _ => unreachable!(),
    };

    while req.rem > 0 {
        let progress = (req.len - req.rem) as usize;
        let off = dst_offset.map(|o| o + progress as u64);
        match pwrite_or_write(dst_fd, &src[progress..req.len as usize], off) {
            Ok(0) => return Some(libc::EIO), // unexpected EOF before `rem` bytes were seen
            Ok(n) => req.rem -= n as u64,
            Err(e) => return Some(e),
        }
    }
    None
}

fn copy_fd2mem(req: &mut BulkRequest) -> Option<i32> {
    let src_fd = file_fd(&req.src);
    let src_offset = match &req.src {
        Endpoint::File { offset: Some(o), .. } => Some(*o),
        _ => None,
    };

    while req.rem > 0 {
        let progress = (req.len - req.rem) as usize;
        let off = src_offset.map(|o| o + progress as u64);
        let dst = match &mut req.dst {
            Endpoint::Memory(buf) => buf,
            _ => unreachable!(),
        };
        match pread_or_read(src_fd, &mut dst[progress..], off) {
            Ok(0) => return Some(libc::EIO), // unexpected EOF before `rem` bytes were seen
            Ok(n) => req.rem -= n as u64,
            Err(e) => return Some(e),
        }
    }
    None
}

/// Memory-to-memory transfers always copy between two distinct, separately
/// owned buffers (each `Endpoint::Memory` owns its `Vec<u8>` outright), so
/// unlike the reference implementation's `memmove`-based `cd_mem2mem` --
/// written against a buffer protocol where two views could alias the same
/// underlying storage -- a plain slice copy is sufficient here.
fn copy_mem2mem(req: &mut BulkRequest) -> Option<i32> {
    let progress = (req.len - req.rem) as usize;
    let end = req.len as usize;
    let src = match &req.src {
        Endpoint::Memory(buf) => buf.as_ptr(),
        _ => unreachable!(),
    };
    let dst = match &mut req.dst {
        Endpoint::Memory(buf) => buf.as_mut_ptr(),
        _ => unreachable!(),
    };
    unsafe {
        ptr::copy_nonoverlapping(src.add(progress), dst.add(progress), end - progress);
    }
    req.rem = 0;
    None
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn splice_once(
    fd_in: RawFd,
    off_in: Option<&mut i64>,
    fd_out: RawFd,
    off_out: Option<&mut i64>,
    len: usize,
) -> std::result::Result<usize, i32> {
    let off_in_ptr = off_in.map_or(ptr::null_mut(), |r| r as *mut i64);
    let off_out_ptr = off_out.map_or(ptr::null_mut(), |r| r as *mut i64);
    let rc = unsafe { libc::splice(fd_in, off_in_ptr, fd_out, off_out_ptr, len, libc::SPLICE_F_MOVE) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
    }
    Ok(rc as usize)
}

fn pread_or_read(fd: RawFd, buf: &mut [u8], offset: Option<u64>) -> std::result::Result<usize, i32> {
    let rc = match offset {
        Some(off) => unsafe {
            libc::pread(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), off as libc::off_t)
        },
        None => unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) },
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
    }
    Ok(rc as usize)
}

fn pwrite_or_write(fd: RawFd, buf: &[u8], offset: Option<u64>) -> std::result::Result<usize, i32> {
    let rc = match offset {
        Some(off) => unsafe {
            libc::pwrite(fd, buf.as_ptr() as *const libc::c_void, buf.len(), off as libc::off_t)
        },
        None => unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) },
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
    }
    Ok(rc as usize)
}
