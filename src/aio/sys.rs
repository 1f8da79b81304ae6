//! Raw bindings for the Linux kernel AIO syscalls (`io_setup`/`io_submit`/
//! `io_getevents`/`io_destroy`). These aren't wrapped by `libc` as ergonomic
//! functions -- only the syscall numbers and the `iocb`/`io_event` ABI
//! structs are needed, so we call through `libc::syscall` directly, the same
//! approach this codebase's lineage uses for its libaio engine (kept out of
//! a dedicated `libaio`-linking dependency to avoid its LGPL licensing).

use std::os::unix::io::RawFd;

/// Opaque kernel AIO context handle (`aio_context_t`).
pub type AioContextT = libc::c_ulong;

pub const IOCB_CMD_PREAD: u16 = 0;
pub const IOCB_CMD_PWRITE: u16 = 1;

/// Request eventfd notification on completion (`struct iocb.flags`).
pub const IOCB_FLAG_RESFD: u32 = 1 << 0;

/// `struct iocb`, matching the Linux kernel ABI consumed by `io_submit`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Iocb {
    pub aio_data: u64,
    pub aio_key: u32,
    pub aio_rw_flags: u32,
    pub aio_lio_opcode: u16,
    pub aio_reqprio: i16,
    pub aio_fildes: u32,
    pub aio_buf: u64,
    pub aio_nbytes: u64,
    pub aio_offset: i64,
    pub aio_reserved2: u64,
    pub aio_flags: u32,
    pub aio_resfd: u32,
}

impl Iocb {
    pub fn zeroed() -> Self {
        // Safety: the ABI struct is plain-old-data; all-zero is valid.
        unsafe { std::mem::zeroed() }
    }
}

/// `struct io_event`, matching the Linux kernel ABI produced by
/// `io_getevents`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IoEvent {
    pub data: u64,
    pub obj: u64,
    pub res: i64,
    pub res2: i64,
}

impl IoEvent {
    pub fn zeroed() -> Self {
        // Safety: plain-old-data ABI struct.
        unsafe { std::mem::zeroed() }
    }
}

pub unsafe fn io_setup(maxevents: libc::c_int, ctx: *mut AioContextT) -> libc::c_long {
    libc::syscall(libc::SYS_io_setup, maxevents, ctx)
}

pub unsafe fn io_destroy(ctx: AioContextT) -> libc::c_long {
    libc::syscall(libc::SYS_io_destroy, ctx)
}

pub unsafe fn io_submit(
    ctx: AioContextT,
    nr: libc::c_long,
    iocbpp: *mut *mut Iocb,
) -> libc::c_long {
    libc::syscall(libc::SYS_io_submit, ctx, nr, iocbpp)
}

pub unsafe fn io_getevents(
    ctx: AioContextT,
    min_nr: libc::c_long,
    max_nr: libc::c_long,
    events: *mut IoEvent,
    timeout: *mut libc::timespec,
) -> libc::c_long {
    libc::syscall(libc::SYS_io_getevents, ctx, min_nr, max_nr, events, timeout)
}

/// `eventfd(2)`/`F_SETFL` wrapper local to this module so `manager.rs`
/// doesn't need to reach into `crate::util` for a Linux-only primitive.
pub fn new_nonblocking_eventfd() -> std::io::Result<RawFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(fd)
}
