//! Async-signal-safe capture of delivered signals into a double-buffered
//! slot pair, harvested by a non-signal context.
//!
//! This is a process-wide singleton (signal delivery is a process-wide
//! concept in POSIX). The handler installed by [`install`] only touches
//! atomics, a preallocated buffer, and `write(2)` -- every operation on the
//! [async-signal-safe
//! list](https://man7.org/linux/man-pages/man7/signal-safety.7.html).
//!
//! Coordination between the handler and [`harvest`]/[`resize`]/[`set_hp`]
//! is the same mechanism the reference implementation uses:
//! `sigprocmask(SIG_SETMASK, ...)` blocks the signals this module manages
//! on the calling thread for the duration of a buffer swap, so the handler
//! cannot observe a half-updated pointer. This assumes the caller either
//! drives signal handling from a single thread, or blocks the same signals
//! on every other thread -- the same assumption a single-threaded C program
//! (or a GIL-serialized one) gets for free.

use super::siginfo::SigInfo;
use super::sigset::{SaFlags, SignalSet};
use crate::error::{Error, Result};
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;

const DEFAULT_CAPACITY: usize = 64;

struct Buffer {
    slots: Box<[std::cell::UnsafeCell<libc::siginfo_t>]>,
    used: AtomicUsize,
}

// Safety: `slots` is only ever mutated by the signal handler while this
// buffer is the current front buffer, and only ever read by `harvest` after
// it has been swapped out from under the handler under blocked signals.
unsafe impl Sync for Buffer {}

impl Buffer {
    fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| std::cell::UnsafeCell::new(unsafe { std::mem::zeroed() }))
            .collect();
        Buffer {
            slots,
            used: AtomicUsize::new(0),
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }
}

static FRONT: AtomicPtr<Buffer> = AtomicPtr::new(ptr::null_mut());
static BACK: AtomicPtr<Buffer> = AtomicPtr::new(ptr::null_mut());
static NONEMPTY: AtomicBool = AtomicBool::new(false);
static HP_SET: AtomicPtr<libc::sigset_t> = AtomicPtr::new(ptr::null_mut());
static WAKEUP_FD: AtomicI32 = AtomicI32::new(-1);

/// Serializes `install`/`resize`/`set_hp`/`set_wakeup_fd`/`harvest` against
/// each other. Does not serialize against the handler -- that's `sigprocmask`'s
/// job, per signal, per call.
static GUARD: Mutex<()> = Mutex::new(());

/// The set of every signal this process has installed a handler for via
/// [`install`], used as the mask blocked during a buffer swap.
static ALL_SIGNALS: Mutex<Option<SignalSet>> = Mutex::new(None);

fn ensure_buffers() {
    if FRONT.load(Ordering::SeqCst).is_null() {
        FRONT.store(Box::into_raw(Box::new(Buffer::new(DEFAULT_CAPACITY))), Ordering::SeqCst);
        BACK.store(Box::into_raw(Box::new(Buffer::new(DEFAULT_CAPACITY))), Ordering::SeqCst);
    }
}

extern "C" fn sig_handler(signo: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    if info.is_null() {
        return;
    }
    let front = FRONT.load(Ordering::SeqCst);
    if front.is_null() {
        return;
    }
    let buf = unsafe { &*front };
    let capacity = buf.capacity();
    let used = buf.used.load(Ordering::SeqCst);

    if used >= capacity {
        let hp = HP_SET.load(Ordering::SeqCst);
        let is_hp = !hp.is_null() && unsafe { libc::sigismember(hp, signo) == 1 };
        if is_hp && capacity > 0 {
            unsafe {
                *buf.slots[capacity - 1].get() = *info;
            }
        }
        return;
    }

    unsafe {
        *buf.slots[used].get() = *info;
    }
    buf.used.store(used + 1, Ordering::SeqCst);

    if used == 0 {
        NONEMPTY.store(true, Ordering::SeqCst);
        let fd = WAKEUP_FD.load(Ordering::SeqCst);
        if fd >= 0 {
            let byte: u8 = 1;
            unsafe {
                libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
            }
        }
    }
}

/// Install this module's handler for `signal` with the given `sigaction`
/// flags. `SA_SIGINFO` is implied and need not be passed.
///
/// Safe to call more than once for the same signal (reinstalls); each call
/// adds `signal` to the mask blocked during a buffer swap.
pub fn install(signal: i32, flags: SaFlags) -> Result<()> {
    let _guard = GUARD.lock().unwrap();
    ensure_buffers();

    let mut all = ALL_SIGNALS.lock().unwrap();
    let mut set = all.unwrap_or_else(SignalSet::empty);
    set.add(signal)?;
    *all = Some(set);
    drop(all);

    let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
    sa.sa_sigaction = sig_handler as usize;
    sa.sa_flags = libc::SA_SIGINFO | flags.bits();
    unsafe {
        libc::sigfillset(&mut sa.sa_mask);
    }

    let rc = unsafe { libc::sigaction(signal, &sa, ptr::null_mut()) };
    if rc < 0 {
        return Err(Error::last_os_error());
    }
    log::debug!("signal::install: signal {} installed", signal);
    Ok(())
}

/// Replace the high-priority signal set used to decide which signals may
/// overwrite the last slot once a buffer is full, returning the previous
/// set (`None` the first time this is called).
pub fn set_hp(set: Option<SignalSet>) -> Option<SignalSet> {
    let _guard = GUARD.lock().unwrap();

    // The handler dereferences `HP_SET` between its own `load` and the
    // `sigismember` call on it; freeing the previous set's allocation must
    // wait until no handler invocation on this thread can still be holding
    // that pointer, the same `sigprocmask` discipline `resize`/`harvest` use.
    let all = ALL_SIGNALS.lock().unwrap();
    let mut old_mask: libc::sigset_t = unsafe { std::mem::zeroed() };
    if let Some(managed) = all.as_ref() {
        unsafe {
            libc::sigprocmask(libc::SIG_SETMASK, managed.as_raw(), &mut old_mask);
        }
    }
    drop(all);

    let new_ptr = match set {
        Some(s) => Box::into_raw(Box::new(*s.as_raw())),
        None => ptr::null_mut(),
    };
    let old_ptr = HP_SET.swap(new_ptr, Ordering::SeqCst);

    unsafe {
        libc::sigprocmask(libc::SIG_SETMASK, &old_mask, ptr::null_mut());
    }

    if old_ptr.is_null() {
        None
    } else {
        let raw = unsafe { *Box::from_raw(old_ptr) };
        Some(SignalSet::from_raw(raw))
    }
}

/// Replace the wakeup descriptor written to on the buffer's 0-to-nonempty
/// transition, returning the previous one. Pass `None` to disable wakeups.
pub fn set_wakeup_fd(fd: Option<RawFd>) -> Option<RawFd> {
    let _guard = GUARD.lock().unwrap();

    let all = ALL_SIGNALS.lock().unwrap();
    let mut old_mask: libc::sigset_t = unsafe { std::mem::zeroed() };
    if let Some(set) = all.as_ref() {
        unsafe {
            libc::sigprocmask(libc::SIG_SETMASK, set.as_raw(), &mut old_mask);
        }
    }
    drop(all);

    let new = fd.unwrap_or(-1);
    let prev = WAKEUP_FD.swap(new, Ordering::SeqCst);

    unsafe {
        libc::sigprocmask(libc::SIG_SETMASK, &old_mask, ptr::null_mut());
    }

    if prev < 0 {
        None
    } else {
        Some(prev)
    }
}

/// Resize both capture buffers to hold `count` signals each.
///
/// Up to `count` signals already captured in the front buffer are copied
/// forward into the new one; if the front buffer held more than `count`
/// live records, the overflow beyond `count` is truncated (loss is
/// permitted but consistent -- the tail is dropped, not an arbitrary
/// subset). The back buffer is always reset empty.
pub fn resize(count: usize) -> Result<()> {
    if count == 0 {
        return Err(Error::value("capture buffer capacity must be greater than zero"));
    }
    let _guard = GUARD.lock().unwrap();

    let all = ALL_SIGNALS.lock().unwrap();
    let mut old_mask: libc::sigset_t = unsafe { std::mem::zeroed() };
    if let Some(set) = all.as_ref() {
        unsafe {
            libc::sigprocmask(libc::SIG_SETMASK, set.as_raw(), &mut old_mask);
        }
    }
    drop(all);

    // Copy up to `count` live records out of the current front buffer
    // before it's replaced -- this runs with the managed signals blocked,
    // so the handler cannot append to `front` while we read it.
    let front_ptr = FRONT.load(Ordering::SeqCst);
    let new_front = Buffer::new(count);
    if !front_ptr.is_null() {
        let front = unsafe { &*front_ptr };
        let copied = front.used.load(Ordering::SeqCst).min(count);
        for i in 0..copied {
            unsafe {
                *new_front.slots[i].get() = *front.slots[i].get();
            }
        }
        new_front.used.store(copied, Ordering::SeqCst);
    }
    let still_nonempty = new_front.used.load(Ordering::SeqCst) > 0;

    let old_front = FRONT.swap(Box::into_raw(Box::new(new_front)), Ordering::SeqCst);
    let old_back = BACK.swap(Box::into_raw(Box::new(Buffer::new(count))), Ordering::SeqCst);
    NONEMPTY.store(still_nonempty, Ordering::SeqCst);

    unsafe {
        libc::sigprocmask(libc::SIG_SETMASK, &old_mask, ptr::null_mut());
    }

    if !old_front.is_null() {
        drop(unsafe { Box::from_raw(old_front) });
    }
    if !old_back.is_null() {
        drop(unsafe { Box::from_raw(old_back) });
    }
    Ok(())
}

/// Drain every signal captured since the last call, and whether the buffer
/// overflowed (in which case only high-priority signals, if any, made it
/// into the last slot).
///
/// Returns `(vec![], false)` immediately, without blocking any signals, if
/// nothing has been captured since the last harvest.
pub fn harvest() -> (Vec<SigInfo>, bool) {
    if !NONEMPTY.load(Ordering::SeqCst) {
        return (Vec::new(), false);
    }

    let _guard = GUARD.lock().unwrap();

    let all = ALL_SIGNALS.lock().unwrap();
    let mut old_mask: libc::sigset_t = unsafe { std::mem::zeroed() };
    if let Some(set) = all.as_ref() {
        unsafe {
            libc::sigprocmask(libc::SIG_SETMASK, set.as_raw(), &mut old_mask);
        }
    }
    drop(all);

    let front_ptr = FRONT.load(Ordering::SeqCst);
    let back_ptr = BACK.load(Ordering::SeqCst);
    FRONT.store(back_ptr, Ordering::SeqCst);
    BACK.store(front_ptr, Ordering::SeqCst);
    NONEMPTY.store(false, Ordering::SeqCst);

    unsafe {
        libc::sigprocmask(libc::SIG_SETMASK, &old_mask, ptr::null_mut());
    }

    let drained = unsafe { &*front_ptr };
    let used = drained.used.swap(0, Ordering::SeqCst);
    let capacity = drained.capacity();
    let overflowed = used >= capacity;
    let n = used.min(capacity);

    let mut signals = Vec::with_capacity(n);
    for slot in &drained.slots[..n] {
        signals.push(SigInfo::from_raw(unsafe { *slot.get() }));
    }

    if overflowed {
        log::warn!("signal::harvest: capture buffer overflowed ({} slots)", capacity);
    }
    (signals, overflowed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::sigset::SignalSet;

    /// This module's state is one process-wide singleton; serialize the
    /// tests against each other the way a real caller would serialize
    /// install/resize/harvest calls from a single signal-handling thread.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn reset(capacity: usize) {
        resize(capacity).unwrap();
        set_hp(None);
        set_wakeup_fd(None);
        harvest();
    }

    #[test]
    fn test_install_and_harvest_fidelity() {
        crate::util::init_test_logging();
        let _guard = TEST_LOCK.lock().unwrap();
        reset(DEFAULT_CAPACITY);
        install(libc::SIGUSR1, SaFlags::empty()).unwrap();

        unsafe {
            libc::raise(libc::SIGUSR1);
        }

        let (signals, overflowed) = harvest();
        assert!(!overflowed);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signo(), libc::SIGUSR1);
    }

    #[test]
    fn test_overflow_high_priority_preserved() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset(2);
        install(libc::SIGUSR1, SaFlags::empty()).unwrap();
        install(libc::SIGUSR2, SaFlags::empty()).unwrap();

        let mut hp = SignalSet::empty();
        hp.add(libc::SIGUSR2).unwrap();
        set_hp(Some(hp));

        unsafe {
            libc::raise(libc::SIGUSR1);
            libc::raise(libc::SIGUSR1);
            // Buffer is now full; a third low-priority signal is dropped.
            libc::raise(libc::SIGUSR1);
            // A high-priority signal still overwrites the last slot.
            libc::raise(libc::SIGUSR2);
        }

        let (signals, overflowed) = harvest();
        assert!(overflowed);
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].signo(), libc::SIGUSR1);
        assert_eq!(signals[1].signo(), libc::SIGUSR2);

        set_hp(None);
    }

    #[test]
    fn test_wakeup_fd_single_byte() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset(DEFAULT_CAPACITY);
        install(libc::SIGUSR1, SaFlags::empty()).unwrap();

        let (read_fd, write_fd) = crate::util::nonblocking_pipe().unwrap();
        set_wakeup_fd(Some(write_fd));

        unsafe {
            libc::raise(libc::SIGUSR1);
            libc::raise(libc::SIGUSR1);
        }

        let mut buf = [0u8; 8];
        let n = unsafe {
            libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        assert_eq!(n, 1, "wakeup fd should see exactly one byte per empty-to-nonempty transition");

        let n2 = unsafe {
            libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        assert!(n2 < 0, "no further wakeup byte until the buffer is harvested and refills");

        harvest();
        set_wakeup_fd(None);
        crate::util::close(read_fd);
        crate::util::close(write_fd);
    }

    #[test]
    fn test_signalset_roundtrip() {
        let mut set = SignalSet::empty();
        assert!(!set.contains(libc::SIGUSR1));
        set.add(libc::SIGUSR1).unwrap();
        assert!(set.contains(libc::SIGUSR1));
        set.remove(libc::SIGUSR1).unwrap();
        assert!(!set.contains(libc::SIGUSR1));

        let full = SignalSet::full();
        assert!(full.contains(libc::SIGUSR1));
        assert_eq!(full.as_bytes().len(), std::mem::size_of::<libc::sigset_t>());
    }
}
