//! A typed `sigset_t` wrapper, and the `SA_*` flags `sigaction` accepts.

use crate::error::{Error, Result};
use std::mem::MaybeUninit;

bitflags::bitflags! {
    /// Flags accepted by [`super::install`], mirroring `sigaction(2)`'s
    /// `sa_flags`. `SA_SIGINFO` is always implied by this crate's handler and
    /// need not (and cannot) be requested here.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SaFlags: libc::c_int {
        const NOCLDSTOP = libc::SA_NOCLDSTOP;
        const ONSTACK   = libc::SA_ONSTACK;
        const RESETHAND = libc::SA_RESETHAND;
        const RESTART   = libc::SA_RESTART;
        const NOCLDWAIT = libc::SA_NOCLDWAIT;
        const NODEFER   = libc::SA_NODEFER;
    }
}

/// A set of signal numbers, backed by `libc::sigset_t`.
///
/// Used both as the high-priority overflow set ([`super::set_hp`]) and as
/// the mask manipulated by `sigprocmask` while the capture state swaps
/// buffers.
#[derive(Clone, Copy)]
pub struct SignalSet(libc::sigset_t);

impl SignalSet {
    /// An empty set.
    pub fn empty() -> Self {
        let mut set = MaybeUninit::uninit();
        unsafe {
            libc::sigemptyset(set.as_mut_ptr());
            SignalSet(set.assume_init())
        }
    }

    pub(crate) fn from_raw(raw: libc::sigset_t) -> Self {
        SignalSet(raw)
    }

    /// The set of every signal.
    pub fn full() -> Self {
        let mut set = MaybeUninit::uninit();
        unsafe {
            libc::sigfillset(set.as_mut_ptr());
            SignalSet(set.assume_init())
        }
    }

    pub fn clear(&mut self) {
        unsafe {
            libc::sigemptyset(&mut self.0);
        }
    }

    pub fn fill(&mut self) {
        unsafe {
            libc::sigfillset(&mut self.0);
        }
    }

    pub fn add(&mut self, signal: i32) -> Result<()> {
        let rc = unsafe { libc::sigaddset(&mut self.0, signal) };
        if rc < 0 {
            return Err(Error::value(format!("invalid signal number: {}", signal)));
        }
        Ok(())
    }

    pub fn remove(&mut self, signal: i32) -> Result<()> {
        let rc = unsafe { libc::sigdelset(&mut self.0, signal) };
        if rc < 0 {
            return Err(Error::value(format!("invalid signal number: {}", signal)));
        }
        Ok(())
    }

    pub fn contains(&self, signal: i32) -> bool {
        unsafe { libc::sigismember(&self.0, signal) == 1 }
    }

    pub(crate) fn as_raw(&self) -> &libc::sigset_t {
        &self.0
    }

    pub(crate) fn as_raw_mut(&mut self) -> &mut libc::sigset_t {
        &mut self.0
    }

    /// A raw byte view of the underlying `sigset_t`, for callers that want
    /// to serialize or compare sets directly rather than through
    /// [`contains`](Self::contains).
    pub fn as_bytes(&self) -> &[u8] {
        let ptr = &self.0 as *const libc::sigset_t as *const u8;
        // Safety: sigset_t is plain-old-data; the slice does not outlive self.
        unsafe { std::slice::from_raw_parts(ptr, std::mem::size_of::<libc::sigset_t>()) }
    }
}

impl Default for SignalSet {
    fn default() -> Self {
        Self::empty()
    }
}
