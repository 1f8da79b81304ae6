//! `SigInfo`: a snapshot of one `siginfo_t`, captured inside the signal
//! handler and handed back to the caller by [`super::harvest`].

/// An immutable, owned snapshot of a delivered signal's `siginfo_t`.
///
/// Every accessor reads a field that is valid for the signal's `si_code`;
/// reading one that doesn't apply to the delivering signal returns
/// whatever the kernel happened to leave there, exactly as raw `siginfo_t`
/// access behaves in C.
#[derive(Clone, Copy)]
pub struct SigInfo(libc::siginfo_t);

impl SigInfo {
    pub(crate) fn from_raw(info: libc::siginfo_t) -> Self {
        SigInfo(info)
    }

    pub fn signo(&self) -> i32 {
        self.0.si_signo
    }

    pub fn errno(&self) -> i32 {
        self.0.si_errno
    }

    pub fn code(&self) -> i32 {
        self.0.si_code
    }

    pub fn pid(&self) -> libc::pid_t {
        unsafe { self.0.si_pid() }
    }

    pub fn uid(&self) -> libc::uid_t {
        unsafe { self.0.si_uid() }
    }

    pub fn status(&self) -> i32 {
        unsafe { self.0.si_status() }
    }

    pub fn utime(&self) -> libc::clock_t {
        unsafe { self.0.si_utime() }
    }

    pub fn stime(&self) -> libc::clock_t {
        unsafe { self.0.si_stime() }
    }

    /// The `int` member of the signal's `sigval` union (`SI_QUEUE`/timers).
    pub fn value_int(&self) -> i32 {
        unsafe { self.0.si_value().sival_int }
    }

    /// The `ptr` member of the signal's `sigval` union.
    pub fn value_ptr(&self) -> *mut libc::c_void {
        unsafe { self.0.si_value().sival_ptr }
    }

    /// Alias for [`value_int`](Self::value_int), matching the reference
    /// accessor name.
    pub fn int(&self) -> i32 {
        self.value_int()
    }

    /// Alias for [`value_ptr`](Self::value_ptr).
    pub fn ptr(&self) -> *mut libc::c_void {
        self.value_ptr()
    }

    /// Faulting address, valid for `SIGSEGV`/`SIGBUS`/`SIGILL`/`SIGFPE`.
    pub fn addr(&self) -> *mut libc::c_void {
        unsafe { self.0.si_addr() }
    }

    /// Band event, valid for `SIGPOLL`/`SIGIO`.
    pub fn band(&self) -> libc::c_long {
        unsafe { self.0.si_band() }
    }

    /// File descriptor, valid for `SIGPOLL`/`SIGIO`.
    pub fn fd(&self) -> i32 {
        unsafe { self.0.si_fd() }
    }

    /// A raw byte view of the underlying `siginfo_t`.
    pub fn as_bytes(&self) -> &[u8] {
        let ptr = &self.0 as *const libc::siginfo_t as *const u8;
        // Safety: siginfo_t is plain-old-data; the slice does not outlive self.
        unsafe { std::slice::from_raw_parts(ptr, std::mem::size_of::<libc::siginfo_t>()) }
    }
}
