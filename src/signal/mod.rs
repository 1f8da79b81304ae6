//! Signal Capture: an async-signal-safe handler that snapshots delivered
//! signals into a double-buffered slot pair, harvested from ordinary
//! (non-signal) context.

mod capture;
mod siginfo;
mod sigset;

pub use capture::{harvest, install, resize, set_hp, set_wakeup_fd};
pub use siginfo::SigInfo;
pub use sigset::{SaFlags, SignalSet};

/// `sigprocmask(2)`'s `how` values, surfaced for callers that want to block
/// or unblock signals themselves around code that must not be interrupted
/// while this module's handler is installed.
pub use libc::{SIG_BLOCK, SIG_SETMASK, SIG_UNBLOCK};
