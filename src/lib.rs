//! Low-level primitives for a cooperative event loop: asynchronous disk
//! I/O, signal capture, and worker-pool bulk data transfer on a Unix-like
//! (Linux-focused) host.
//!
//! Each of the three subsystems below shares one architectural idea: a
//! single readable file descriptor that tells the caller's event loop "call
//! `harvest` now", so none of this crate ever blocks the caller's own
//! thread except where a method's documentation says it may.
//!
//! - [`aio`] -- kernel-AIO submission and completion (`io_setup`/
//!   `io_submit`/`io_getevents`), signaled through an `eventfd`.
//! - [`signal`] -- async-signal-safe capture of delivered signals into a
//!   double-buffered `siginfo_t` log, with high-priority overflow handling.
//! - [`bulk`] -- a worker-thread pool that copies byte ranges between file
//!   descriptors and/or memory buffers, signaled through a pipe.
//!
//! [`region`] holds the shared `ByteRegion` abstraction both [`aio`] and
//! [`bulk`] use to describe a borrowed span of externally-owned bytes.

pub mod aio;
pub mod bulk;
pub mod error;
pub mod region;
pub mod signal;
mod util;

pub use error::{Error, Result};
