//! AIO Manager: a thin, safe wrapper around Linux kernel AIO
//! (`io_setup`/`io_submit`/`io_getevents`/`io_destroy`), completion-signaled
//! through an `eventfd` so it composes with a `poll`/`epoll`-based event
//! loop instead of requiring its own blocking wait.

mod manager;
mod request;
mod sys;

pub use manager::Manager;
pub use request::{AioMode, AioRequest};
