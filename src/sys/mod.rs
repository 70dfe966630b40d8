//! Platform backend selection. Only Unix (kqueue/epoll) is implemented; the
//! TTY-size, clock/sleeper, and language-bindings shells are out of scope
//! (§1) and have no `sys` presence here.

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use unix::{Backend, KernelEventBackend, RawEvent};
