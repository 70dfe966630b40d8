//! Unix backend: kqueue on BSD/Darwin, epoll on Linux (§1, §4.1
//! `KernelEventBackend`, §9 "backend trait with two concrete
//! implementations").

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "tvos",
    target_os = "watchos",
))]
mod kqueue;
#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "tvos",
    target_os = "watchos",
))]
pub use kqueue::Backend;

#[cfg(any(target_os = "android", target_os = "linux"))]
mod epoll;
#[cfg(any(target_os = "android", target_os = "linux"))]
pub use epoll::Backend;

/// One harvested readiness notification, already translated out of the raw
/// kqueue/epoll event shape (§4.3 step 8).
#[derive(Debug, Clone, Copy)]
pub struct RawEvent {
    /// The channel arena index this event's `udata`/`u64` field was
    /// registered with, or `None` for the wake/self event (§4.3 step 8:
    /// "Events with the Array itself as target ... are drained and
    /// discarded").
    pub id: Option<usize>,
    /// The kernel reports the descriptor can make progress in the
    /// registered direction.
    pub ready: bool,
    /// The kernel reports EOF/HUP/error: external-terminate should be set
    /// (§4.3 step 8).
    pub closed: bool,
}

/// Minimal common surface every backend implements (§9 design notes):
/// `create`, `register(port, polarity)`, `unregister(port, polarity)`,
/// `wait(out, max, timeout) -> n`, `wake()`.
pub trait KernelEventBackend: Sized {
    fn new() -> io::Result<Self>;

    /// Register `fd` for edge-triggered readiness in the direction implied
    /// by `readable` (a channel's polarity never changes, so this is called
    /// at most once per channel unless it is deregistered first).
    fn register(&self, fd: RawFd, id: usize, readable: bool) -> io::Result<()>;

    fn deregister(&self, fd: RawFd, readable: bool) -> io::Result<()>;

    /// Block for up to `timeout` (or indefinitely if `None`) waiting for
    /// readiness, appending harvested [`RawEvent`]s to `out` (cleared
    /// first), up to `max` entries (§3 "event array's capacity").
    fn wait(&self, out: &mut Vec<RawEvent>, max: usize, timeout: Option<Duration>)
        -> io::Result<usize>;

    /// Arrange for `waker_id` to show up as a (discardable) `RawEvent` with
    /// `id: None` when [`KernelEventBackend::poke`] is called from another
    /// thread.
    fn arm_waker(&self, waker_id: usize) -> io::Result<()>;

    fn poke(&self) -> io::Result<()>;

    fn as_raw_fd(&self) -> RawFd;
}
