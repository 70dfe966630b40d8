//! Error taxonomy (§7).
//!
//! Syscall failures recorded on a [`Port`](crate::port::Port) never raise
//! asynchronously — they surface as a terminate event on the owning channel.
//! `CoreError` is for the synchronous boundary: direct operations like
//! `acquire`, `terminate`, and `Array::enter` that can fail immediately.

use std::fmt;
use std::io;

/// `(syscall name, errno)` recorded on a [`Port`](crate::port::Port).
///
/// One of the ~30 enumerated call names used for diagnostics (§3). The name
/// is a static string naming the libc function attempted, not a closed enum,
/// since the set of syscalls a Port may attempt varies by typology.
#[derive(Debug, Clone, Copy)]
pub struct PortError {
    pub callname: &'static str,
    pub errno: i32,
}

impl PortError {
    pub fn new(callname: &'static str, err: &io::Error) -> PortError {
        PortError {
            callname,
            errno: err.raw_os_error().unwrap_or(0),
        }
    }

    pub fn is_ebadf(&self) -> bool {
        self.errno == libc::EBADF
    }
}

impl fmt::Display for PortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed: {}",
            self.callname,
            io::Error::from_raw_os_error(self.errno)
        )
    }
}

/// Errors reported synchronously to a caller (§7 "Propagation policy").
///
/// Errors encountered *inside* a cycle are never represented by this type:
/// they are recorded on the affected [`Port`](crate::port::Port) and surface
/// as a `terminate` event instead.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Calling an operation in a state that forbids it: `acquire` while a
    /// resource is still outstanding, attaching to a terminated Array or
    /// Channel, or entering a cycle already in progress. `terminate()` on an
    /// already-terminating channel is explicitly NOT one of these — it is a
    /// no-op per §8 "Idempotence".
    #[error("transition violation: {what}")]
    TransitionViolation { what: &'static str },

    /// A syscall failed; the underlying error is also recorded on the Port.
    #[error("port error: {0}")]
    Port(PortError),

    /// A backing buffer could not be obtained.
    #[error("allocation error: {0}")]
    Allocation(&'static str),

    /// Any other OS-level failure from a direct (non-cycle) operation.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl CoreError {
    pub fn transition(what: &'static str) -> CoreError {
        CoreError::TransitionViolation { what }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
