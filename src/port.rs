//! [`Port`]: ownership of a single kernel file descriptor (§3, §4.1).

use std::fmt;
use std::os::unix::io::RawFd;

use log::{trace, warn};

use crate::error::PortError;

/// Budget for EINTR retries inside [`syscall!`](crate::syscall), compile-time
/// per §6 "Configuration knobs" (default 16; raised to 64 for calls known to
/// be interrupted routinely, e.g. `close` under a debugger).
pub const EINTR_RETRY_BUDGET: u32 = 16;

/// What kind of thing a [`Port`] carries (§3 "freight tag").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freight {
    Void,
    Events,
    Octets,
    Datagrams,
    Sockets,
    Ports,
}

/// The descriptor's typology, queried once at construction via `fstat` (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Typology {
    Socket,
    Pipe,
    Fifo,
    Device,
    Tty,
    File,
    EventQueue,
    Unknown,
    Bad,
}

impl Typology {
    /// Probe an open descriptor's typology via `fstat`. Never fails: an
    /// `fstat` error yields [`Typology::Bad`] and the caller will see it
    /// reflected as an immediate Port error on first use.
    pub fn probe(fd: RawFd) -> Typology {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::fstat(fd, &mut stat) };
        if rc != 0 {
            return Typology::Bad;
        }
        let mode = stat.st_mode & libc::S_IFMT;
        match mode {
            libc::S_IFSOCK => Typology::Socket,
            libc::S_IFIFO => Typology::Fifo,
            libc::S_IFCHR => {
                if unsafe { libc::isatty(fd) } == 1 {
                    Typology::Tty
                } else {
                    Typology::Device
                }
            }
            libc::S_IFREG => Typology::File,
            _ => Typology::Unknown,
        }
    }
}

/// Owner of one kernel file descriptor (§3).
///
/// A Port may be shared by two channels of opposite polarity (e.g. a
/// socketpair); `latches` tracks how many polarities still reference it.
/// `latches == 0` implies the descriptor has been closed by this subsystem
/// and must never be touched again.
pub struct Port {
    fd: RawFd,
    typology: Typology,
    freight: Freight,
    last_error: Option<PortError>,
    last_call: &'static str,
    /// High nibble: read-side latch count. Low nibble: write-side.
    latches: u8,
    leaked: bool,
}

const READ_NIBBLE: u8 = 0xF0;
const WRITE_NIBBLE: u8 = 0x0F;

impl Port {
    /// Wrap an already-open descriptor. `reads`/`writes` are the initial
    /// latch counts for each half (e.g. 1/1 for a bidirectional socket pair
    /// split across two channels, 1/0 for an input-only Octets channel).
    pub fn new(fd: RawFd, freight: Freight, reads: u8, writes: u8) -> Port {
        debug_assert!(reads <= 0xF && writes <= 0xF);
        Port {
            fd,
            typology: Typology::probe(fd),
            freight,
            last_error: None,
            last_call: "",
            latches: (reads << 4) | writes,
            leaked: false,
        }
    }

    /// Construct the pseudo-Port backing an Array's own kernel event
    /// descriptor. Typology is forced to `EventQueue` regardless of what
    /// `fstat` would say (§3 Array invariants).
    pub fn for_event_queue(fd: RawFd) -> Port {
        Port {
            fd,
            typology: Typology::EventQueue,
            freight: Freight::Events,
            last_error: None,
            last_call: "",
            latches: 0x11,
            leaked: false,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn typology(&self) -> Typology {
        self.typology
    }

    pub fn freight(&self) -> Freight {
        self.freight
    }

    pub fn error(&self) -> Option<PortError> {
        self.last_error
    }

    pub fn call_name(&self) -> &'static str {
        self.last_call
    }

    pub fn is_latched(&self) -> bool {
        self.latches != 0
    }

    fn read_latches(&self) -> u8 {
        (self.latches & READ_NIBBLE) >> 4
    }

    fn write_latches(&self) -> u8 {
        self.latches & WRITE_NIBBLE
    }

    /// Record a failed syscall on this port. `EBADF` forces latches to zero
    /// immediately (§3 invariant) so a later close can never touch a
    /// descriptor that may already have been recycled by the kernel.
    pub fn record_error(&mut self, callname: &'static str, err: &std::io::Error) {
        let perr = PortError::new(callname, err);
        warn!("port fd={} {} failed: {}", self.fd, callname, perr);
        self.last_call = callname;
        self.last_error = Some(perr);
        if perr.is_ebadf() {
            self.latches = 0;
        }
    }

    /// Mark this port so `close` is suppressed entirely and latches are
    /// zeroed without any shutdown — used when the descriptor's lifetime is
    /// handed off to a caller that owns it independently.
    pub fn leak(&mut self) {
        self.leaked = true;
        self.latches = 0;
    }

    /// Zero the latches without shutdown or close (§4.1). Used during fork
    /// recovery when the parent's descriptor table is known to be gone in
    /// the child.
    pub fn shatter(&mut self) {
        self.latches = 0;
    }

    /// Decrement one polarity's latch count. `delta` is negative for the
    /// read side, positive for the write side (§4.1 `unlatch`).
    ///
    /// When a side reaches zero on a socket carrying octets or ports,
    /// `shutdown` is issued for that direction. When the total reaches zero,
    /// `close` is issued (unless the port was [`leak`](Port::leak)ed).
    pub fn unlatch(&mut self, reading: bool) {
        if self.latches == 0 {
            return;
        }
        if reading {
            let n = self.read_latches();
            if n > 0 {
                self.latches = ((n - 1) << 4) | self.write_latches();
            }
        } else {
            let n = self.write_latches();
            if n > 0 {
                self.latches = (self.read_latches() << 4) | (n - 1);
            }
        }

        let reached_zero_side = if reading {
            self.read_latches() == 0
        } else {
            self.write_latches() == 0
        };

        if reached_zero_side
            && self.typology == Typology::Socket
            && matches!(self.freight, Freight::Octets | Freight::Ports)
        {
            let how = if reading { libc::SHUT_RD } else { libc::SHUT_WR };
            let _ = self.try_call("shutdown", || syscall!(shutdown(self.fd, how)));
        }

        if self.latches == 0 {
            self.close();
        }
    }

    fn close(&mut self) {
        if self.leaked || self.fd < 0 {
            return;
        }
        trace!("closing port fd={}", self.fd);
        let _ = self.try_call("close", || syscall!(close(self.fd)));
        self.fd = -1;
    }

    /// Run a syscall closure, recording `(callname, errno)` on failure
    /// without propagating it — per §7, Port failures never raise
    /// asynchronously.
    pub fn try_call<F>(&mut self, callname: &'static str, f: F) -> std::io::Result<i32>
    where
        F: FnOnce() -> std::io::Result<i32>,
    {
        match f() {
            Ok(v) => Ok(v),
            Err(e) => {
                self.record_error(callname, &e);
                Err(e)
            }
        }
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        if self.is_latched() {
            self.latches = 0;
        }
        self.close();
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("fd", &self.fd)
            .field("typology", &self.typology)
            .field("freight", &self.freight)
            .field("latches", &format_args!("{:#04x}", self.latches))
            .field("last_error", &self.last_error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlatch_to_zero_closes() {
        let fds = {
            let mut fds = [0; 2];
            assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
            fds
        };
        let mut port = Port::new(fds[0], Freight::Octets, 1, 0);
        assert!(port.is_latched());
        port.unlatch(true);
        assert!(!port.is_latched());
        unsafe { libc::close(fds[1]) };
    }

    #[test]
    fn ebadf_zeroes_latches() {
        let mut port = Port::new(-1, Freight::Octets, 1, 1);
        let err = std::io::Error::from_raw_os_error(libc::EBADF);
        port.record_error("read", &err);
        assert!(!port.is_latched());
    }

    #[test]
    fn leak_suppresses_close() {
        let fds = {
            let mut fds = [0; 2];
            assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
            fds
        };
        let mut port = Port::new(fds[0], Freight::Octets, 1, 0);
        port.leak();
        assert!(!port.is_latched());
        drop(port);
        // fd is still open since leak suppressed the close.
        let rc = unsafe { libc::fcntl(fds[0], libc::F_GETFD) };
        assert!(rc >= 0);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
