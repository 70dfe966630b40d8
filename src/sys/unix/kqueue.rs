//! kqueue backend (BSD/Darwin). Adapted from the teacher's
//! `sys/unix/selector/kqueue.rs`: edge-triggered (`EV_CLEAR`) registration,
//! `EV_RECEIPT` batched changes, and an `EVFILT_USER` wake channel (§9
//! "the wake protocol ... must be preserved exactly").

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use super::{KernelEventBackend, RawEvent};

/// Reserved `udata` value identifying the waker's `EVFILT_USER` event; no
/// channel arena index ever collides with this since channel ids are
/// allocated from a `slab::Slab` which never reaches `usize::MAX` in
/// practice, and even if it did the wake path treats it as a no-op event.
const WAKE_IDENT: usize = usize::MAX;

pub struct Backend {
    kq: OwnedFd,
}

macro_rules! kevent {
    ($id:expr, $filter:expr, $flags:expr, $udata:expr) => {
        libc::kevent {
            ident: $id as libc::uintptr_t,
            filter: $filter as i16,
            flags: $flags,
            fflags: 0,
            data: 0,
            udata: $udata as *mut libc::c_void,
        }
    };
}

impl Backend {
    fn register_changes(&self, changes: &mut [libc::kevent]) -> io::Result<()> {
        let rc = syscall!(kevent(
            self.kq.as_raw_fd(),
            changes.as_ptr(),
            changes.len() as libc::c_int,
            changes.as_mut_ptr(),
            changes.len() as libc::c_int,
            ptr::null(),
        ));
        match rc {
            Ok(_) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => {}
            Err(e) => return Err(e),
        }
        for change in changes.iter() {
            let data = change.data;
            if change.flags & libc::EV_ERROR != 0 && data != 0 {
                return Err(io::Error::from_raw_os_error(data as i32));
            }
        }
        Ok(())
    }
}

impl KernelEventBackend for Backend {
    fn new() -> io::Result<Backend> {
        let kq = syscall!(kqueue())?;
        let kq = unsafe { OwnedFd::from_raw_fd(kq) };
        syscall!(fcntl(kq.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC))?;
        Ok(Backend { kq })
    }

    fn register(&self, fd: RawFd, id: usize, readable: bool) -> io::Result<()> {
        let filter = if readable {
            libc::EVFILT_READ
        } else {
            libc::EVFILT_WRITE
        };
        let flags = libc::EV_ADD | libc::EV_CLEAR | libc::EV_RECEIPT;
        let mut changes = [kevent!(fd, filter, flags, id)];
        self.register_changes(&mut changes)
    }

    fn deregister(&self, fd: RawFd, readable: bool) -> io::Result<()> {
        let filter = if readable {
            libc::EVFILT_READ
        } else {
            libc::EVFILT_WRITE
        };
        let flags = libc::EV_DELETE | libc::EV_RECEIPT;
        let mut changes = [kevent!(fd, filter, flags, 0)];
        match self.register_changes(&mut changes) {
            Ok(()) => Ok(()),
            // The filter was never installed (e.g. the channel terminated
            // before its first registration completed); not an error.
            Err(ref e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn wait(
        &self,
        out: &mut Vec<RawEvent>,
        max: usize,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        out.clear();
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map(|s| s as *const libc::timespec)
            .unwrap_or(ptr::null());

        let mut raw: Vec<libc::kevent> = Vec::with_capacity(max);
        let n = syscall!(kevent(
            self.kq.as_raw_fd(),
            ptr::null(),
            0,
            raw.as_mut_ptr(),
            max as libc::c_int,
            ts_ptr,
        ))?;
        unsafe { raw.set_len(n as usize) };

        for ev in &raw {
            if ev.udata as usize == WAKE_IDENT {
                out.push(RawEvent {
                    id: None,
                    ready: true,
                    closed: false,
                });
                continue;
            }
            let closed = ev.flags & libc::EV_EOF != 0;
            out.push(RawEvent {
                id: Some(ev.udata as usize),
                ready: true,
                closed,
            });
        }
        Ok(out.len())
    }

    fn arm_waker(&self, _waker_id: usize) -> io::Result<()> {
        let kev = kevent!(
            0,
            libc::EVFILT_USER,
            libc::EV_ADD | libc::EV_CLEAR | libc::EV_RECEIPT,
            WAKE_IDENT
        );
        let mut changes = [kev];
        self.register_changes(&mut changes)
    }

    fn poke(&self) -> io::Result<()> {
        let mut kev = kevent!(
            0,
            libc::EVFILT_USER,
            libc::EV_ADD | libc::EV_RECEIPT,
            WAKE_IDENT
        );
        kev.fflags = libc::NOTE_TRIGGER;
        let mut changes = [kev];
        self.register_changes(&mut changes)
    }

    fn as_raw_fd(&self) -> RawFd {
        self.kq.as_raw_fd()
    }
}
