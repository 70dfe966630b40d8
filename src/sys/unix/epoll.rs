//! epoll backend (Linux). Adapted from the teacher's
//! `sys/unix/selector/epoll.rs`.
//!
//! §3 "Array" calls for two extra descriptors on Linux: a second epoll fd
//! dedicated to writable interest, and an eventfd used to wake the wait.
//! This exists because epoll reports readiness per-registration rather than
//! per-filter the way kqueue's `EVFILT_READ`/`EVFILT_WRITE` does, and a
//! Channel only ever wants one direction armed (its polarity never
//! changes); routing write-interest registrations through their own epoll
//! instance keeps the two symmetric with kqueue's two filters and lets a
//! single `epoll_wait` on the primary fd learn about both (the secondary
//! fd is itself registered, level-triggered, into the primary set).

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use super::{KernelEventBackend, RawEvent};

/// `u64` tag on the primary epoll set's registration of the write-interest
/// epoll fd.
const WRITE_EP_TAG: u64 = u64::MAX - 1;
/// `u64` tag on the primary epoll set's registration of the waker eventfd.
const WAKE_TAG: u64 = u64::MAX;

pub struct Backend {
    primary: OwnedFd,
    write_ep: OwnedFd,
    waker_fd: OwnedFd,
}

fn epoll_event(events: u32, tag: u64) -> libc::epoll_event {
    libc::epoll_event {
        events,
        u64: tag,
        #[cfg(target_os = "redox")]
        _pad: 0,
    }
}

impl KernelEventBackend for Backend {
    fn new() -> io::Result<Backend> {
        let primary = unsafe {
            OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?)
        };
        let write_ep = unsafe {
            OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?)
        };
        let waker_fd = unsafe {
            OwnedFd::from_raw_fd(syscall!(eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))?)
        };

        let mut ev = epoll_event(libc::EPOLLIN as u32, WRITE_EP_TAG);
        syscall!(epoll_ctl(
            primary.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            write_ep.as_raw_fd(),
            &mut ev,
        ))?;

        let mut ev = epoll_event(libc::EPOLLIN as u32, WAKE_TAG);
        syscall!(epoll_ctl(
            primary.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            waker_fd.as_raw_fd(),
            &mut ev,
        ))?;

        Ok(Backend {
            primary,
            write_ep,
            waker_fd,
        })
    }

    fn register(&self, fd: RawFd, id: usize, readable: bool) -> io::Result<()> {
        let (ep, bits) = if readable {
            (&self.primary, libc::EPOLLIN | libc::EPOLLRDHUP)
        } else {
            (&self.write_ep, libc::EPOLLOUT)
        };
        let mut ev = epoll_event((bits | libc::EPOLLET) as u32, id as u64);
        syscall!(epoll_ctl(ep.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut ev)).map(|_| ())
    }

    fn deregister(&self, fd: RawFd, readable: bool) -> io::Result<()> {
        let ep = if readable { &self.primary } else { &self.write_ep };
        match syscall!(epoll_ctl(
            ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            std::ptr::null_mut(),
        )) {
            Ok(_) => Ok(()),
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
        let millis = timeout
            .map(|d| {
                d.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(d)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        let mut raw: Vec<libc::epoll_event> = Vec::with_capacity(max);
        let n = syscall!(epoll_wait(
            self.primary.as_raw_fd(),
            raw.as_mut_ptr(),
            max as libc::c_int,
            millis,
        ))?;
        unsafe { raw.set_len(n as usize) };

        for ev in &raw {
            match ev.u64 {
                WAKE_TAG => {
                    self.drain_waker();
                    out.push(RawEvent {
                        id: None,
                        ready: true,
                        closed: false,
                    });
                }
                WRITE_EP_TAG => self.harvest_write_ep(out, max),
                id => out.push(RawEvent {
                    id: Some(id as usize),
                    ready: true,
                    closed: is_closed(ev.events),
                }),
            }
        }
        Ok(out.len())
    }

    fn arm_waker(&self, _waker_id: usize) -> io::Result<()> {
        // The eventfd was already registered into the primary set in `new`.
        Ok(())
    }

    fn poke(&self) -> io::Result<()> {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match syscall!(write(
            self.waker_fd.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
        )) {
            Ok(_) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.drain_waker();
                self.poke()
            }
            Err(e) => Err(e),
        }
    }

    fn as_raw_fd(&self) -> RawFd {
        self.primary.as_raw_fd()
    }
}

impl Backend {
    fn drain_waker(&self) {
        let mut buf = [0u8; 8];
        let _ = syscall!(read(
            self.waker_fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        ));
    }

    /// Drain the write-interest epoll set non-blockingly; it is registered
    /// level-triggered into `primary`, so every channel with a pending
    /// `EPOLLOUT` is harvested here each time `primary` reports it.
    fn harvest_write_ep(&self, out: &mut Vec<RawEvent>, max: usize) {
        let mut raw: Vec<libc::epoll_event> = Vec::with_capacity(max);
        let n = match syscall!(epoll_wait(
            self.write_ep.as_raw_fd(),
            raw.as_mut_ptr(),
            max as libc::c_int,
            0,
        )) {
            Ok(n) => n,
            Err(_) => return,
        };
        unsafe { raw.set_len(n as usize) };
        for ev in &raw {
            out.push(RawEvent {
                id: Some(ev.u64 as usize),
                ready: true,
                closed: is_closed(ev.events),
            });
        }
    }
}

fn is_closed(events: u32) -> bool {
    let events = events as libc::c_int;
    (events & libc::EPOLLHUP != 0)
        || (events & libc::EPOLLERR != 0)
        || (events & libc::EPOLLIN != 0 && events & libc::EPOLLRDHUP != 0)
}
