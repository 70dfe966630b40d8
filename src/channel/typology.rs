//! Channel typology bindings (§4.2 "Subtype bindings").
//!
//! Each variant binds a polarity-selected I/O operation and a per-unit
//! size. The op contract (§4.2): given a [`Port`] and a buffer, produce
//! `consumed` units and report `Flow` (buffer fully consumed without
//! blocking), `Stop` (would block), or `Terminate` (EOF/fatal error,
//! recorded on the Port).

use std::io;

use crate::channel::state::Polarity;
use crate::datagram::DatagramArray;
use crate::port::Port;

/// What a Channel's borrowed resource actually points at. Distinct variants
/// because the typologies below interpret their window in different units
/// (§4.2 unit column) even though the window itself is always counted in
/// bytes (§3).
pub enum Resource {
    /// Octets: a plain externally-owned byte span.
    Bytes { ptr: *mut u8, len: usize, writable: bool },
    /// Sockets/Ports: a span of raw file descriptors, `unit = sizeof(int)`.
    Fds { ptr: *mut i32, len: usize },
    /// Datagrams: the packed record buffer backing a [`DatagramArray`].
    Datagrams(DatagramArray),
}

// SAFETY: the pointer variants are only ever dereferenced while the owning
// Channel holds them acquired, which per the Channel contract (§4.2
// `acquire`) is for as long as the external caller guarantees exclusive
// access; the Array cycle that dereferences them runs on whichever thread
// calls `enter`, which is why the caller -- not this type -- is responsible
// for the buffer outliving the acquisition.
unsafe impl Send for Resource {}

impl Resource {
    pub fn byte_len(&self) -> usize {
        match self {
            Resource::Bytes { len, .. } => *len,
            Resource::Fds { len, .. } => len * std::mem::size_of::<i32>(),
            Resource::Datagrams(d) => d.byte_len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Typology {
    Octets,
    Sockets,
    Ports,
    Datagrams,
}

impl Typology {
    pub fn unit_size(self) -> usize {
        match self {
            Typology::Octets | Typology::Datagrams => 1,
            Typology::Sockets | Typology::Ports => std::mem::size_of::<i32>(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum OpOutcome {
    Flow(u32),
    Stop(u32),
    Terminate(u32),
}

impl OpOutcome {
    pub fn consumed(self) -> u32 {
        match self {
            OpOutcome::Flow(n) | OpOutcome::Stop(n) | OpOutcome::Terminate(n) => n,
        }
    }
}

fn classify_io_result(res: io::Result<isize>, n_read_is_eof: bool) -> (u32, OpOutcome) {
    match res {
        Ok(0) if n_read_is_eof => (0, OpOutcome::Terminate(0)),
        Ok(n) => (n as u32, OpOutcome::Flow(n as u32)),
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => (0, OpOutcome::Stop(0)),
        Err(_) => (0, OpOutcome::Terminate(0)),
    }
}

/// Perform one transfer attempt for `typology`/`polarity` against the
/// window `[start, resource_len)` of `resource` (§4.3 step 10).
pub fn perform(
    typology: Typology,
    polarity: Polarity,
    port: &mut Port,
    resource: &mut Resource,
    start: u32,
) -> OpOutcome {
    match typology {
        Typology::Octets => octets(polarity, port, resource, start),
        Typology::Sockets => sockets_accept(port, resource, start),
        Typology::Ports => ports(polarity, port, resource, start),
        Typology::Datagrams => datagrams(polarity, port, resource, start),
    }
}

fn octets(polarity: Polarity, port: &mut Port, resource: &mut Resource, start: u32) -> OpOutcome {
    let (ptr, len) = match resource {
        Resource::Bytes { ptr, len, .. } => (*ptr, *len),
        _ => unreachable!("Octets channel must carry a Bytes resource"),
    };
    let remaining = len - start as usize;
    if remaining == 0 {
        return OpOutcome::Flow(0);
    }
    let cursor = unsafe { ptr.add(start as usize) };
    let fd = port.fd();
    let res: io::Result<isize> = if polarity.is_input() {
        syscall!(read(fd, cursor as *mut libc::c_void, remaining)).map(|n| n as isize)
    } else {
        syscall!(write(fd, cursor as *const libc::c_void, remaining)).map(|n| n as isize)
    };
    let (consumed, outcome) = classify_io_result(res, polarity.is_input());
    if let OpOutcome::Terminate(_) = outcome {
        if let Err(e) = res {
            let name = if polarity.is_input() { "read" } else { "write" };
            port.record_error(name, &e);
        }
    }
    match outcome {
        OpOutcome::Flow(_) => OpOutcome::Flow(consumed),
        OpOutcome::Stop(_) => OpOutcome::Stop(consumed),
        OpOutcome::Terminate(_) => OpOutcome::Terminate(consumed),
    }
}

fn sockets_accept(port: &mut Port, resource: &mut Resource, start: u32) -> OpOutcome {
    let (ptr, len) = match resource {
        Resource::Fds { ptr, len } => (*ptr, *len),
        _ => unreachable!("Sockets channel must carry an Fds resource"),
    };
    let unit = Typology::Sockets.unit_size() as u32;
    let start_idx = start / unit;
    if (start_idx as usize) >= len {
        return OpOutcome::Flow(0);
    }
    let fd = port.fd();
    match syscall!(accept4(
        fd,
        std::ptr::null_mut(),
        std::ptr::null_mut(),
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    )) {
        Ok(client) => {
            unsafe { *ptr.add(start_idx as usize) = client };
            OpOutcome::Flow(unit)
        }
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => OpOutcome::Stop(0),
        Err(e) => {
            port.record_error("accept4", &e);
            OpOutcome::Terminate(0)
        }
    }
}

fn ports(polarity: Polarity, port: &mut Port, resource: &mut Resource, start: u32) -> OpOutcome {
    let (ptr, len) = match resource {
        Resource::Fds { ptr, len } => (*ptr, *len),
        _ => unreachable!("Ports channel must carry an Fds resource"),
    };
    let unit = Typology::Ports.unit_size() as u32;
    let start_idx = (start / unit) as usize;
    if start_idx >= len {
        return OpOutcome::Flow(0);
    }
    let fd = port.fd();
    if polarity.is_input() {
        recvmsg_one(fd, port).map_or(OpOutcome::Stop(0), |outcome| match outcome {
            RecvOutcome::Fd(received) => {
                unsafe { *ptr.add(start_idx) = received };
                OpOutcome::Flow(unit)
            }
            RecvOutcome::Eof => OpOutcome::Terminate(0),
        })
    } else {
        let carried = unsafe { *ptr.add(start_idx) };
        match sendmsg_one(fd, carried) {
            Ok(true) => OpOutcome::Flow(unit),
            Ok(false) => OpOutcome::Stop(0),
            Err(e) => {
                port.record_error("sendmsg", &e);
                OpOutcome::Terminate(0)
            }
        }
    }
}

enum RecvOutcome {
    Fd(i32),
    Eof,
}

fn recvmsg_one(fd: i32, port: &mut Port) -> Option<RecvOutcome> {
    let mut dummy = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: dummy.as_mut_ptr() as *mut libc::c_void,
        iov_len: dummy.len(),
    };
    let mut cbuf = [0u8; 64];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cbuf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cbuf.len() as _;

    let n = match syscall!(recvmsg(fd, &mut msg, 0)) {
        Ok(n) => n,
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return None,
        Err(e) => {
            port.record_error("recvmsg", &e);
            return Some(RecvOutcome::Eof);
        }
    };
    if n == 0 {
        return Some(RecvOutcome::Eof);
    }
    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    if cmsg.is_null() {
        return Some(RecvOutcome::Eof);
    }
    let data = unsafe { libc::CMSG_DATA(cmsg) } as *const i32;
    let received = unsafe { *data };
    Some(RecvOutcome::Fd(received))
}

fn sendmsg_one(fd: i32, carried_fd: i32) -> io::Result<bool> {
    let mut dummy = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: dummy.as_mut_ptr() as *mut libc::c_void,
        iov_len: dummy.len(),
    };
    let mut cbuf = [0u8; 64];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cbuf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = unsafe { libc::CMSG_SPACE(std::mem::size_of::<i32>() as u32) } as _;

    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    unsafe {
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(std::mem::size_of::<i32>() as u32) as _;
        let data = libc::CMSG_DATA(cmsg) as *mut i32;
        *data = carried_fd;
    }

    match syscall!(sendmsg(fd, &msg, 0)) {
        Ok(_) => Ok(true),
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e),
    }
}

fn datagrams(polarity: Polarity, port: &mut Port, resource: &mut Resource, start: u32) -> OpOutcome {
    let array = match resource {
        Resource::Datagrams(d) => d,
        _ => unreachable!("Datagrams channel must carry a Datagrams resource"),
    };
    if polarity.is_input() {
        array.recv_step(port, start)
    } else {
        array.send_step(port, start)
    }
}
