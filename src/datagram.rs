//! [`DatagramArray`]: a packed, fixed-stride record buffer backing a
//! Datagrams-typology Channel (§4.4).
//!
//! Each record is a `(Endpoint, payload)` pair. Records are laid out at a
//! fixed stride so indexing is O(1); a header word per record distinguishes
//! "unused" from "holds a datagram" and carries the actual payload length
//! (which is almost always less than `payload_cap`).

use std::io;
use std::mem::size_of;

use crate::channel::typology::OpOutcome;
use crate::endpoint::Endpoint;
use crate::port::Port;

const HEADER_LEN: usize = size_of::<u32>() + size_of::<u16>() + 2 /* pad */;

/// A caller-owned, caller-sized packed buffer of datagram records. The
/// Channel that owns one of these borrows it for the duration of an
/// `acquire`, exactly like the plain byte buffer behind an Octets channel
/// (§4.2 `acquire`); it does not allocate or own its backing memory.
pub struct DatagramArray {
    base: *mut u8,
    capacity: usize,
    addr_cap: usize,
    payload_cap: usize,
}

// SAFETY: see `Resource`'s SAFETY note (src/channel/typology.rs) -- borrowed
// for the acquisition's lifetime, which the caller guarantees.
unsafe impl Send for DatagramArray {}

impl DatagramArray {
    /// `addr_cap` should be `size_of::<libc::sockaddr_in6>()` unless the
    /// caller knows every peer will be `AF_INET` or narrower.
    ///
    /// # Safety
    /// `base` must point to at least `capacity * Self::stride(addr_cap,
    /// payload_cap)` writable, owned-for-the-duration-of-use bytes.
    pub unsafe fn new(base: *mut u8, capacity: usize, addr_cap: usize, payload_cap: usize) -> DatagramArray {
        DatagramArray { base, capacity, addr_cap, payload_cap }
    }

    pub fn stride(addr_cap: usize, payload_cap: usize) -> usize {
        HEADER_LEN + addr_cap + payload_cap
    }

    fn record_stride(&self) -> usize {
        Self::stride(self.addr_cap, self.payload_cap)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn byte_len(&self) -> usize {
        self.capacity * self.record_stride()
    }

    fn record_ptr(&self, i: usize) -> *mut u8 {
        debug_assert!(i < self.capacity);
        unsafe { self.base.add(i * self.record_stride()) }
    }

    fn payload_len(&self, i: usize) -> u32 {
        unsafe { std::ptr::read_unaligned(self.record_ptr(i) as *const u32) }
    }

    fn write_payload_len(&self, i: usize, n: u32) {
        unsafe { std::ptr::write_unaligned(self.record_ptr(i) as *mut u32, n) };
    }

    fn addr_len(&self, i: usize) -> u16 {
        unsafe { std::ptr::read_unaligned(self.record_ptr(i).add(4) as *const u16) }
    }

    fn set_addr_len(&self, i: usize, n: u16) {
        unsafe { std::ptr::write_unaligned(self.record_ptr(i).add(4) as *mut u16, n) };
    }

    fn addr_ptr(&self, i: usize) -> *mut u8 {
        unsafe { self.record_ptr(i).add(HEADER_LEN) }
    }

    fn payload_ptr(&self, i: usize) -> *mut u8 {
        unsafe { self.record_ptr(i).add(HEADER_LEN + self.addr_cap) }
    }

    /// The `i`-th record's payload, sized to what was actually filled
    /// (input) or to the full capacity for the caller to fill (output).
    pub fn payload(&self, i: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.payload_ptr(i), self.payload_len(i) as usize) }
    }

    pub fn payload_mut(&self, i: usize) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.payload_ptr(i), self.payload_cap) }
    }

    /// The address `i`-th record was received from (input) or will be sent
    /// to (output, once set via [`Self::set_endpoint`]).
    pub fn endpoint(&self, i: usize) -> Endpoint {
        let len = self.addr_len(i) as usize;
        if len == 0 {
            return Endpoint::Unknown;
        }
        unsafe { Endpoint::from_sockaddr(self.addr_ptr(i), len) }
    }

    pub fn set_endpoint(&self, i: usize, ep: &Endpoint) {
        let written = unsafe { ep.write_sockaddr(self.addr_ptr(i), self.addr_cap) };
        self.set_addr_len(i, written.unwrap_or(0) as u16);
    }

    pub fn set_payload_len(&self, i: usize, n: usize) {
        self.write_payload_len(i, n.min(self.payload_cap) as u32);
    }

    /// Fill as many unread records as possible via `recvfrom`, starting at
    /// the record covering byte offset `start` (§4.2 Datagrams input op),
    /// stopping at the first `EWOULDBLOCK`.
    pub fn recv_step(&self, port: &mut Port, start: u32) -> OpOutcome {
        let stride = self.record_stride() as u32;
        let mut idx = start / stride;
        let mut consumed = 0u32;
        while (idx as usize) < self.capacity {
            let mut addr_buf = vec![0u8; self.addr_cap];
            let mut addr_len = self.addr_cap as libc::socklen_t;
            let fd = port.fd();
            let rc = syscall!(recvfrom(
                fd,
                self.payload_ptr(idx as usize) as *mut libc::c_void,
                self.payload_cap,
                0,
                addr_buf.as_mut_ptr() as *mut libc::sockaddr,
                &mut addr_len,
            ));
            match rc {
                Ok(n) => {
                    self.write_payload_len(idx as usize, (n as usize).min(self.payload_cap) as u32);
                    let len = (addr_len as usize).min(self.addr_cap);
                    unsafe {
                        std::ptr::copy_nonoverlapping(addr_buf.as_ptr(), self.addr_ptr(idx as usize), len)
                    };
                    self.set_addr_len(idx as usize, len as u16);
                    consumed += stride;
                    idx += 1;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return OpOutcome::Stop(consumed);
                }
                Err(e) => {
                    port.record_error("recvfrom", &e);
                    return OpOutcome::Terminate(consumed);
                }
            }
        }
        OpOutcome::Flow(consumed)
    }

    /// Drain as many filled records as possible via `sendto`, starting at
    /// the record covering byte offset `start`, stopping at the first
    /// `EWOULDBLOCK`. A record with no endpoint set ([`Endpoint::Unknown`])
    /// is skipped without consuming a syscall.
    pub fn send_step(&self, port: &mut Port, start: u32) -> OpOutcome {
        let stride = self.record_stride() as u32;
        let mut idx = start / stride;
        let mut consumed = 0u32;
        while (idx as usize) < self.capacity {
            let len = self.addr_len(idx as usize);
            if len == 0 {
                consumed += stride;
                idx += 1;
                continue;
            }
            let fd = port.fd();
            let rc = syscall!(sendto(
                fd,
                self.payload_ptr(idx as usize) as *const libc::c_void,
                self.payload_len(idx as usize) as usize,
                0,
                self.addr_ptr(idx as usize) as *const libc::sockaddr,
                len as libc::socklen_t,
            ));
            match rc {
                Ok(_) => {
                    consumed += stride;
                    idx += 1;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return OpOutcome::Stop(consumed);
                }
                Err(e) => {
                    port.record_error("sendto", &e);
                    return OpOutcome::Terminate(consumed);
                }
            }
        }
        OpOutcome::Flow(consumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_accounts_for_header_and_both_spans() {
        assert_eq!(DatagramArray::stride(16, 64), HEADER_LEN + 16 + 64);
    }

    #[test]
    fn endpoint_round_trips_through_record() {
        let addr_cap = size_of::<libc::sockaddr_in6>();
        let payload_cap = 32;
        let mut buf = vec![0u8; DatagramArray::stride(addr_cap, payload_cap)];
        let arr = unsafe { DatagramArray::new(buf.as_mut_ptr(), 1, addr_cap, payload_cap) };
        let ep = Endpoint::V4 {
            addr: std::net::Ipv4Addr::new(10, 0, 0, 1),
            port: 9000,
        };
        arr.set_endpoint(0, &ep);
        assert_eq!(arr.endpoint(0), ep);
    }
}
