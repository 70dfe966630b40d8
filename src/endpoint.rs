//! [`Endpoint`]: a decoded socket address (§6 "External interfaces").
//!
//! Deliberately thin: constructed from raw `sockaddr` bytes handed back by
//! `getsockname`/`recvfrom`/etc, with no connect/bind/listen/getaddrinfo
//! helpers of its own -- that layer is explicitly out of scope (§1
//! Non-goals: "no high-level connect/bind/accept helpers; callers open their
//! own descriptors and hand them to `acquire`").

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// A decoded peer/local address. `Unknown` covers address families this
/// subsystem doesn't interpret further (still useful as an opaque "there was
/// an address here" marker for the Datagrams typology).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    V4 { addr: Ipv4Addr, port: u16 },
    V6 { addr: Ipv6Addr, port: u16, scope_id: u32 },
    Local,
    Unknown,
}

impl Endpoint {
    /// Decode a `sockaddr` buffer of `len` bytes as produced by
    /// `getsockname`/`getpeername`/`recvfrom`. Returns [`Endpoint::Unknown`]
    /// for anything shorter than a `sa_family_t` or a family this subsystem
    /// doesn't decode.
    ///
    /// # Safety
    /// `buf` must point to at least `len` initialized bytes.
    pub unsafe fn from_sockaddr(buf: *const u8, len: usize) -> Endpoint {
        if len < std::mem::size_of::<libc::sa_family_t>() {
            return Endpoint::Unknown;
        }
        let family = unsafe { *(buf as *const libc::sa_family_t) };
        match family as i32 {
            libc::AF_INET if len >= std::mem::size_of::<libc::sockaddr_in>() => {
                let sin = unsafe { &*(buf as *const libc::sockaddr_in) };
                Endpoint::V4 {
                    addr: Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                    port: u16::from_be(sin.sin_port),
                }
            }
            libc::AF_INET6 if len >= std::mem::size_of::<libc::sockaddr_in6>() => {
                let sin6 = unsafe { &*(buf as *const libc::sockaddr_in6) };
                Endpoint::V6 {
                    addr: Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                    port: u16::from_be(sin6.sin6_port),
                    scope_id: sin6.sin6_scope_id,
                }
            }
            libc::AF_UNIX => Endpoint::Local,
            _ => Endpoint::Unknown,
        }
    }

    /// Encode into a `sockaddr` buffer, returning the number of bytes
    /// written. `buf` must be at least `capacity` bytes (callers size it to
    /// `sockaddr_in6` to cover every variant). Returns `None` for variants
    /// that cannot be encoded ([`Endpoint::Local`], [`Endpoint::Unknown`]) --
    /// a Datagrams output record with no addressable peer is simply skipped
    /// by the caller.
    ///
    /// # Safety
    /// `buf` must point to at least `capacity` writable bytes.
    pub unsafe fn write_sockaddr(&self, buf: *mut u8, capacity: usize) -> Option<usize> {
        match *self {
            Endpoint::V4 { addr, port } => {
                let need = std::mem::size_of::<libc::sockaddr_in>();
                if capacity < need {
                    return None;
                }
                let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = port.to_be();
                sin.sin_addr.s_addr = u32::from(addr).to_be();
                unsafe { std::ptr::write(buf as *mut libc::sockaddr_in, sin) };
                Some(need)
            }
            Endpoint::V6 { addr, port, scope_id } => {
                let need = std::mem::size_of::<libc::sockaddr_in6>();
                if capacity < need {
                    return None;
                }
                let mut sin6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = port.to_be();
                sin6.sin6_addr.s6_addr = addr.octets();
                sin6.sin6_scope_id = scope_id;
                unsafe { std::ptr::write(buf as *mut libc::sockaddr_in6, sin6) };
                Some(need)
            }
            Endpoint::Local | Endpoint::Unknown => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::V4 { addr, port } => write!(f, "{}:{}", addr, port),
            Endpoint::V6 { addr, port, .. } => write!(f, "[{}]:{}", addr, port),
            Endpoint::Local => write!(f, "<local>"),
            Endpoint::Unknown => write!(f, "<unknown>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_round_trips_through_sockaddr() {
        let ep = Endpoint::V4 { addr: Ipv4Addr::new(127, 0, 0, 1), port: 4242 };
        let mut buf = [0u8; std::mem::size_of::<libc::sockaddr_in6>()];
        let n = unsafe { ep.write_sockaddr(buf.as_mut_ptr(), buf.len()) }.unwrap();
        let decoded = unsafe { Endpoint::from_sockaddr(buf.as_ptr(), n) };
        assert_eq!(decoded, ep);
    }
}
