use crate::util;

use std::net::Ipv4Addr;

use xfer_core::channel::Resource;
use xfer_core::datagram::DatagramArray;
use xfer_core::{Array, Endpoint};

fn bound_udp_socket() -> (i32, u16) {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    assert!(fd >= 0, "socket() failed: {}", std::io::Error::last_os_error());
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_addr.s_addr = u32::from(Ipv4Addr::LOCALHOST).to_be();
    let rc = unsafe {
        libc::bind(
            fd,
            (&addr as *const libc::sockaddr_in).cast(),
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    assert_eq!(rc, 0, "bind() failed: {}", std::io::Error::last_os_error());

    let mut got: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe { libc::getsockname(fd, (&mut got as *mut libc::sockaddr_in).cast(), &mut len) };
    assert_eq!(rc, 0, "getsockname() failed: {}", std::io::Error::last_os_error());
    util::set_nonblocking(fd);
    (fd, u16::from_be(got.sin_port))
}

/// §8 scenario 4: a UDP Datagrams pair on two bound sockets. One
/// `DatagramArray` carries a filled endpoint+payload for sending, the other
/// receives; the receiver's record 0 must end up with the same payload and
/// an endpoint matching the sender's bound address.
#[test]
fn udp_datagram_echo_carries_payload_and_sender_endpoint() {
    util::init();
    let (send_fd, send_port) = bound_udp_socket();
    let (recv_fd, _recv_port) = bound_udp_socket();

    let array = Array::new().expect("array");
    let sender = array.datagrams_output(send_fd).expect("datagrams_output");
    let receiver = array.datagrams_input(recv_fd).expect("datagrams_input");

    let addr_cap = std::mem::size_of::<libc::sockaddr_in6>();
    let payload_cap = 64;
    let stride = DatagramArray::stride(addr_cap, payload_cap);

    let mut send_buf = vec![0u8; stride];
    let send_array = unsafe { DatagramArray::new(send_buf.as_mut_ptr(), 1, addr_cap, payload_cap) };
    send_array.payload_mut(0)[..5].copy_from_slice(b"hello");
    send_array.set_payload_len(0, 5);
    send_array.set_endpoint(0, &Endpoint::V4 { addr: Ipv4Addr::LOCALHOST, port: _recv_port });

    let mut recv_buf = vec![0u8; stride];
    let recv_array = unsafe { DatagramArray::new(recv_buf.as_mut_ptr(), 1, addr_cap, payload_cap) };

    sender
        .acquire(Resource::Datagrams(unsafe {
            DatagramArray::new(send_buf.as_mut_ptr(), 1, addr_cap, payload_cap)
        }))
        .expect("acquire sender");
    receiver
        .acquire(Resource::Datagrams(unsafe {
            DatagramArray::new(recv_buf.as_mut_ptr(), 1, addr_cap, payload_cap)
        }))
        .expect("acquire receiver");

    let mut received = false;
    for _ in 0..20 {
        array.enter(Some(std::time::Duration::from_millis(100))).expect("enter");
        if receiver.sizeof_transfer() > 0 {
            received = true;
            break;
        }
    }
    assert!(received, "receiver should observe a transfer event");

    assert_eq!(recv_array.payload(0), b"hello");
    match recv_array.endpoint(0) {
        Endpoint::V4 { addr, port } => {
            assert_eq!(addr, Ipv4Addr::LOCALHOST);
            assert_eq!(port, send_port);
        }
        other => panic!("expected a decoded V4 endpoint, got {:?}", other),
    }
}
