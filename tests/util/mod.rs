use std::sync::Once;

static INIT: Once = Once::new();

/// Init logging once per test binary, mirroring the teacher's
/// `tests/util/mod.rs::init`.
pub fn init() {
    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

pub fn pipe() -> (i32, i32) {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "pipe() failed: {}", std::io::Error::last_os_error());
    set_nonblocking(fds[0]);
    set_nonblocking(fds[1]);
    (fds[0], fds[1])
}

pub fn socketpair() -> (i32, i32) {
    let mut fds = [0i32; 2];
    let rc = unsafe {
        libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
    };
    assert_eq!(rc, 0, "socketpair() failed: {}", std::io::Error::last_os_error());
    set_nonblocking(fds[0]);
    set_nonblocking(fds[1]);
    (fds[0], fds[1])
}

pub fn datagram_pair() -> (i32, i32) {
    let mut fds = [0i32; 2];
    let rc = unsafe {
        libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr())
    };
    assert_eq!(rc, 0, "socketpair(SOCK_DGRAM) failed: {}", std::io::Error::last_os_error());
    set_nonblocking(fds[0]);
    set_nonblocking(fds[1]);
    (fds[0], fds[1])
}

pub fn set_nonblocking(fd: i32) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}
