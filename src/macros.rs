//! Small helper macros shared by the backend implementations.

/// Call a libc function, retrying on `EINTR` up to [`EINTR_RETRY_BUDGET`]
/// times, and translating a `-1` return into `io::Error::last_os_error()`.
///
/// This does NOT retry on `EAGAIN`/`EWOULDBLOCK`; the event machinery is what
/// turns those into a future wakeup (§4.1, §7 of the design).
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let mut budget = crate::port::EINTR_RETRY_BUDGET;
        loop {
            let res = unsafe { libc::$fn($($arg, )*) };
            if res == -1 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted && budget > 0 {
                    budget -= 1;
                    continue;
                }
                break Err(err);
            } else {
                break Ok(res);
            }
        }
    }};
}
