use crate::util;

use xfer_core::channel::Resource;
use xfer_core::Array;

#[test]
fn double_acquire_without_draining_fails() {
    util::init();
    let (_a, b) = util::pipe();
    let array = Array::new().expect("array");
    let output = array.octets_output(b).expect("octets_output");

    let mut buf1 = vec![0u8; 4];
    output
        .acquire(Resource::Bytes { ptr: buf1.as_mut_ptr(), len: buf1.len(), writable: false })
        .expect("first acquire");

    let mut buf2 = vec![0u8; 4];
    let err = output.acquire(Resource::Bytes { ptr: buf2.as_mut_ptr(), len: buf2.len(), writable: false });
    assert!(err.is_err(), "acquiring over an outstanding resource must fail");
}

#[test]
fn acquire_on_terminated_channel_fails() {
    util::init();
    let (_a, b) = util::pipe();
    let array = Array::new().expect("array");
    let output = array.octets_output(b).expect("octets_output");
    output.terminate();

    let mut buf = vec![0u8; 4];
    let err = output.acquire(Resource::Bytes { ptr: buf.as_mut_ptr(), len: buf.len(), writable: false });
    assert!(err.is_err(), "acquire on a terminated channel must fail");
}

#[test]
fn requeue_keeps_the_kernel_filter_registered_across_termination() {
    util::init();
    let (a, b) = util::socketpair();
    let array = Array::new().expect("array");
    let input = array.octets_input(a).expect("octets_input");

    array
        .enter(Some(std::time::Duration::from_millis(0)))
        .expect("enter to register");

    input.set_requeue(true).expect("set_requeue");
    input.terminate();
    array
        .enter(Some(std::time::Duration::from_millis(200)))
        .expect("enter");

    assert_eq!(array.len(), 0, "the channel itself still detaches from the arena");
    // `a`'s Port already closed the fd as part of unlatching to zero
    // (independent of requeue, which only controls the backend
    // registration, not port ownership); only the peer needs closing here.
    unsafe {
        libc::close(b);
    }
}
