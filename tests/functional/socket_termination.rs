use crate::util;

use xfer_core::channel::Resource;
use xfer_core::Array;

#[test]
fn peer_close_terminates_the_read_side() {
    util::init();
    let (a, b) = util::socketpair();

    let array = Array::new().expect("array");
    let input = array.octets_input(a).expect("octets_input");

    // Close the peer end directly; the kernel will report EOF on `a`.
    unsafe { libc::close(b) };

    let mut buf = vec![0u8; 16];
    input
        .acquire(Resource::Bytes {
            ptr: buf.as_mut_ptr(),
            len: buf.len(),
            writable: true,
        })
        .expect("acquire");

    let mut terminated = false;
    for _ in 0..20 {
        array
            .enter(Some(std::time::Duration::from_millis(200)))
            .expect("enter");
        if input.is_terminated() {
            terminated = true;
            break;
        }
    }
    assert!(terminated, "channel should observe peer close as termination");
}

#[test]
fn terminate_is_idempotent() {
    util::init();
    let (a, _b) = util::socketpair();
    let array = Array::new().expect("array");
    let input = array.octets_input(a).expect("octets_input");

    input.terminate();
    input.terminate(); // must not panic or error
}

#[test]
fn caller_terminate_on_an_attached_channel_produces_a_terminate_event() {
    util::init();
    let (a, b) = util::socketpair();
    let array = Array::new().expect("array");
    let output = array.octets_output(a).expect("octets_output");

    // Register the channel with the backend before requesting termination,
    // so this exercises the attached path rather than terminate's detached
    // fast path (which sets both bits synchronously with no cycle needed).
    array
        .enter(Some(std::time::Duration::from_millis(0)))
        .expect("enter to register");
    assert!(!output.is_terminated());

    output.terminate();

    let cycle = array
        .enter(Some(std::time::Duration::from_millis(200)))
        .expect("enter");
    assert_eq!(cycle.len(), 1, "terminate must surface exactly one event");
    let event = cycle.iter().next().expect("one event");
    assert!(event.terminated);
    assert!(output.is_terminated());
    assert_eq!(array.len(), 0, "terminated and drained channel is detached");

    unsafe { libc::close(b) };
}

#[test]
fn fork_recovery_reregisters_channels_and_continues_transferring() {
    util::init();
    let (a, b) = util::socketpair();
    let array = Array::new().expect("array");
    let input = array.octets_input(a).expect("octets_input");

    // Attach for real before simulating the fork.
    array
        .enter(Some(std::time::Duration::from_millis(0)))
        .expect("enter to register");

    array.note_fork();

    unsafe {
        let payload = b"hi";
        libc::write(b, payload.as_ptr().cast(), payload.len());
    }

    let mut buf = vec![0u8; 16];
    input
        .acquire(Resource::Bytes {
            ptr: buf.as_mut_ptr(),
            len: buf.len(),
            writable: true,
        })
        .expect("acquire");

    let mut transferred = 0u32;
    for _ in 0..20 {
        array
            .enter(Some(std::time::Duration::from_millis(200)))
            .expect("enter after fork recovery");
        transferred = input.sizeof_transfer();
        if transferred > 0 {
            break;
        }
    }
    assert_eq!(transferred, 2, "channel must keep transferring after the kernel descriptor is recreated");

    unsafe { libc::close(b) };
}
