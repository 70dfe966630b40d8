use crate::util;

use xfer_core::channel::Resource;
use xfer_core::Array;

#[test]
fn force_runs_a_transfer_even_without_a_fresh_kernel_event() {
    util::init();
    let (a, b) = util::pipe();

    let array = Array::new().expect("array");
    let input = array.octets_input(a).expect("octets_input");
    let output = array.octets_output(b).expect("octets_output");

    let mut out_buf = b"forced".to_vec();
    output
        .acquire(Resource::Bytes {
            ptr: out_buf.as_mut_ptr(),
            len: out_buf.len(),
            writable: false,
        })
        .expect("acquire write side");

    // Drain the write side so EXTERNAL_TRANSFER on the pipe's write end has
    // already been consumed by the time we acquire the read side.
    array.enter(Some(std::time::Duration::from_millis(200))).expect("enter");

    let mut in_buf = vec![0u8; out_buf.len()];
    input
        .acquire(Resource::Bytes {
            ptr: in_buf.as_mut_ptr(),
            len: in_buf.len(),
            writable: true,
        })
        .expect("acquire read side");
    input.force().expect("force");

    array.enter(Some(std::time::Duration::from_millis(200))).expect("enter");

    assert_eq!(&in_buf[..], &b"forced"[..]);
}

/// §8 scenario 3, literally: force a channel with nothing acquired at all
/// and expect a zero-length transfer event, not a no-op.
#[test]
fn force_without_a_resource_yields_a_zero_length_transfer_event() {
    util::init();
    let (a, _b) = util::pipe();

    let array = Array::new().expect("array");
    let input = array.octets_input(a).expect("octets_input");

    input.force().expect("force");

    let mut saw_event = false;
    for _ in 0..5 {
        let cycle = array.enter(Some(std::time::Duration::from_millis(50))).expect("enter");
        if cycle.iter().any(|ev| ev.channel_id() == 0) {
            saw_event = true;
            break;
        }
    }
    assert!(saw_event, "forcing an idle channel should still surface a cycle event");
    assert_eq!(input.sizeof_transfer(), 0);
    assert_eq!(input.transfer(), Some(xfer_core::Window { start: 0, stop: 0 }));
}
