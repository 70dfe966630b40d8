use crate::util;

use xfer_core::channel::Resource;
use xfer_core::Array;

#[test]
fn pipe_echo_drains_a_written_buffer() {
    util::init();
    let (read_fd, write_fd) = util::pipe();

    let array = Array::new().expect("array");
    let input = array.octets_input(read_fd).expect("octets_input");
    let output = array.octets_output(write_fd).expect("octets_output");

    let mut out_buf = b"hello, channel".to_vec();
    output
        .acquire(Resource::Bytes {
            ptr: out_buf.as_mut_ptr(),
            len: out_buf.len(),
            writable: false,
        })
        .expect("acquire write side");

    let mut in_buf = vec![0u8; out_buf.len()];
    input
        .acquire(Resource::Bytes {
            ptr: in_buf.as_mut_ptr(),
            len: in_buf.len(),
            writable: true,
        })
        .expect("acquire read side");

    for _ in 0..20 {
        let _cycle = array
            .enter(Some(std::time::Duration::from_millis(200)))
            .expect("enter");
        let input_done = input.slice().map(|w| w.is_empty()).unwrap_or(true);
        let output_done = output.slice().map(|w| w.is_empty()).unwrap_or(true);
        if input_done && output_done {
            break;
        }
    }

    assert_eq!(&in_buf[..], &b"hello, channel"[..]);
}
