#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tickwire::core::codec::{FieldWidth, FrameCodec};
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Arbitrary stream bytes must either decode or fail, never panic or spin
    let widths = [FieldWidth::U8, FieldWidth::U16, FieldWidth::U32];
    let (length_width, opcode_width) = match data.first() {
        Some(b) => (widths[(*b % 3) as usize], widths[((*b / 3) % 3) as usize]),
        None => return,
    };
    let mut codec = FrameCodec::new(length_width, opcode_width, 250);
    let mut buf = BytesMut::from(&data[1..]);

    loop {
        let before = buf.len();
        match codec.decode(&mut buf) {
            Ok(Some(frame)) => {
                assert!(frame.payload.len() + codec.header_len() <= codec.max_frame_size());
                assert!(buf.len() < before);
            }
            Ok(None) | Err(_) => break,
        }
    }
});
