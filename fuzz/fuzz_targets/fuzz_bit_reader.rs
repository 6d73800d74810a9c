#![no_main]

use libfuzzer_sys::fuzz_target;
use tickwire::core::bitbuf::BitRead;
use tickwire::core::packet::PacketReader;

fuzz_target!(|data: &[u8]| {
    // The first bytes pick a read schedule; the rest is the payload
    if data.len() < 4 {
        return;
    }
    let (schedule, payload) = data.split_at(4);
    let mut reader = PacketReader::new(0, payload);

    for step in schedule.iter().cycle().take(64) {
        let ok = match step % 6 {
            0 => reader.read_bool().is_ok(),
            1 => reader.read_bits(u32::from(step / 6) % 65).is_ok(),
            2 => reader.read_u32().is_ok(),
            3 => reader.read_string().is_ok(),
            4 => reader.read_bytes().is_ok(),
            _ => reader.read_f64().is_ok(),
        };
        if !ok {
            break;
        }
    }
    assert!(reader.position() <= payload.len() * 8);
});
