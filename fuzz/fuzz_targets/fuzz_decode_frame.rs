#![no_main]
use btbattery::protocol::{FrameAssembler, decode};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = decode(data);

    // Feed the same bytes in uneven notification-sized chunks
    let mut assembler = FrameAssembler::new();
    for chunk in data.chunks(7) {
        assembler.push(chunk);
        while let Some(result) = assembler.next_frame() {
            let _ = result;
        }
    }
});
