#![no_main]
use libfuzzer_sys::fuzz_target;
use streamkeep::events::normalize;
use streamkeep::stream::SseDecoder;

fuzz_target!(|data: &[u8]| {
    // Arbitrary chunking must never panic the decoder.
    let split = data.first().map_or(1, |b| usize::from(*b).max(1));
    let mut decoder = SseDecoder::new();
    for chunk in data.chunks(split) {
        for frame in decoder.push(chunk) {
            let _ = normalize(&frame);
        }
    }
    if let Some(frame) = decoder.finish() {
        let _ = normalize(&frame);
    }
});
