#![no_main]
use libfuzzer_sys::fuzz_target;
use streamkeep::events::{normalize, RawFrame};

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        // First line is the tag, the rest is the payload.
        let (tag, payload) = s.split_once('\n').unwrap_or(("", s));
        let _ = normalize(&RawFrame::new(tag, payload));
        let _ = normalize(&RawFrame::untagged(s));
    }
});
