//! Fuzz target for metric record decoding.
//!
//! Disk buffer records are decoded on every read, so a damaged log must
//! surface as a decode error, never a panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mr_common::Metric;

fuzz_target!(|data: &[u8]| {
    if let Ok(metric) = Metric::from_bytes(data) {
        // Anything that decodes must survive a second trip.
        let bytes = metric.to_bytes().expect("decoded metric re-encodes");
        let again = Metric::from_bytes(&bytes).expect("re-encoded metric decodes");
        assert_eq!(metric.name(), again.name());
        assert_eq!(metric.tags(), again.tags());
    }
});
