//! Fuzz target for opening a write-ahead log from arbitrary bytes.
//!
//! Opening either fails with an error or yields a log whose every index in
//! `[first, last]` can be read back.

#![no_main]

use std::fs;

use libfuzzer_sys::fuzz_target;
use mr_buffer::{Wal, WalOptions};

fuzz_target!(|data: &[u8]| {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let path = dir.path().join("log");
    fs::write(&path, data).expect("write seed");

    let Ok(mut wal) = Wal::open(&path, WalOptions::default().without_sync()) else {
        return;
    };
    if !wal.is_empty() {
        for index in wal.first_index()..=wal.last_index() {
            wal.read(index).expect("indexed record is readable");
        }
    }
    let _ = wal.close();
});
