// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fuzz PrefixSuffixSaver with arbitrary limits and write sequences.
//!
//! Checks the byte accounting and the rendered head/tail against a naive
//! model that keeps everything.
#![no_main]
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use spx_capture::PrefixSuffixSaver;

#[derive(Debug, Arbitrary)]
struct CaptureInput {
    limit: u8,
    chunks: Vec<Vec<u8>>,
}

fuzz_target!(|input: CaptureInput| {
    let limit = usize::from(input.limit);
    let mut saver = PrefixSuffixSaver::new(limit);
    let mut all = Vec::new();
    for chunk in &input.chunks {
        assert_eq!(saver.push(chunk), chunk.len());
        all.extend_from_slice(chunk);
    }

    assert_eq!(saver.total_written(), all.len() as u64);
    let out = saver.bytes();
    if all.len() <= 2 * limit {
        assert_eq!(saver.skipped(), 0);
        assert_eq!(out, all);
    } else {
        let skipped = all.len() - 2 * limit;
        assert_eq!(saver.skipped(), skipped as u64);
        assert!(out.starts_with(&all[..limit]));
        assert!(out.ends_with(&all[all.len() - limit..]));
    }
});
