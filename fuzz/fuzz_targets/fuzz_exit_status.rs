// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fuzz ExitStatus decoding of arbitrary raw wait statuses.
//!
//! Exactly one of the exited/signaled/stopped/continued classifications may
//! hold, Display never panics, and the serde form round-trips.
#![no_main]
use libfuzzer_sys::fuzz_target;
use spx_exec::ExitStatus;

fuzz_target!(|raw: i32| {
    let status = ExitStatus::from_raw(1, raw, None);

    let kinds = [
        status.exited(),
        status.signal().is_some(),
        status.stopped_signal().is_some(),
        status.continued(),
    ];
    assert!(kinds.iter().filter(|k| **k).count() <= 1, "raw {raw:#x}");

    if let Some(code) = status.code() {
        assert!((0..=255).contains(&code));
        assert_eq!(status.exit_code(), code);
    } else {
        assert_eq!(status.exit_code(), -1);
    }
    assert_eq!(status.success(), status.code() == Some(0));
    if status.core_dumped() {
        assert!(status.signal().is_some());
    }

    let _ = status.to_string();
    let json = serde_json::to_string(&status).unwrap();
    let back: ExitStatus = serde_json::from_str(&json).unwrap();
    assert_eq!(back, status);
});
