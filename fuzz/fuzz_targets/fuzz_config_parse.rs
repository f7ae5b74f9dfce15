// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fuzz ExecConfig TOML parsing and validation.
//!
//! `parse_toml` and `validate_config` must never panic, and a parsed
//! config must survive a TOML round trip unchanged.
#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };

    let config = match spx_config::parse_toml(s) {
        Ok(c) => c,
        Err(e) => {
            let _ = e.to_string();
            return;
        }
    };

    if let Err(e) = spx_config::validate_config(&config) {
        let _ = e.to_string();
    }

    if let Ok(toml_str) = toml::to_string(&config) {
        let rt = spx_config::parse_toml(&toml_str).expect("serialized config must parse");
        assert_eq!(config, rt, "TOML round-trip must be lossless");
    }
});
