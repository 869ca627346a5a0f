//! Fuzz target for buffer.toml parsing and validation.
//!
//! Arbitrary input must produce a config or an error, never a panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pb_config::{parse_size, validate_buffer_config, BufferConfig};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let _ = parse_size(text);
    if let Ok(config) = BufferConfig::from_toml_str(text) {
        let _ = validate_buffer_config(&config);
        let _ = config.offline_buffer_secs();
    }
});
