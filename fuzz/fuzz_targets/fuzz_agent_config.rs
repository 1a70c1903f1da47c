//! Fuzz target for agent.toml parsing.
//!
//! Tests that TOML configuration parsing and validation handle arbitrary
//! input without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mr_common::AgentConfig;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(config) = AgentConfig::from_toml_str(text, "fuzz") {
        let _ = config.validate();
        let _ = config.output_configs();
    }
});
