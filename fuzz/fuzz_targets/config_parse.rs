//! Fuzz target for engine configuration parsing
//!
//! Arbitrary TOML must be rejected with an error, never a panic, and a
//! configuration that parses must either validate or say why not.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pktdma_core::EngineConfig;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _: Result<toml::Value, _> = toml::from_str(s);

        if let Ok(config) = toml::from_str::<EngineConfig>(s) {
            let _ = config.validate();
        }
        let _ = EngineConfig::from_toml_str(s);
    }
});
