#![no_main]

use charmstore::config::StoreConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };

    // Arbitrary TOML must either fail to parse or yield a config whose
    // validation verdict is deterministic; neither path may panic.
    if let Ok(config) = toml::from_str::<StoreConfig>(s) {
        let _ = config.validate();
    }
});
