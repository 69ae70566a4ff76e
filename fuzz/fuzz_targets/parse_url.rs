#![no_main]

use charmstore::CharmUrl;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(url) = CharmUrl::parse(s) {
        // Accepted URLs must render a canonical form that parses back to
        // the same value.
        let reparsed = CharmUrl::parse(&url.canonical()).expect("canonical form must parse");
        assert_eq!(reparsed, url);
        assert_eq!(reparsed.canonical(), url.canonical());
    }
});
