#![no_main]

use charmstore::{CharmStore, CounterRequest};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    let key: Vec<String> = s
        .split_whitespace()
        .take(8)
        .map(|segment| segment.to_string())
        .collect();
    if key.is_empty() {
        return;
    }

    let store = CharmStore::in_memory();
    store.stats().inc(&key).expect("in-memory inc");

    // An increment completed before the query must be observed.
    let got = store
        .stats()
        .counters(&CounterRequest {
            key: key.clone(),
            ..Default::default()
        })
        .expect("in-memory counters");
    assert_eq!(got[0].count, 1);
});
