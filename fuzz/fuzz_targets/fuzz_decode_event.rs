#![no_main]

use libfuzzer_sys::fuzz_target;

// Arbitrary bytes must never panic the event decoder; decoded events must
// survive re-canonicalization and the hash/signature checks.
fuzz_target!(|data: &[u8]| {
    if let Ok(event) = serde_json::from_slice::<weft::event::Event>(data) {
        let _ = event.canonical_bytes();
        let _ = event.verify_hash();
        let _ = event.verify_signature();
    }
    if let Ok(event) = bincode::deserialize::<weft::event::Event>(data) {
        let _ = event.canonical_bytes();
        let _ = event.verify_hash();
    }
});
