#![no_main]

use libfuzzer_sys::fuzz_target;

use weft::gossip::{Cursor, PullReply, PullRequest};

// Wire envelopes and opaque cursors come from untrusted peers; decoding
// must be panic-free for arbitrary input.
fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<PullReply>(data);
    let _ = serde_json::from_slice::<PullRequest>(data);
    let _ = Cursor::from_opaque(data);
});
