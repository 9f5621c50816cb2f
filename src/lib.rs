//! # Weft
//!
//! A Byzantine-fault-tolerant distributed ledger engine that totally orders
//! opaque operations by:
//! - **Gossiping a DAG of signed merge events** — each node keeps an
//!   append-only event history and periodically folds remote heads into a
//!   locally-signed merge event.
//! - **Continuity consensus** — a deterministic algorithm over the merged
//!   DAG elects supported witness events and extracts totally-ordered
//!   blocks, tolerating `f` Byzantine peers out of `3f + 1` witnesses.
//! - **Reputation-driven gossip** — peers earn and lose reputation based on
//!   productivity; backoff and capacity rules bound resource usage.
//!
//! The crate is organized around one cooperative worker per ledger that
//! sequences gossip → merge → consensus → commit cycles over four
//! subsystems: the [`store::EventStore`], the [`peers::PeerRegistry`], the
//! gossip client/server in [`gossip`], and the [`consensus`] engine.

pub mod block;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod event;
pub mod gossip;
pub mod merge;
pub mod node;
pub mod peers;
pub mod store;
pub mod worker;

/// Protocol constants
pub mod constants {
    /// Wire protocol version.
    pub const PROTOCOL_VERSION: u32 = 1;
    /// Maximum encoded gossip message size (16 MiB).
    pub const MAX_WIRE_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
    /// Maximum operations carried by a single regular event.
    pub const MAX_OPERATIONS_PER_EVENT: usize = 250;
    /// Maximum encoded size of a single operation payload (128 KiB).
    pub const MAX_OPERATION_BYTES: usize = 128 * 1024;
    /// Maximum parents a merge event may reference.
    pub const MAX_MERGE_PARENTS: usize = 16;
    /// Maximum merge events returned by one gossip pull.
    pub const PULL_BATCH_LIMIT: usize = 100;
    /// Maximum rounds of targeted missing-parent fetches per gossip session.
    pub const MISSING_PARENT_FETCH_ROUNDS: usize = 10;
    /// Default per-pull timeout in milliseconds.
    pub const PULL_TIMEOUT_MS: u64 = 30_000;
    /// Target capacity for positive-reputation peers.
    pub const PEER_CAPACITY: usize = 100;
    /// Additional capacity for untrusted (reputation 0) peers.
    pub const UNTRUSTED_PEER_CAPACITY: usize = 10;
    /// Default bound on the pending-operation queue.
    pub const OPERATION_QUEUE_CAPACITY: usize = 1_000;
}

/// 32-byte hash used throughout the protocol.
pub type Hash = [u8; 32];

/// The all-zero hash, used as the genesis tree marker.
pub const ZERO_HASH: Hash = [0u8; 32];

/// Compute a domain-separated BLAKE3 hash.
///
/// The domain MUST be valid UTF-8 (all weft domains use ASCII). Panics at
/// runtime if the domain is not valid UTF-8 — this is a programming error.
pub fn hash_domain(domain: &[u8], data: &[u8]) -> Hash {
    let domain_str = std::str::from_utf8(domain).expect("hash_domain: domain must be valid UTF-8");
    let mut hasher = blake3::Hasher::new_derive_key(domain_str);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Render a hash as a multibase base16 string (`f` prefix + lowercase hex).
///
/// This is the canonical textual form used in the JSON event encoding and
/// everywhere a hash crosses the wire as a string.
pub fn multibase_encode(hash: &Hash) -> String {
    format!("f{}", hex::encode(hash))
}

/// Parse a multibase base16 string back into a hash.
///
/// Returns `None` for a missing `f` prefix, wrong length, or non-hex input.
pub fn multibase_decode(s: &str) -> Option<Hash> {
    let rest = s.strip_prefix('f')?;
    if rest.len() != 64 {
        return None;
    }
    let bytes = hex::decode(rest).ok()?;
    bytes.try_into().ok()
}

/// Current wall-clock time in milliseconds since the UNIX epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
