//! Key management and signing primitives.
//!
//! Events and gossip identities are bound to Ed25519 keys. Peer and creator
//! identifiers are BLAKE3 fingerprints of the verifying key, so an identity
//! can always be checked against the key that signed for it.

pub mod keys;

pub use keys::{Signature, SigningKeypair, SigningPublicKey};
