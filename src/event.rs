//! Event envelope, canonical form, and structural validation.
//!
//! Two event variants share one envelope. A *regular* event carries opaque
//! operation payloads and chains onto the creator's own history. A *merge*
//! event carries no payload and joins the creator's chain head with merge
//! events by other creators, weaving per-creator chains into one DAG.
//!
//! Identity is content-addressed: `event_hash` is the BLAKE3 hash of the
//! canonical JSON form with the signature stripped from the hash input.
//! The canonical form has lexicographically sorted keys and no whitespace,
//! so it is stable across nodes and rewrites.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::{Signature, SigningKeypair, SigningPublicKey};
use crate::{constants, Hash};

/// Content-addressed event identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventHash(pub Hash);

/// Stable creator identity (fingerprint of the creator's verifying key).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CreatorId(pub Hash);

/// Ledger identity (hash of the ledger configuration's canonical form).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LedgerId(pub Hash);

macro_rules! multibase_newtype {
    ($name:ident, $expected:literal) => {
        impl $name {
            /// The all-zero marker value.
            pub fn zero() -> Self {
                $name(crate::ZERO_HASH)
            }

            pub fn is_zero(&self) -> bool {
                self.0 == crate::ZERO_HASH
            }

            /// Render as a multibase base16 string.
            pub fn to_multibase(&self) -> String {
                crate::multibase_encode(&self.0)
            }

            /// Parse from a multibase base16 string.
            pub fn from_multibase(s: &str) -> Option<Self> {
                crate::multibase_decode(s).map($name)
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(&self.to_multibase())
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                // Short form keeps log lines readable.
                write!(f, concat!($expected, "({}..)"), hex::encode(&self.0[..6]))
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                if s.is_human_readable() {
                    s.serialize_str(&self.to_multibase())
                } else {
                    serde::Serialize::serialize(&self.0, s)
                }
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                if d.is_human_readable() {
                    let text: String = serde::Deserialize::deserialize(d)?;
                    Self::from_multibase(&text)
                        .ok_or_else(|| serde::de::Error::custom("invalid multibase hash"))
                } else {
                    let bytes: crate::Hash = serde::Deserialize::deserialize(d)?;
                    Ok($name(bytes))
                }
            }
        }
    };
}

pub(crate) use multibase_newtype;

multibase_newtype!(EventHash, "EventHash");
multibase_newtype!(CreatorId, "CreatorId");
multibase_newtype!(LedgerId, "LedgerId");

impl CreatorId {
    /// Derive the creator id from a verifying key.
    pub fn from_key(key: &SigningPublicKey) -> Self {
        CreatorId(key.fingerprint())
    }
}

/// An opaque operation payload.
///
/// Stored as canonical JSON bytes so the binary codec stays
/// self-contained; the JSON form embeds the payload inline.
#[derive(Clone, PartialEq, Eq)]
pub struct Operation(Vec<u8>);

impl Operation {
    /// Canonicalize an arbitrary JSON payload into an operation.
    ///
    /// Returns `None` if the encoded payload exceeds the per-operation
    /// size bound.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        let bytes = serde_json::to_vec(value).ok()?;
        if bytes.len() > constants::MAX_OPERATION_BYTES {
            return None;
        }
        Some(Operation(bytes))
    }

    /// Decode the payload back into JSON.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::from_slice(&self.0).unwrap_or(serde_json::Value::Null)
    }

    /// Encoded payload size in bytes.
    pub fn encoded_len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Operation({} bytes)", self.0.len())
    }
}

impl Serialize for Operation {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        if s.is_human_readable() {
            self.to_value().serialize(s)
        } else {
            serde::Serialize::serialize(&self.0, s)
        }
    }
}

impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        if d.is_human_readable() {
            let value: serde_json::Value = serde::Deserialize::deserialize(d)?;
            Operation::from_value(&value)
                .ok_or_else(|| serde::de::Error::custom("operation payload too large"))
        } else {
            let bytes: Vec<u8> = serde::Deserialize::deserialize(d)?;
            if bytes.len() > constants::MAX_OPERATION_BYTES {
                return Err(serde::de::Error::custom("operation payload too large"));
            }
            Ok(Operation(bytes))
        }
    }
}

/// Event variant: operation-carrying or chain-weaving.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// Opaque operations chained onto the creator's own history.
    Regular { operations: Vec<Operation> },
    /// Payload-free join of the creator's head with remote merge heads.
    Merge,
}

impl EventKind {
    pub fn is_merge(&self) -> bool {
        matches!(self, EventKind::Merge)
    }
}

/// A signed event in the ledger DAG.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    /// Content-addressed identifier (hash of the canonical form).
    pub event_hash: EventHash,
    /// Ledger this event belongs to (prevents cross-ledger replay).
    pub ledger: LedgerId,
    /// Fingerprint of `creator_key`.
    pub creator: CreatorId,
    /// Verifying key of the producing peer.
    pub creator_key: SigningPublicKey,
    /// Variant and payload.
    pub kind: EventKind,
    /// Parent in the creator's own chain (zero only for genesis-era events).
    pub tree_hash: EventHash,
    /// All parents. Regular events: `[tree_hash]`. Merge events: the tree
    /// parent plus merge events by distinct other creators.
    pub parent_hashes: Vec<EventHash>,
    /// Committing block height visible to the creator when emitted.
    pub basis_block_height: u64,
    /// `1 + max(parent merge heights)`; 0 for the genesis-era events.
    pub merge_height: u64,
    /// Detached signature over the canonical form.
    pub signature: Signature,
}

/// Store-owned bookkeeping attached to each event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    /// Whether the event has been committed by consensus.
    pub consensus: bool,
    /// Wall-clock time of the local consensus decision.
    pub consensus_date_ms: Option<u64>,
    /// Height of the block that committed this event.
    pub block_height: Option<u64>,
    /// Continuity bookkeeping: the creator as seen by the consensus method.
    pub creator: CreatorId,
    pub created_ms: u64,
    pub updated_ms: u64,
}

impl EventMeta {
    pub fn new(creator: CreatorId, now_ms: u64) -> Self {
        EventMeta {
            consensus: false,
            consensus_date_ms: None,
            block_height: None,
            creator,
            created_ms: now_ms,
            updated_ms: now_ms,
        }
    }
}

/// Structural validation failures.
///
/// Everything here is fatal for the offending event; senders of malformed
/// events are treated as Byzantine by the gossip layer.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    #[error("creator id does not match creator key fingerprint")]
    CreatorMismatch,
    #[error("event belongs to a different ledger")]
    LedgerMismatch,
    #[error("event hash does not match canonical content")]
    HashMismatch,
    #[error("signature verification failed")]
    BadSignature,
    #[error("regular event must carry 1..{} operations", constants::MAX_OPERATIONS_PER_EVENT)]
    BadOperationCount,
    #[error("regular event parents must equal [tree_hash]")]
    BadRegularParents,
    #[error("merge event has no parents")]
    NoParents,
    #[error("merge event exceeds {} parents", constants::MAX_MERGE_PARENTS)]
    TooManyParents,
    #[error("merge event parents must contain the tree parent exactly once")]
    MissingTreeParent,
    #[error("duplicate parent reference")]
    DuplicateParent,
    #[error("genesis-era event outside bootstrap")]
    UnexpectedGenesis,
    #[error("merge height must be positive for non-genesis events")]
    BadMergeHeight,
}

impl Event {
    /// Build and sign a regular event.
    pub fn regular(
        keypair: &SigningKeypair,
        ledger: LedgerId,
        operations: Vec<Operation>,
        tree_hash: EventHash,
        basis_block_height: u64,
        merge_height: u64,
    ) -> Self {
        Self::build(
            keypair,
            ledger,
            EventKind::Regular { operations },
            tree_hash,
            vec![tree_hash],
            basis_block_height,
            merge_height,
        )
    }

    /// Build and sign a merge event.
    ///
    /// `parent_hashes` must contain `tree_hash`; the merge scheduler is
    /// responsible for ordering and threshold policy.
    pub fn merge(
        keypair: &SigningKeypair,
        ledger: LedgerId,
        tree_hash: EventHash,
        parent_hashes: Vec<EventHash>,
        basis_block_height: u64,
        merge_height: u64,
    ) -> Self {
        Self::build(
            keypair,
            ledger,
            EventKind::Merge,
            tree_hash,
            parent_hashes,
            basis_block_height,
            merge_height,
        )
    }

    /// Build and sign the genesis merge event: no parents, merge height 0.
    pub fn genesis_merge(keypair: &SigningKeypair, ledger: LedgerId) -> Self {
        Self::build(
            keypair,
            ledger,
            EventKind::Merge,
            EventHash::zero(),
            vec![],
            0,
            0,
        )
    }

    /// Build and sign the ledger configuration event: a parentless regular
    /// event carried only by the genesis block.
    pub fn genesis_configuration(
        keypair: &SigningKeypair,
        ledger: LedgerId,
        configuration: Operation,
    ) -> Self {
        Self::build(
            keypair,
            ledger,
            EventKind::Regular {
                operations: vec![configuration],
            },
            EventHash::zero(),
            vec![],
            0,
            0,
        )
    }

    fn build(
        keypair: &SigningKeypair,
        ledger: LedgerId,
        kind: EventKind,
        tree_hash: EventHash,
        parent_hashes: Vec<EventHash>,
        basis_block_height: u64,
        merge_height: u64,
    ) -> Self {
        let mut event = Event {
            event_hash: EventHash::zero(),
            ledger,
            creator: CreatorId::from_key(&keypair.public),
            creator_key: keypair.public.clone(),
            kind,
            tree_hash,
            parent_hashes,
            basis_block_height,
            merge_height,
            signature: Signature::empty(),
        };
        let canonical = event.canonical_bytes();
        event.event_hash = EventHash(crate::hash_domain(b"weft.event.id", &canonical));
        event.signature = keypair.sign(&canonical);
        event
    }

    /// Canonical JSON encoding used for hashing and signing.
    ///
    /// Keys are lexicographically sorted (the JSON map is BTreeMap-backed)
    /// and the output carries no whitespace. The signature and the event
    /// hash itself are not part of the encoding.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut map = serde_json::Map::new();
        map.insert(
            "basisBlockHeight".into(),
            serde_json::json!(self.basis_block_height),
        );
        map.insert("creator".into(), serde_json::json!(self.creator.to_multibase()));
        map.insert(
            "creatorKey".into(),
            serde_json::json!(crate::multibase_encode(self.creator_key.as_bytes())),
        );
        map.insert("ledger".into(), serde_json::json!(self.ledger.to_multibase()));
        map.insert("mergeHeight".into(), serde_json::json!(self.merge_height));
        match &self.kind {
            EventKind::Regular { operations } => {
                let ops: Vec<serde_json::Value> =
                    operations.iter().map(|op| op.to_value()).collect();
                map.insert("operations".into(), serde_json::Value::Array(ops));
                map.insert("type".into(), serde_json::json!("r"));
            }
            EventKind::Merge => {
                map.insert("type".into(), serde_json::json!("m"));
            }
        }
        let parents: Vec<serde_json::Value> = self
            .parent_hashes
            .iter()
            .map(|p| serde_json::json!(p.to_multibase()))
            .collect();
        map.insert("parentHashes".into(), serde_json::Value::Array(parents));
        map.insert("treeHash".into(), serde_json::json!(self.tree_hash.to_multibase()));
        serde_json::to_vec(&serde_json::Value::Object(map))
            .expect("canonical event encoding cannot fail")
    }

    /// Recompute the content hash from the canonical form.
    pub fn computed_hash(&self) -> EventHash {
        EventHash(crate::hash_domain(b"weft.event.id", &self.canonical_bytes()))
    }

    /// True for the two genesis-era shapes (zero tree hash, no parents).
    pub fn is_genesis_era(&self) -> bool {
        self.tree_hash.is_zero() && self.parent_hashes.is_empty()
    }

    /// Shape validation: field consistency and variant-specific parent
    /// rules. Signature and hash checks are separate steps so the store
    /// can apply the full validation order explicitly.
    pub fn check_shape(&self, ledger: LedgerId, allow_genesis: bool) -> Result<(), EventError> {
        if self.ledger != ledger {
            return Err(EventError::LedgerMismatch);
        }
        if self.creator != CreatorId::from_key(&self.creator_key) {
            return Err(EventError::CreatorMismatch);
        }
        if self.is_genesis_era() {
            if !allow_genesis {
                return Err(EventError::UnexpectedGenesis);
            }
            if self.merge_height != 0 || self.basis_block_height != 0 {
                return Err(EventError::BadMergeHeight);
            }
            if let EventKind::Regular { operations } = &self.kind {
                if operations.len() != 1 {
                    return Err(EventError::BadOperationCount);
                }
            }
            return Ok(());
        }
        if self.merge_height == 0 {
            return Err(EventError::BadMergeHeight);
        }
        match &self.kind {
            EventKind::Regular { operations } => {
                if operations.is_empty()
                    || operations.len() > constants::MAX_OPERATIONS_PER_EVENT
                {
                    return Err(EventError::BadOperationCount);
                }
                if self.parent_hashes.len() != 1 || self.parent_hashes[0] != self.tree_hash {
                    return Err(EventError::BadRegularParents);
                }
            }
            EventKind::Merge => {
                if self.parent_hashes.is_empty() {
                    return Err(EventError::NoParents);
                }
                if self.parent_hashes.len() > constants::MAX_MERGE_PARENTS {
                    return Err(EventError::TooManyParents);
                }
                let tree_count = self
                    .parent_hashes
                    .iter()
                    .filter(|p| **p == self.tree_hash)
                    .count();
                if tree_count != 1 {
                    return Err(EventError::MissingTreeParent);
                }
                let mut seen = std::collections::HashSet::new();
                for parent in &self.parent_hashes {
                    if !seen.insert(*parent) {
                        return Err(EventError::DuplicateParent);
                    }
                }
            }
        }
        Ok(())
    }

    /// Verify the event hash against the canonical content.
    pub fn verify_hash(&self) -> Result<(), EventError> {
        if self.computed_hash() != self.event_hash {
            return Err(EventError::HashMismatch);
        }
        Ok(())
    }

    /// Verify the creator's signature over the canonical form.
    pub fn verify_signature(&self) -> Result<(), EventError> {
        if !self.creator_key.verify(&self.canonical_bytes(), &self.signature) {
            return Err(EventError::BadSignature);
        }
        Ok(())
    }

    /// Non-tree parent hashes of a merge event.
    pub fn non_tree_parents(&self) -> impl Iterator<Item = &EventHash> {
        self.parent_hashes.iter().filter(move |p| **p != self.tree_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ledger() -> LedgerId {
        LedgerId(crate::hash_domain(b"weft.ledger.id", b"test"))
    }

    fn op(n: u64) -> Operation {
        Operation::from_value(&serde_json::json!({ "op": n })).unwrap()
    }

    #[test]
    fn regular_event_is_well_formed() {
        let kp = SigningKeypair::generate();
        let ledger = test_ledger();
        let tree = EventHash(crate::hash_domain(b"weft.test", b"tree"));
        let event = Event::regular(&kp, ledger, vec![op(1)], tree, 0, 3);

        assert!(event.check_shape(ledger, false).is_ok());
        assert!(event.verify_hash().is_ok());
        assert!(event.verify_signature().is_ok());
        assert_eq!(event.parent_hashes, vec![tree]);
    }

    #[test]
    fn canonical_form_is_sorted_and_compact() {
        let kp = SigningKeypair::generate();
        let event = Event::genesis_merge(&kp, test_ledger());
        let canonical = String::from_utf8(event.canonical_bytes()).unwrap();

        assert!(!canonical.contains(' '));
        assert!(!canonical.contains("signature"));
        assert!(!canonical.contains("eventHash"));
        // Keys appear in lexicographic order.
        let basis = canonical.find("basisBlockHeight").unwrap();
        let creator = canonical.find("\"creator\"").unwrap();
        let tree = canonical.find("treeHash").unwrap();
        assert!(basis < creator && creator < tree);
    }

    #[test]
    fn hash_is_stable_across_reencode() {
        let kp = SigningKeypair::generate();
        let tree = EventHash(crate::hash_domain(b"weft.test", b"tree"));
        let event = Event::regular(&kp, test_ledger(), vec![op(7)], tree, 2, 5);

        let json = serde_json::to_string(&event).unwrap();
        let decoded: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.computed_hash(), event.event_hash);

        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded.computed_hash(), event.event_hash);
    }

    #[test]
    fn tampering_breaks_hash_and_signature() {
        let kp = SigningKeypair::generate();
        let tree = EventHash(crate::hash_domain(b"weft.test", b"tree"));
        let mut event = Event::regular(&kp, test_ledger(), vec![op(1)], tree, 0, 3);
        event.basis_block_height = 9;

        assert_eq!(event.verify_hash(), Err(EventError::HashMismatch));
        assert_eq!(event.verify_signature(), Err(EventError::BadSignature));
    }

    #[test]
    fn merge_shape_requires_tree_parent() {
        let kp = SigningKeypair::generate();
        let ledger = test_ledger();
        let tree = EventHash(crate::hash_domain(b"weft.test", b"tree"));
        let other = EventHash(crate::hash_domain(b"weft.test", b"other"));

        let event = Event::merge(&kp, ledger, tree, vec![other], 0, 2);
        assert_eq!(
            event.check_shape(ledger, false),
            Err(EventError::MissingTreeParent)
        );

        let event = Event::merge(&kp, ledger, tree, vec![tree, other], 0, 2);
        assert!(event.check_shape(ledger, false).is_ok());
    }

    #[test]
    fn merge_shape_rejects_duplicate_parent() {
        let kp = SigningKeypair::generate();
        let ledger = test_ledger();
        let tree = EventHash(crate::hash_domain(b"weft.test", b"tree"));
        let other = EventHash(crate::hash_domain(b"weft.test", b"other"));

        let event = Event::merge(&kp, ledger, tree, vec![tree, other, other], 0, 2);
        assert_eq!(
            event.check_shape(ledger, false),
            Err(EventError::DuplicateParent)
        );
    }

    #[test]
    fn genesis_rejected_outside_bootstrap() {
        let kp = SigningKeypair::generate();
        let ledger = test_ledger();
        let genesis = Event::genesis_merge(&kp, ledger);
        assert!(genesis.check_shape(ledger, true).is_ok());
        assert_eq!(
            genesis.check_shape(ledger, false),
            Err(EventError::UnexpectedGenesis)
        );
    }

    #[test]
    fn wrong_ledger_rejected() {
        let kp = SigningKeypair::generate();
        let genesis = Event::genesis_merge(&kp, test_ledger());
        let other = LedgerId(crate::hash_domain(b"weft.ledger.id", b"other"));
        assert_eq!(
            genesis.check_shape(other, true),
            Err(EventError::LedgerMismatch)
        );
    }

    #[test]
    fn operation_canonicalizes_nested_keys() {
        let a = Operation::from_value(&serde_json::json!({ "b": 1, "a": 2 })).unwrap();
        let b = Operation::from_value(&serde_json::json!({ "a": 2, "b": 1 })).unwrap();
        assert_eq!(a, b);
    }
}
