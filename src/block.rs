//! Blocks, ledger configuration, and genesis construction.
//!
//! A block is an ordered sequence of consensus-committed events at one
//! height. The block hash covers the height, the previous block hash, the
//! ordered event set, and the consensus proof — but not the local
//! consensus date, which is a per-node clock reading and would otherwise
//! break cross-node block-hash agreement.

use serde::{Deserialize, Serialize};

use crate::crypto::{SigningKeypair, SigningPublicKey};
use crate::event::{multibase_newtype, CreatorId, Event, EventHash, LedgerId, Operation};
use crate::Hash;

/// Content-addressed block identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockHash(pub Hash);

multibase_newtype!(BlockHash, "BlockHash");

/// An ordered block of consensus-committed events.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub previous_block_hash: BlockHash,
    pub block_hash: BlockHash,
    /// Committed events in consensus order.
    pub event_hashes: Vec<EventHash>,
    /// The Y-events whose mutual support decided this block. Empty for
    /// trivial (`f = 0`) decisions; length 1 (the configurator's genesis
    /// merge) for the genesis block.
    pub consensus_proof: Vec<EventHash>,
    /// Local wall-clock time of the consensus decision. Not hashed.
    pub consensus_date_ms: u64,
}

impl Block {
    pub fn new(
        height: u64,
        previous_block_hash: BlockHash,
        event_hashes: Vec<EventHash>,
        consensus_proof: Vec<EventHash>,
        consensus_date_ms: u64,
    ) -> Self {
        let mut block = Block {
            height,
            previous_block_hash,
            block_hash: BlockHash::zero(),
            event_hashes,
            consensus_proof,
            consensus_date_ms,
        };
        block.block_hash = block.computed_hash();
        block
    }

    /// Canonical JSON encoding used for the block hash. Sorted keys, no
    /// whitespace; `block_hash` and `consensus_date_ms` excluded.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut map = serde_json::Map::new();
        map.insert(
            "consensusProof".into(),
            serde_json::Value::Array(
                self.consensus_proof
                    .iter()
                    .map(|h| serde_json::json!(h.to_multibase()))
                    .collect(),
            ),
        );
        map.insert(
            "eventHashes".into(),
            serde_json::Value::Array(
                self.event_hashes
                    .iter()
                    .map(|h| serde_json::json!(h.to_multibase()))
                    .collect(),
            ),
        );
        map.insert("height".into(), serde_json::json!(self.height));
        map.insert(
            "previousBlockHash".into(),
            serde_json::json!(self.previous_block_hash.to_multibase()),
        );
        serde_json::to_vec(&serde_json::Value::Object(map))
            .expect("canonical block encoding cannot fail")
    }

    pub fn computed_hash(&self) -> BlockHash {
        BlockHash(crate::hash_domain(b"weft.block.id", &self.canonical_bytes()))
    }

    pub fn verify_hash(&self) -> bool {
        self.computed_hash() == self.block_hash
    }
}

/// A witness-pool member named by the ledger configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WitnessProfile {
    pub id: CreatorId,
    pub public_key: SigningPublicKey,
    /// Gossip address, e.g. `http://10.0.0.2:9760`.
    pub address: String,
}

/// The ledger configuration carried by the genesis block's configuration
/// event. Its canonical hash is the ledger id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerConfiguration {
    pub name: String,
    /// The peers eligible for witness selection. The per-height witness
    /// set is drawn deterministically from this pool.
    pub witness_pool: Vec<WitnessProfile>,
}

impl LedgerConfiguration {
    /// Derive the ledger id from the canonical configuration encoding.
    pub fn ledger_id(&self) -> LedgerId {
        let value = serde_json::to_value(self).expect("configuration encoding cannot fail");
        let bytes = serde_json::to_vec(&value).expect("configuration encoding cannot fail");
        LedgerId(crate::hash_domain(b"weft.ledger.id", &bytes))
    }

    /// Encode the configuration as the genesis configuration operation.
    pub fn to_operation(&self) -> Operation {
        let value = serde_json::to_value(self).expect("configuration encoding cannot fail");
        Operation::from_value(&value).expect("configuration fits the operation bound")
    }

    /// Decode a configuration back out of the genesis operation.
    pub fn from_operation(operation: &Operation) -> Option<Self> {
        serde_json::from_value(operation.to_value()).ok()
    }

    pub fn witness_ids(&self) -> Vec<CreatorId> {
        self.witness_pool.iter().map(|w| w.id).collect()
    }
}

/// Everything produced by ledger bootstrap: the configuration event, the
/// genesis merge, and the genesis block binding them. Serialized to a
/// shared file so every participant boots the identical genesis.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisBundle {
    pub configuration: LedgerConfiguration,
    pub ledger: LedgerId,
    pub configuration_event: Event,
    pub genesis_merge: Event,
    pub block: Block,
}

/// Build the genesis block for a ledger.
///
/// The configurator signs both genesis-era events; the genesis block's
/// consensus proof names the genesis merge alone.
pub fn build_genesis(
    configurator: &SigningKeypair,
    configuration: LedgerConfiguration,
    now_ms: u64,
) -> GenesisBundle {
    let ledger = configuration.ledger_id();
    let configuration_event =
        Event::genesis_configuration(configurator, ledger, configuration.to_operation());
    let genesis_merge = Event::genesis_merge(configurator, ledger);
    let block = Block::new(
        0,
        BlockHash::zero(),
        vec![configuration_event.event_hash, genesis_merge.event_hash],
        vec![genesis_merge.event_hash],
        now_ms,
    );
    GenesisBundle {
        configuration,
        ledger,
        configuration_event,
        genesis_merge,
        block,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_configuration(keypairs: &[SigningKeypair]) -> LedgerConfiguration {
        LedgerConfiguration {
            name: "weft-test".into(),
            witness_pool: keypairs
                .iter()
                .enumerate()
                .map(|(i, kp)| WitnessProfile {
                    id: CreatorId::from_key(&kp.public),
                    public_key: kp.public.clone(),
                    address: format!("http://127.0.0.1:{}", 9760 + i),
                })
                .collect(),
        }
    }

    #[test]
    fn block_hash_excludes_consensus_date() {
        let events = vec![EventHash(crate::hash_domain(b"weft.test", b"e1"))];
        let a = Block::new(1, BlockHash::zero(), events.clone(), vec![], 1_000);
        let b = Block::new(1, BlockHash::zero(), events, vec![], 99_000);
        assert_eq!(a.block_hash, b.block_hash);
    }

    #[test]
    fn block_hash_covers_events_and_proof() {
        let e1 = EventHash(crate::hash_domain(b"weft.test", b"e1"));
        let e2 = EventHash(crate::hash_domain(b"weft.test", b"e2"));
        let a = Block::new(1, BlockHash::zero(), vec![e1, e2], vec![], 0);
        let b = Block::new(1, BlockHash::zero(), vec![e2, e1], vec![], 0);
        let c = Block::new(1, BlockHash::zero(), vec![e1, e2], vec![e1], 0);
        assert_ne!(a.block_hash, b.block_hash);
        assert_ne!(a.block_hash, c.block_hash);
        assert!(a.verify_hash());
    }

    #[test]
    fn genesis_bundle_is_consistent() {
        let configurator = SigningKeypair::generate();
        let configuration = test_configuration(std::slice::from_ref(&configurator));
        let genesis = build_genesis(&configurator, configuration, 1_000);

        assert_eq!(genesis.block.height, 0);
        assert_eq!(genesis.block.consensus_proof.len(), 1);
        assert_eq!(
            genesis.block.consensus_proof[0],
            genesis.genesis_merge.event_hash
        );
        assert_eq!(genesis.block.event_hashes.len(), 2);
        assert!(genesis.genesis_merge.is_genesis_era());
        assert!(genesis
            .configuration_event
            .check_shape(genesis.ledger, true)
            .is_ok());
        assert!(genesis.genesis_merge.verify_signature().is_ok());
    }

    #[test]
    fn configuration_operation_roundtrip() {
        let kp = SigningKeypair::generate();
        let configuration = test_configuration(std::slice::from_ref(&kp));
        let op = configuration.to_operation();
        let decoded = LedgerConfiguration::from_operation(&op).unwrap();
        assert_eq!(decoded.ledger_id(), configuration.ledger_id());
        assert_eq!(decoded.witness_pool.len(), 1);
    }

    #[test]
    fn ledger_id_tracks_configuration() {
        let a = SigningKeypair::generate();
        let b = SigningKeypair::generate();
        let config_a = test_configuration(std::slice::from_ref(&a));
        let config_b = test_configuration(std::slice::from_ref(&b));
        assert_ne!(config_a.ledger_id(), config_b.ledger_id());
    }
}
