//! Property-style tests for the consensus engine and event model:
//! determinism, canonical-form stability, DAG invariants, and the
//! bounded-reputation guarantee.

use std::collections::BTreeSet;

use weft::block::{build_genesis, Block, BlockHash, LedgerConfiguration, WitnessProfile};
use weft::config::ContinuityConfig;
use weft::consensus::{
    select_witnesses, ConsensusInput, ConsensusMethod, Continuity2017, WitnessSet,
};
use weft::crypto::SigningKeypair;
use weft::event::{CreatorId, Event, EventHash, LedgerId, Operation};
use weft::peers::{GossipFailure, GossipSuccess, PeerRegistry};
use weft::store::{DagSlice, EventStore, InsertOrigin};

fn op(n: u64) -> Operation {
    Operation::from_value(&serde_json::json!({ "n": n })).unwrap()
}

fn test_ledger() -> LedgerId {
    LedgerId(weft::hash_domain(b"weft.ledger.id", b"properties"))
}

/// Build a two-round DAG over `n` creators: bootstrap merges, then a
/// full cross-merge round.
fn two_round_dag(keypairs: &[SigningKeypair]) -> Vec<Event> {
    let ledger = test_ledger();
    let genesis = EventHash(weft::hash_domain(b"weft.test", b"genesis"));
    let mut events = Vec::new();

    let round1: Vec<EventHash> = keypairs
        .iter()
        .map(|kp| {
            let event = Event::merge(kp, ledger, genesis, vec![genesis], 0, 1);
            let hash = event.event_hash;
            events.push(event);
            hash
        })
        .collect();

    for (i, kp) in keypairs.iter().enumerate() {
        let mut parents = vec![round1[i]];
        parents.extend(round1.iter().enumerate().filter(|(j, _)| *j != i).map(|(_, h)| *h));
        let event = Event::merge(kp, ledger, round1[i], parents, 0, 2);
        events.push(event);
    }
    events
}

#[test]
fn engine_output_is_identical_for_identical_slices() {
    let keypairs: Vec<SigningKeypair> = (0..4).map(|_| SigningKeypair::generate()).collect();
    let events = two_round_dag(&keypairs);
    let witnesses = WitnessSet::new(
        keypairs.iter().map(|kp| CreatorId::from_key(&kp.public)).collect(),
        1,
    );

    // Three "nodes" build the slice from differently ordered event lists.
    let mut orderings = vec![events.clone(), events.clone(), events];
    orderings[1].reverse();
    orderings[2].rotate_left(3);

    let decisions: Vec<_> = orderings
        .into_iter()
        .map(|events| {
            let slice = DagSlice::from_events(events);
            Continuity2017
                .evaluate(&ConsensusInput {
                    slice: &slice,
                    witnesses: &witnesses,
                    latest_block_height: 0,
                })
                .decision
                .expect("two full rounds decide")
        })
        .collect();

    assert_eq!(decisions[0], decisions[1]);
    assert_eq!(decisions[1], decisions[2]);

    // Blocks built from the identical decision agree on their hash even
    // when local consensus clocks differ.
    let a = Block::new(
        1,
        BlockHash::zero(),
        decisions[0].event_hashes.clone(),
        decisions[0].consensus_proof.clone(),
        1_111,
    );
    let b = Block::new(
        1,
        BlockHash::zero(),
        decisions[1].event_hashes.clone(),
        decisions[1].consensus_proof.clone(),
        9_999_999,
    );
    assert_eq!(a.block_hash, b.block_hash);
}

#[test]
fn decided_events_are_never_their_own_ancestors() {
    let keypairs: Vec<SigningKeypair> = (0..4).map(|_| SigningKeypair::generate()).collect();
    let slice = DagSlice::from_events(two_round_dag(&keypairs));
    for event in slice.iter() {
        assert!(
            !slice.ancestors(&event.event_hash).contains(&event.event_hash),
            "event {} is its own ancestor",
            event.event_hash
        );
    }
}

#[test]
fn block_json_round_trip_preserves_identity() {
    let e1 = EventHash(weft::hash_domain(b"weft.test", b"e1"));
    let e2 = EventHash(weft::hash_domain(b"weft.test", b"e2"));
    let block = Block::new(3, BlockHash::zero(), vec![e1, e2], vec![e2], 42_000);

    let json = serde_json::to_string(&block).unwrap();
    let decoded: Block = serde_json::from_str(&json).unwrap();
    assert!(decoded.verify_hash());
    assert_eq!(decoded.block_hash, block.block_hash);
    assert_eq!(decoded.event_hashes, block.event_hashes);
    assert_eq!(decoded.consensus_proof, block.consensus_proof);

    // Canonical bytes are stable across the round trip.
    assert_eq!(decoded.canonical_bytes(), block.canonical_bytes());
}

#[test]
fn event_wire_round_trip_preserves_hash_and_signature() {
    let kp = SigningKeypair::generate();
    let tree = EventHash(weft::hash_domain(b"weft.test", b"tree"));
    let event = Event::regular(&kp, test_ledger(), vec![op(5)], tree, 2, 7);

    let json: Event = serde_json::from_slice(&serde_json::to_vec(&event).unwrap()).unwrap();
    let binary: Event = bincode::deserialize(&bincode::serialize(&event).unwrap()).unwrap();
    for decoded in [json, binary] {
        assert_eq!(decoded.event_hash, event.event_hash);
        assert!(decoded.verify_hash().is_ok());
        assert!(decoded.verify_signature().is_ok());
    }
}

#[test]
fn witness_sets_always_have_bft_size() {
    for pool_size in 1..=13usize {
        let pool: Vec<CreatorId> = (0..pool_size)
            .map(|n| CreatorId(weft::hash_domain(b"weft.test.pool", &[n as u8])))
            .collect();
        let set = select_witnesses(&BlockHash::zero(), &pool);
        let f = (pool_size - 1) / 3;
        assert_eq!(set.fault_bound() as usize, f);
        assert_eq!(set.len(), 3 * f + 1);
        assert!(set.len() <= pool_size);
        // Members come from the pool.
        let pool_set: BTreeSet<_> = pool.iter().copied().collect();
        assert!(set.members().iter().all(|m| pool_set.contains(m)));
    }
}

#[test]
fn store_holds_dag_invariants_through_growth_and_commit() {
    let keypairs: Vec<SigningKeypair> = (0..3).map(|_| SigningKeypair::generate()).collect();
    let configuration = LedgerConfiguration {
        name: "properties".into(),
        witness_pool: keypairs
            .iter()
            .map(|kp| WitnessProfile {
                id: CreatorId::from_key(&kp.public),
                public_key: kp.public.clone(),
                address: "loopback://x".into(),
            })
            .collect(),
    };
    let genesis = build_genesis(&keypairs[0], configuration, 1_000);
    let store = EventStore::open_temporary(&genesis, 1_000).unwrap();
    let ledger = store.ledger();
    let genesis_hash = genesis.genesis_merge.event_hash;

    // Three creators build chains and cross-merge over several rounds.
    let mut heads: Vec<EventHash> = vec![genesis_hash; 3];
    let mut heights: Vec<u64> = vec![0; 3];
    for round in 0..6u64 {
        for (i, kp) in keypairs.iter().enumerate() {
            let regular = Event::regular(
                kp,
                ledger,
                vec![op(round * 10 + i as u64)],
                heads[i],
                0,
                heights[i] + 1,
            );
            store.insert(&regular, InsertOrigin::Local, round).unwrap();
            let others: Vec<EventHash> = (0..3)
                .filter(|j| *j != i && heads[*j] != genesis_hash)
                .map(|j| heads[j])
                .collect();
            let mut parents = vec![regular.event_hash];
            parents.extend(others.iter().copied());
            let merge_height = heights
                .iter()
                .copied()
                .max()
                .unwrap_or(0)
                .max(heights[i] + 1)
                + 1;
            let merge = Event::merge(
                kp,
                ledger,
                regular.event_hash,
                parents,
                0,
                merge_height,
            );
            store.insert(&merge, InsertOrigin::Peer, round).unwrap();
            heads[i] = merge.event_hash;
            heights[i] = merge_height;
        }
        store.verify_dag_invariants().unwrap();
    }

    // A fork attempt is rejected and recorded.
    let fork = Event::regular(&keypairs[1], ledger, vec![op(999)], genesis_hash, 0, 1);
    assert!(store.insert(&fork, InsertOrigin::Peer, 99).is_err());
    assert!(store
        .forked_creators()
        .contains(&CreatorId::from_key(&keypairs[1].public)));
    store.verify_dag_invariants().unwrap();

    // Commit whatever a trivial single-witness evaluation decides and
    // re-check the invariants (including the basis bound).
    let slice = store.recent_history();
    let witnesses = WitnessSet::new(
        [CreatorId::from_key(&keypairs[0].public)].into_iter().collect(),
        0,
    );
    let result = Continuity2017.evaluate(&ConsensusInput {
        slice: &slice,
        witnesses: &witnesses,
        latest_block_height: 0,
    });
    let decision = result.decision.expect("witness chain decides trivially");
    let block = Block::new(
        1,
        genesis.block.block_hash,
        decision.event_hashes,
        decision.consensus_proof,
        2_000,
    );
    store.commit_block(&block).unwrap();
    store.verify_dag_invariants().unwrap();
}

#[test]
fn reputation_remains_bounded_under_arbitrary_histories() {
    let config = ContinuityConfig {
        max_failure_grace_ms: 10_000,
        max_idle_grace_ms: 10_000,
        ..Default::default()
    };
    let db = sled::Config::new().temporary(true).open().unwrap();
    let registry = PeerRegistry::open(db.open_tree("peers").unwrap(), config).unwrap();
    let peer = CreatorId(weft::hash_domain(b"weft.test.peer", &[1]));
    registry.ensure_peer(peer, "http://x", true, 0).unwrap();
    // Witnesses survive arbitrary histories, so the bound is observable
    // across the whole sequence.
    registry.set_witnesses([peer].into_iter().collect());

    let mut now = 0u64;
    for step in 0u64..500 {
        now += (step % 7) * 1_000;
        // A deterministic but irregular mix of outcomes.
        if step % 3 == 0 {
            let _ = registry.record_failure(
                &peer,
                GossipFailure {
                    error: "flaky".into(),
                    cursor: None,
                    fatal: false,
                },
                now,
            );
        } else {
            let _ = registry.record_success(
                &peer,
                GossipSuccess {
                    events_received: (step % 2) as usize,
                    cursor: None,
                    required_block_height: step / 10,
                    local_block_height: step / 7,
                },
                now,
            );
        }
        let record = registry.get(&peer).expect("witness is never deleted");
        assert!(
            (0..=100).contains(&record.reputation),
            "reputation escaped bounds at step {step}: {}",
            record.reputation
        );
    }
}
