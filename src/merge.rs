//! Merge scheduling: folding remote heads and pending operations into a
//! locally-signed merge event.
//!
//! At most one merge event is produced per worker cycle. Parent selection
//! is pure given the node context and the store's current heads: witness
//! heads are taken up to the target threshold, non-witness heads fill the
//! remainder, withheld (forked) creators are skipped, and the merge is
//! suppressed entirely when the minimum thresholds cannot be met.

use crate::block::BlockHash;
use crate::config::ContinuityConfig;
use crate::consensus::WitnessSet;
use crate::crypto::SigningKeypair;
use crate::event::{CreatorId, Event, EventHash, Operation};
use crate::store::{EventStore, InsertOrigin, StoreError};

/// Explicit node context handed to every merge decision; strategies are
/// pure given context + inputs.
#[derive(Clone, Debug)]
pub struct NodeContext {
    pub creator: CreatorId,
    pub latest_block_height: u64,
    /// Hash of the latest committed block; rotates head selection so no
    /// peer is starved out of merges indefinitely.
    pub latest_block_hash: BlockHash,
    pub witnesses: WitnessSet,
}

/// Errors from merge scheduling.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What one merge cycle produced.
#[derive(Clone, Debug)]
pub struct MergeOutcome {
    /// The regular event that carried pending operations, if any.
    pub regular_event: Option<Event>,
    pub merge_event: Event,
}

/// Produces at most one local merge event per cycle.
pub struct Merger {
    keypair: SigningKeypair,
    config: ContinuityConfig,
}

impl Merger {
    pub fn new(keypair: SigningKeypair, config: ContinuityConfig) -> Self {
        Merger { keypair, config }
    }

    /// Uniform draw against `operation_ready_chance`, gating whether this
    /// cycle folds pending operations into the chain.
    pub fn should_include_operations(&self, pending: usize) -> bool {
        if pending == 0 {
            return false;
        }
        rand::random::<f64>() < self.config.operation_ready_chance
    }

    /// Attempt a merge. `operations` is the drained batch to fold in (may
    /// be empty). Returns `None` when there is nothing to merge or the
    /// thresholds cannot be met this cycle.
    pub fn maybe_merge(
        &self,
        store: &EventStore,
        operations: Vec<Operation>,
        ctx: &NodeContext,
        now_ms: u64,
    ) -> Result<Option<MergeOutcome>, MergeError> {
        let branch_head = store.local_branch_head(&ctx.creator);
        let bootstrapping = branch_head == store.genesis_merge_hash();
        let slice = store.recent_history();
        let withheld = store.forked_creators();

        // Heads that are new relative to our own chain: uncommitted merge
        // heads by other creators that our branch head has not already
        // reached. Committed heads are known to everyone and add nothing.
        let own_ancestry = slice.ancestors(&branch_head);
        let mut witness_heads: Vec<(CreatorId, EventHash)> = Vec::new();
        let mut peer_heads: Vec<(CreatorId, EventHash)> = Vec::new();
        for (creator, head) in store.merge_heads() {
            if creator == ctx.creator || withheld.contains(&creator) {
                continue;
            }
            if !slice.contains(&head) || own_ancestry.contains(&head) {
                continue;
            }
            if ctx.witnesses.contains(&creator) {
                witness_heads.push((creator, head));
            } else {
                peer_heads.push((creator, head));
            }
        }
        // Deterministic selection order, rotated by the latest block hash
        // so truncation below never starves the same creators every cycle.
        let rotation_key = |creator: &CreatorId| {
            let mut input = Vec::with_capacity(64);
            input.extend_from_slice(&ctx.latest_block_hash.0);
            input.extend_from_slice(&creator.0);
            crate::hash_domain(b"weft.merge.rotate", &input)
        };
        witness_heads.sort_by_key(|(creator, _)| rotation_key(creator));
        peer_heads.sort_by_key(|(creator, _)| rotation_key(creator));

        let f = ctx.witnesses.fault_bound();
        let witness_minimum = self.config.witness_minimum_threshold.resolve(f) as usize;
        let witness_target = self
            .config
            .witness_target_threshold
            .resolve(f)
            .max(self.config.witness_minimum_threshold.resolve(f)) as usize;
        let peer_minimum = self.config.peer_minimum_threshold.resolve(f) as usize;

        // The first merge must anchor the chain to genesis before any
        // remote heads exist, so thresholds are waived for it.
        if !bootstrapping {
            if witness_heads.len() < witness_minimum || peer_heads.len() < peer_minimum {
                tracing::trace!(
                    witness_heads = witness_heads.len(),
                    peer_heads = peer_heads.len(),
                    "Merge thresholds unmet this cycle"
                );
                return Ok(None);
            }
            if witness_heads.is_empty() && peer_heads.is_empty() && operations.is_empty() {
                return Ok(None);
            }
        }

        // Reach for the witness target without blocking on it; cap the
        // parent set at the wire bound. Tiny witness sets resolve `2f` to
        // zero, so the take is floored at one head to keep the DAG woven.
        let parent_budget = crate::constants::MAX_MERGE_PARENTS - 1;
        let witness_take = witness_target.max(witness_minimum).max(1);
        let mut non_tree: Vec<EventHash> = witness_heads
            .iter()
            .take(witness_take.min(parent_budget))
            .map(|(_, h)| *h)
            .collect();
        non_tree.extend(
            peer_heads
                .iter()
                .take(parent_budget.saturating_sub(non_tree.len()))
                .map(|(_, h)| *h),
        );

        // Fold pending operations into a regular event chained ahead of
        // the merge, keeping the creator's chain total.
        let chain_head = store.chain_head(&ctx.creator);
        let chain_head_height = store
            .get_event(&chain_head)?
            .map(|e| e.merge_height)
            .unwrap_or(0);
        let ledger = store.ledger();

        let mut regular_event = None;
        let (tree_hash, tree_height) = if operations.is_empty() {
            (chain_head, chain_head_height)
        } else {
            let event = Event::regular(
                &self.keypair,
                ledger,
                operations,
                chain_head,
                ctx.latest_block_height,
                chain_head_height + 1,
            );
            store.insert(&event, InsertOrigin::Local, now_ms)?;
            tracing::debug!(event = %event.event_hash, "Folded operations into chain");
            let height = event.merge_height;
            let hash = event.event_hash;
            regular_event = Some(event);
            (hash, height)
        };

        let mut merge_height = tree_height;
        for parent in &non_tree {
            if let Some(event) = store.get_event(parent)? {
                merge_height = merge_height.max(event.merge_height);
            }
        }

        let mut parent_hashes = vec![tree_hash];
        parent_hashes.extend(non_tree.iter().copied());
        let merge_event = Event::merge(
            &self.keypair,
            ledger,
            tree_hash,
            parent_hashes,
            ctx.latest_block_height,
            merge_height + 1,
        );
        store.insert(&merge_event, InsertOrigin::Local, now_ms)?;
        tracing::debug!(
            event = %merge_event.event_hash,
            parents = merge_event.parent_hashes.len(),
            height = merge_event.merge_height,
            "Created merge event"
        );

        Ok(Some(MergeOutcome {
            regular_event,
            merge_event,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{build_genesis, GenesisBundle, LedgerConfiguration, WitnessProfile};
    use crate::config::{SymbolicThreshold, Threshold};
    use crate::consensus::select_witnesses;
    use crate::store::InsertOutcome;
    use std::collections::BTreeSet;

    fn genesis_for(keypairs: &[SigningKeypair]) -> GenesisBundle {
        let configuration = LedgerConfiguration {
            name: "merge-test".into(),
            witness_pool: keypairs
                .iter()
                .map(|kp| WitnessProfile {
                    id: CreatorId::from_key(&kp.public),
                    public_key: kp.public.clone(),
                    address: "loopback://x".into(),
                })
                .collect(),
        };
        build_genesis(&keypairs[0], configuration, 1_000)
    }

    fn context(keypairs: &[SigningKeypair], me: usize, genesis: &GenesisBundle) -> NodeContext {
        let pool: Vec<CreatorId> = keypairs
            .iter()
            .map(|kp| CreatorId::from_key(&kp.public))
            .collect();
        NodeContext {
            creator: CreatorId::from_key(&keypairs[me].public),
            latest_block_height: 0,
            latest_block_hash: genesis.block.block_hash,
            witnesses: select_witnesses(&genesis.block.block_hash, &pool),
        }
    }

    fn op(n: u64) -> Operation {
        Operation::from_value(&serde_json::json!({ "n": n })).unwrap()
    }

    #[test]
    fn bootstrap_merge_anchors_to_genesis() {
        let keypairs: Vec<SigningKeypair> = (0..4).map(|_| SigningKeypair::generate()).collect();
        let genesis = genesis_for(&keypairs);
        let store = EventStore::open_temporary(&genesis, 0).unwrap();
        let merger = Merger::new(keypairs[0].clone(), ContinuityConfig::default());
        let ctx = context(&keypairs, 0, &genesis);

        let outcome = merger
            .maybe_merge(&store, vec![], &ctx, 0)
            .unwrap()
            .expect("bootstrap merge is always allowed");
        assert_eq!(
            outcome.merge_event.parent_hashes,
            vec![genesis.genesis_merge.event_hash]
        );
        assert_eq!(outcome.merge_event.merge_height, 1);
        assert!(outcome.regular_event.is_none());
    }

    #[test]
    fn merge_with_operations_chains_a_regular_event() {
        let keypairs: Vec<SigningKeypair> = (0..2).map(|_| SigningKeypair::generate()).collect();
        let genesis = genesis_for(&keypairs);
        let store = EventStore::open_temporary(&genesis, 0).unwrap();
        let merger = Merger::new(keypairs[1].clone(), ContinuityConfig::default());
        let ctx = context(&keypairs, 1, &genesis);

        let outcome = merger
            .maybe_merge(&store, vec![op(1), op(2)], &ctx, 0)
            .unwrap()
            .expect("bootstrap merge with operations");
        let regular = outcome.regular_event.expect("operations folded");
        assert_eq!(regular.tree_hash, genesis.genesis_merge.event_hash);
        assert_eq!(outcome.merge_event.tree_hash, regular.event_hash);
        assert_eq!(outcome.merge_event.merge_height, regular.merge_height + 1);
        // Both landed in the store.
        assert!(store.exists(&regular.event_hash));
        assert!(store.exists(&outcome.merge_event.event_hash));
        store.verify_dag_invariants().unwrap();
    }

    #[test]
    fn thresholds_suppress_merge_until_heads_arrive() {
        let keypairs: Vec<SigningKeypair> = (0..4).map(|_| SigningKeypair::generate()).collect();
        let genesis = genesis_for(&keypairs);
        let store = EventStore::open_temporary(&genesis, 0).unwrap();
        let config = ContinuityConfig {
            witness_minimum_threshold: Threshold::Symbolic(SymbolicThreshold::F),
            ..Default::default()
        };
        let merger = Merger::new(keypairs[0].clone(), config);
        let ctx = context(&keypairs, 0, &genesis);

        // Bootstrap merge goes through.
        let first = merger.maybe_merge(&store, vec![], &ctx, 0).unwrap();
        assert!(first.is_some());

        // Second cycle: no remote heads, no operations → nothing to do
        // (thresholds require f = 1 witness parents).
        let second = merger.maybe_merge(&store, vec![], &ctx, 0).unwrap();
        assert!(second.is_none());

        // A remote witness head arrives.
        let remote = Event::merge(
            &keypairs[1],
            store.ledger(),
            genesis.genesis_merge.event_hash,
            vec![genesis.genesis_merge.event_hash],
            0,
            1,
        );
        assert_eq!(
            store.insert(&remote, InsertOrigin::Peer, 0).unwrap(),
            InsertOutcome::Inserted
        );

        let third = merger
            .maybe_merge(&store, vec![], &ctx, 0)
            .unwrap()
            .expect("threshold met after remote head arrived");
        assert!(third
            .merge_event
            .parent_hashes
            .contains(&remote.event_hash));
    }

    #[test]
    fn forked_creators_are_withheld() {
        let keypairs: Vec<SigningKeypair> = (0..3).map(|_| SigningKeypair::generate()).collect();
        let genesis = genesis_for(&keypairs);
        let store = EventStore::open_temporary(&genesis, 0).unwrap();
        let merger = Merger::new(keypairs[0].clone(), ContinuityConfig::default());
        let ctx = context(&keypairs, 0, &genesis);
        let ledger = store.ledger();
        let genesis_hash = genesis.genesis_merge.event_hash;

        // Creator 1 merges honestly, then forks.
        let honest = Event::merge(&keypairs[1], ledger, genesis_hash, vec![genesis_hash], 0, 1);
        store.insert(&honest, InsertOrigin::Peer, 0).unwrap();
        let fork = Event::regular(&keypairs[1], ledger, vec![op(9)], genesis_hash, 0, 1);
        assert!(store.insert(&fork, InsertOrigin::Peer, 0).is_err());

        // Bootstrap merge must not reference the forked creator's head.
        let outcome = merger
            .maybe_merge(&store, vec![], &ctx, 0)
            .unwrap()
            .expect("bootstrap merge");
        assert!(!outcome.merge_event.parent_hashes.contains(&honest.event_hash));
    }

    #[test]
    fn merged_heads_are_not_merged_twice() {
        let keypairs: Vec<SigningKeypair> = (0..2).map(|_| SigningKeypair::generate()).collect();
        let genesis = genesis_for(&keypairs);
        let store = EventStore::open_temporary(&genesis, 0).unwrap();
        let config = ContinuityConfig {
            witness_minimum_threshold: Threshold::Count(0),
            ..Default::default()
        };
        let merger = Merger::new(keypairs[0].clone(), config);
        let ctx = context(&keypairs, 0, &genesis);
        let ledger = store.ledger();
        let genesis_hash = genesis.genesis_merge.event_hash;

        let remote = Event::merge(&keypairs[1], ledger, genesis_hash, vec![genesis_hash], 0, 1);
        store.insert(&remote, InsertOrigin::Peer, 0).unwrap();

        // First merge picks up the remote head (bootstrap waives
        // thresholds but candidates are still collected).
        let first = merger
            .maybe_merge(&store, vec![], &ctx, 0)
            .unwrap()
            .expect("bootstrap merge");
        assert!(first.merge_event.parent_hashes.contains(&remote.event_hash));

        // Second cycle: the head is already in our ancestry → no-op.
        let second = merger.maybe_merge(&store, vec![], &ctx, 0).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn operation_draw_respects_chance_bounds() {
        let keypairs: Vec<SigningKeypair> = (0..1).map(|_| SigningKeypair::generate()).collect();
        let always = Merger::new(
            keypairs[0].clone(),
            ContinuityConfig {
                operation_ready_chance: 1.0,
                ..Default::default()
            },
        );
        let never = Merger::new(
            keypairs[0].clone(),
            ContinuityConfig {
                operation_ready_chance: 0.0,
                ..Default::default()
            },
        );
        assert!(always.should_include_operations(3));
        assert!(!never.should_include_operations(3));
        assert!(!always.should_include_operations(0));
    }

    #[test]
    fn candidate_sets_never_duplicate_creators() {
        let keypairs: Vec<SigningKeypair> = (0..4).map(|_| SigningKeypair::generate()).collect();
        let genesis = genesis_for(&keypairs);
        let store = EventStore::open_temporary(&genesis, 0).unwrap();
        let merger = Merger::new(keypairs[0].clone(), ContinuityConfig::default());
        let ctx = context(&keypairs, 0, &genesis);
        let ledger = store.ledger();
        let genesis_hash = genesis.genesis_merge.event_hash;

        // Creator 1 produces two merges; only its head may be referenced.
        let m1 = Event::merge(&keypairs[1], ledger, genesis_hash, vec![genesis_hash], 0, 1);
        store.insert(&m1, InsertOrigin::Peer, 0).unwrap();
        let m2 = Event::merge(&keypairs[1], ledger, m1.event_hash, vec![m1.event_hash], 0, 2);
        store.insert(&m2, InsertOrigin::Peer, 0).unwrap();

        let outcome = merger
            .maybe_merge(&store, vec![], &ctx, 0)
            .unwrap()
            .expect("merge");
        let mut creators = BTreeSet::new();
        for parent in outcome.merge_event.non_tree_parents() {
            let event = store.get_event(parent).unwrap().unwrap();
            assert!(creators.insert(event.creator), "duplicate creator parent");
        }
        assert!(outcome.merge_event.parent_hashes.contains(&m2.event_hash));
        assert!(!outcome.merge_event.parent_hashes.contains(&m1.event_hash));
    }
}
