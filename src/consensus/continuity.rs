//! The Continuity2017 consensus method.
//!
//! Election proceeds in three steps over the uncommitted slice:
//! support computation (which witnesses each witness merge event has
//! reached through ancestry), Y-event election (the first merge event per
//! witness with supermajority support), and decision (a supermajority of
//! witnesses holding Y-events commits the events their Y-events mutually
//! endorse).

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::event::{CreatorId, EventHash};

use super::{support_sets, BlockDecision, ConsensusInput, ConsensusMethod, ConsensusResult};

/// Continuity2017: deterministic DAG-continuity consensus.
pub struct Continuity2017;

impl ConsensusMethod for Continuity2017 {
    fn name(&self) -> &'static str {
        "Continuity2017"
    }

    fn evaluate(&self, input: &ConsensusInput<'_>) -> ConsensusResult {
        let slice = input.slice;
        let witnesses = input.witnesses;
        if slice.is_empty() || witnesses.is_empty() {
            return ConsensusResult::default();
        }

        // Creators with detected forks count for no one.
        let excluded: BTreeSet<CreatorId> = slice.forked_creators().iter().copied().collect();
        let supermajority = witnesses.supermajority();

        // Step 1+2: support sets and Y-event election. The elected
        // Y-event per witness is its newest supported merge event — its
        // ancestry is the widest, so each decision closes over everything
        // the witness has endorsed so far. Iteration ascends
        // (merge_height, event_hash), so the last write per creator wins.
        let support = support_sets(slice, witnesses, &excluded);
        let mut elected: BTreeMap<CreatorId, EventHash> = BTreeMap::new();
        for event in slice.merge_events() {
            let Some(seen) = support.get(&event.event_hash) else {
                continue;
            };
            if seen.len() as u64 >= supermajority {
                elected.insert(event.creator, event.event_hash);
            }
        }

        // Step 3: decision requires Y-events by a supermajority of
        // distinct witnesses.
        if (elected.len() as u64) < supermajority {
            let priority: Vec<CreatorId> = witnesses
                .members()
                .iter()
                .filter(|w| !excluded.contains(w) && !elected.contains_key(w))
                .copied()
                .collect();
            return ConsensusResult {
                decision: None,
                priority_peers: priority,
            };
        }

        // The common ancestor set: events endorsed by a supermajority of
        // the elected Y-events (an event endorses itself).
        let mut coverage: HashMap<EventHash, u64> = HashMap::new();
        for y_hash in elected.values() {
            let mut endorsed: HashSet<EventHash> = slice.ancestors(y_hash);
            endorsed.insert(*y_hash);
            for hash in endorsed {
                *coverage.entry(hash).or_insert(0) += 1;
            }
        }

        let mut decided: Vec<EventHash> = coverage
            .into_iter()
            .filter(|(_, count)| *count >= supermajority)
            .map(|(hash, _)| hash)
            .filter(|hash| {
                slice
                    .get(hash)
                    .map(|e| !excluded.contains(&e.creator))
                    .unwrap_or(false)
            })
            .collect();

        if decided.is_empty() {
            // Y-events exist but have not converged on a common ancestor
            // set yet; more merging is needed from everyone.
            let priority: Vec<CreatorId> = witnesses
                .members()
                .iter()
                .filter(|w| !excluded.contains(w))
                .copied()
                .collect();
            return ConsensusResult {
                decision: None,
                priority_peers: priority,
            };
        }

        // Step 4: deterministic ordering.
        decided.sort_by_key(|hash| {
            let height = slice.get(hash).map(|e| e.merge_height).unwrap_or(0);
            (height, *hash)
        });

        // Step 5: the consensus proof is the set of Y-events that closed
        // the decision; trivial (f = 0) decisions carry no proof.
        let consensus_proof = if witnesses.fault_bound() == 0 {
            vec![]
        } else {
            let mut proof: Vec<EventHash> = elected.values().copied().collect();
            proof.sort_by_key(|hash| {
                let height = slice.get(hash).map(|e| e.merge_height).unwrap_or(0);
                (height, *hash)
            });
            proof
        };

        ConsensusResult {
            decision: Some(BlockDecision {
                event_hashes: decided,
                consensus_proof,
            }),
            priority_peers: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::WitnessSet;
    use crate::crypto::SigningKeypair;
    use crate::event::{Event, LedgerId, Operation};
    use crate::store::DagSlice;

    struct Fixture {
        keypairs: Vec<SigningKeypair>,
        ledger: LedgerId,
        genesis: EventHash,
        events: Vec<Event>,
    }

    impl Fixture {
        fn new(creators: usize) -> Self {
            Fixture {
                keypairs: (0..creators).map(|_| SigningKeypair::generate()).collect(),
                ledger: LedgerId(crate::hash_domain(b"weft.ledger.id", b"fixture")),
                genesis: EventHash(crate::hash_domain(b"weft.test", b"genesis")),
                events: Vec::new(),
            }
        }

        fn creator(&self, i: usize) -> CreatorId {
            CreatorId::from_key(&self.keypairs[i].public)
        }

        fn witnesses(&self, f: u64) -> WitnessSet {
            WitnessSet::new((0..self.keypairs.len()).map(|i| self.creator(i)).collect(), f)
        }

        fn merge(&mut self, by: usize, tree: EventHash, others: &[EventHash], height: u64) -> EventHash {
            let mut parents = vec![tree];
            parents.extend_from_slice(others);
            let event = Event::merge(&self.keypairs[by], self.ledger, tree, parents, 0, height);
            let hash = event.event_hash;
            self.events.push(event);
            hash
        }

        fn regular(&mut self, by: usize, tree: EventHash, height: u64, n: u64) -> EventHash {
            let op = Operation::from_value(&serde_json::json!({ "n": n })).unwrap();
            let event = Event::regular(&self.keypairs[by], self.ledger, vec![op], tree, 0, height);
            let hash = event.event_hash;
            self.events.push(event);
            hash
        }

        fn slice(&self) -> DagSlice {
            DagSlice::from_events(self.events.clone())
        }

        fn evaluate(&self, f: u64) -> ConsensusResult {
            let slice = self.slice();
            let witnesses = self.witnesses(f);
            Continuity2017.evaluate(&ConsensusInput {
                slice: &slice,
                witnesses: &witnesses,
                latest_block_height: 0,
            })
        }
    }

    #[test]
    fn empty_slice_decides_nothing() {
        let fixture = Fixture::new(4);
        let result = fixture.evaluate(1);
        assert!(!result.consensus());
    }

    #[test]
    fn trivial_single_witness_decides_immediately() {
        let mut fixture = Fixture::new(1);
        let genesis = fixture.genesis;
        let reg = fixture.regular(0, genesis, 1, 7);
        let merge = fixture.merge(0, reg, &[], 2);

        let result = fixture.evaluate(0);
        let decision = result.decision.expect("single witness decides trivially");
        // Both the regular event and the merge commit, in height order.
        assert_eq!(decision.event_hashes, vec![reg, merge]);
        // Trivial decisions carry no proof.
        assert!(decision.consensus_proof.is_empty());
    }

    #[test]
    fn insufficient_support_returns_priority_hint() {
        let mut fixture = Fixture::new(4);
        let genesis = fixture.genesis;
        // Only one witness has merged anything: no event can see 3
        // witnesses.
        fixture.merge(0, genesis, &[], 1);

        let result = fixture.evaluate(1);
        assert!(!result.consensus());
        // All witnesses still owe support.
        assert_eq!(result.priority_peers.len(), 4);
    }

    #[test]
    fn four_witness_round_two_decides_round_one() {
        let mut fixture = Fixture::new(4);
        let genesis = fixture.genesis;

        // Round 1: every witness anchors its chain.
        let round1: Vec<EventHash> =
            (0..4).map(|i| fixture.merge(i, genesis, &[], 1)).collect();

        // Round 2: every witness merges everyone else's round-1 head.
        let mut round2 = Vec::new();
        for i in 0..4 {
            let others: Vec<EventHash> = (0..4).filter(|j| *j != i).map(|j| round1[j]).collect();
            round2.push(fixture.merge(i, round1[i], &others, 2));
        }

        let result = fixture.evaluate(1);
        let decision = result.decision.expect("round 2 closes round 1");

        // Round-1 merges are covered by all four Y-events; round-2
        // Y-events only cover themselves and stay uncommitted.
        let mut expected = round1.clone();
        expected.sort();
        assert_eq!(decision.event_hashes, expected);
        assert_eq!(decision.consensus_proof.len(), 4);
        for y in &decision.consensus_proof {
            assert!(round2.contains(y));
        }
    }

    #[test]
    fn decision_is_deterministic_across_reorderings() {
        let mut fixture = Fixture::new(4);
        let genesis = fixture.genesis;
        let round1: Vec<EventHash> =
            (0..4).map(|i| fixture.merge(i, genesis, &[], 1)).collect();
        for i in 0..4 {
            let others: Vec<EventHash> = (0..4).filter(|j| *j != i).map(|j| round1[j]).collect();
            fixture.merge(i, round1[i], &others, 2);
        }

        let forward = fixture.evaluate(1).decision.unwrap();
        let mut reversed_events = fixture.events.clone();
        reversed_events.reverse();
        let slice = DagSlice::from_events(reversed_events);
        let witnesses = fixture.witnesses(1);
        let reversed = Continuity2017
            .evaluate(&ConsensusInput {
                slice: &slice,
                witnesses: &witnesses,
                latest_block_height: 0,
            })
            .decision
            .unwrap();
        assert_eq!(forward, reversed);
    }

    /// The figure-1.10 scenario: four creators where `b` forks its chain
    /// into two branches. The fork is detected from the slice, `b` is
    /// excluded from support and from the decided set, and the remaining
    /// witnesses still decide.
    #[test]
    fn forked_witness_is_excluded_from_support_and_decision() {
        let mut fixture = Fixture::new(4);
        let genesis = fixture.genesis;
        let b = 1usize;

        // Honest round 1.
        let m1_0 = fixture.merge(0, genesis, &[], 1);
        let m1_2 = fixture.merge(2, genesis, &[], 1);
        let m1_3 = fixture.merge(3, genesis, &[], 1);

        // b forks: two distinct events extending the same tree parent.
        let b1 = fixture.merge(b, genesis, &[], 1);
        let b2 = fixture.merge(b, genesis, &[m1_0], 2);
        assert_ne!(b1, b2);

        // Honest round 2: the three honest witnesses merge each other
        // (and even reference one of b's branches — it still counts for
        // no one).
        let m2_0 = fixture.merge(0, m1_0, &[m1_2, m1_3, b1], 2);
        let m2_2 = fixture.merge(2, m1_2, &[m1_0, m1_3], 2);
        let m2_3 = fixture.merge(3, m1_3, &[m1_0, m1_2], 2);

        let slice = fixture.slice();
        assert!(slice.forked_creators().contains(&fixture.creator(b)));

        let result = fixture.evaluate(1);
        let decision = result.decision.expect("honest supermajority decides");

        // b's events never commit.
        assert!(!decision.event_hashes.contains(&b1));
        assert!(!decision.event_hashes.contains(&b2));
        // The honest round-1 events commit.
        for hash in [m1_0, m1_2, m1_3] {
            assert!(decision.event_hashes.contains(&hash));
        }
        // The proof consists of the honest Y-events.
        for y in &decision.consensus_proof {
            assert!([m2_0, m2_2, m2_3].contains(y));
        }
        assert_eq!(decision.consensus_proof.len(), 3);
    }

    #[test]
    fn support_excludes_forked_creator() {
        let mut fixture = Fixture::new(4);
        let genesis = fixture.genesis;
        let b = 1usize;

        let b1 = fixture.merge(b, genesis, &[], 1);
        let _b2 = fixture.merge(b, genesis, &[], 2); // fork (different height)
        let m1_0 = fixture.merge(0, genesis, &[b1], 2);

        let slice = fixture.slice();
        let witnesses = fixture.witnesses(1);
        let excluded: BTreeSet<CreatorId> =
            slice.forked_creators().iter().copied().collect();
        let support = super::super::support_sets(&slice, &witnesses, &excluded);

        // Creator 0's merge reaches only itself: b's merge in its
        // ancestry counts for no one.
        assert_eq!(
            support.get(&m1_0).unwrap().len(),
            1,
            "forked creator must not contribute support"
        );
        // b's own events are not support candidates at all.
        assert!(!support.contains_key(&b1));
    }

    #[test]
    fn regular_events_commit_with_their_merges() {
        let mut fixture = Fixture::new(4);
        let genesis = fixture.genesis;

        // Creator 0 chains an operation before merging.
        let reg = fixture.regular(0, genesis, 1, 42);
        let m1_0 = fixture.merge(0, reg, &[], 2);
        let m1_1 = fixture.merge(1, genesis, &[], 1);
        let m1_2 = fixture.merge(2, genesis, &[], 1);
        let m1_3 = fixture.merge(3, genesis, &[], 1);
        for (i, tree) in [(0usize, m1_0), (1, m1_1), (2, m1_2), (3, m1_3)] {
            let others: Vec<EventHash> = [m1_0, m1_1, m1_2, m1_3]
                .iter()
                .filter(|h| **h != tree)
                .copied()
                .collect();
            fixture.merge(i, tree, &others, 3);
        }

        let decision = fixture.evaluate(1).decision.expect("round 2 decides");
        assert!(decision.event_hashes.contains(&reg));
        // Ordering: the regular event (height 1) precedes the merge that
        // carried it (height 2).
        let reg_pos = decision.event_hashes.iter().position(|h| *h == reg).unwrap();
        let merge_pos = decision.event_hashes.iter().position(|h| *h == m1_0).unwrap();
        assert!(reg_pos < merge_pos);
    }
}
