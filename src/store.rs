//! Persistent event DAG storage.
//!
//! Provides the sled-backed [`EventStore`] that owns all event records and
//! their consensus bookkeeping, plus the [`DagSlice`] snapshot the
//! consensus engine and merge scheduler operate on.
//!
//! Layout is one sled tree per logical table: `events`, `event_meta`,
//! `events_by_creator` (range-scannable by `(creator, merge_height)`),
//! `consensus_index` (ordered by consensus date), `blocks`,
//! `blocks_by_height`, and `forks`. Writes follow a single-writer
//! discipline per ledger: only the worker inserts and commits, while
//! readers take consistent in-memory snapshots.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;

use crate::block::{Block, BlockHash, GenesisBundle};
use crate::event::{CreatorId, Event, EventError, EventHash, EventMeta, LedgerId};

/// Where an event entered the node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOrigin {
    /// Created by this node's merge scheduler or local operation path.
    Local,
    /// Received through gossip.
    Peer,
}

/// Non-error outcomes of an insert.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The event was already stored. Benign for gossip inserts.
    Duplicate,
}

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Malformed structure, bad signature, or bad content hash. Fatal for
    /// the offending event; signals a Byzantine sender.
    #[error("event validation failed: {0}")]
    Validation(#[from] EventError),
    /// Referenced parents are unknown. Recoverable: the caller may fetch
    /// the named hashes and retry.
    #[error("missing {} parents", .hashes.len())]
    MissingParents { hashes: Vec<EventHash> },
    /// Signed-payload mismatch or impossible merge height.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// A second event claimed an already-extended tree parent. The
    /// creator is withheld from merges; whether the *sender* is punished
    /// depends on whether it served its own fork.
    #[error("fork attempt by {creator}")]
    ForkRejected { creator: CreatorId },
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    fn io(e: sled::Error) -> Self {
        StoreError::Io(e.to_string())
    }

    fn codec(e: bincode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// In-memory working state rebuilt from sled on open.
#[derive(Default)]
struct StoreState {
    /// Latest event (any kind) per creator chain, with its merge height.
    chain_heads: HashMap<CreatorId, (EventHash, u64)>,
    /// Latest merge event per creator, with its merge height.
    merge_heads: HashMap<CreatorId, (EventHash, u64)>,
    /// Accepted child per `(creator, tree_hash)`; a second claimant is a fork.
    tree_children: HashMap<(CreatorId, EventHash), EventHash>,
    /// Events not yet committed by consensus.
    uncommitted: HashMap<EventHash, Event>,
    /// Creators with a detected fork; withheld from future merges.
    forked: HashSet<CreatorId>,
    latest_block: Option<Block>,
}

/// Persistent DAG of events keyed by content hash.
pub struct EventStore {
    #[allow(dead_code)]
    db: sled::Db,
    events: sled::Tree,
    event_meta: sled::Tree,
    events_by_creator: sled::Tree,
    consensus_index: sled::Tree,
    blocks: sled::Tree,
    blocks_by_height: sled::Tree,
    forks: sled::Tree,
    ledger: LedgerId,
    genesis_merge: EventHash,
    state: RwLock<StoreState>,
}

fn creator_height_key(creator: &CreatorId, merge_height: u64, hash: &EventHash) -> [u8; 72] {
    let mut key = [0u8; 72];
    key[..32].copy_from_slice(&creator.0);
    key[32..40].copy_from_slice(&merge_height.to_be_bytes());
    key[40..].copy_from_slice(&hash.0);
    key
}

fn consensus_key(date_ms: u64, hash: &EventHash) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..8].copy_from_slice(&date_ms.to_be_bytes());
    key[8..].copy_from_slice(&hash.0);
    key
}

impl EventStore {
    /// Open a store over a sled database, bootstrapping the genesis block
    /// on first use and verifying the ledger identity otherwise.
    pub fn open(db: sled::Db, genesis: &GenesisBundle, now_ms: u64) -> Result<Self, StoreError> {
        let events = db.open_tree("events").map_err(StoreError::io)?;
        let event_meta = db.open_tree("event_meta").map_err(StoreError::io)?;
        let events_by_creator = db.open_tree("events_by_creator").map_err(StoreError::io)?;
        let consensus_index = db.open_tree("consensus_index").map_err(StoreError::io)?;
        let blocks = db.open_tree("blocks").map_err(StoreError::io)?;
        let blocks_by_height = db.open_tree("blocks_by_height").map_err(StoreError::io)?;
        let forks = db.open_tree("forks").map_err(StoreError::io)?;

        let store = EventStore {
            db,
            events,
            event_meta,
            events_by_creator,
            consensus_index,
            blocks,
            blocks_by_height,
            forks,
            ledger: genesis.ledger,
            genesis_merge: genesis.genesis_merge.event_hash,
            state: RwLock::new(StoreState::default()),
        };

        if store.blocks_by_height.is_empty() {
            store.bootstrap(genesis, now_ms)?;
        } else {
            let stored = store
                .block_at(0)?
                .ok_or_else(|| StoreError::Io("genesis block missing".into()))?;
            if stored.block_hash != genesis.block.block_hash {
                return Err(StoreError::ProtocolViolation(
                    "database belongs to a different ledger".into(),
                ));
            }
        }
        store.rebuild_state()?;
        Ok(store)
    }

    /// Open a throwaway in-memory store (for tests).
    pub fn open_temporary(genesis: &GenesisBundle, now_ms: u64) -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(StoreError::io)?;
        Self::open(db, genesis, now_ms)
    }

    /// Write the genesis events and block into an empty database.
    fn bootstrap(&self, genesis: &GenesisBundle, now_ms: u64) -> Result<(), StoreError> {
        for event in [&genesis.configuration_event, &genesis.genesis_merge] {
            event.check_shape(self.ledger, true)?;
            event.verify_hash()?;
            event.verify_signature()?;
            self.persist_event(event, now_ms)?;
        }
        self.mark_consensus(&genesis.block.event_hashes, 0, genesis.block.consensus_date_ms)?;
        self.persist_block(&genesis.block)?;
        tracing::info!(ledger = %self.ledger, "Bootstrapped genesis block");
        Ok(())
    }

    /// Rebuild the in-memory working state from the persistent trees.
    fn rebuild_state(&self) -> Result<(), StoreError> {
        let mut state = StoreState::default();
        for entry in self.events.iter() {
            let (_, value) = entry.map_err(StoreError::io)?;
            let event: Event = bincode::deserialize(&value).map_err(StoreError::codec)?;
            let meta = self
                .read_meta(&event.event_hash)?
                .ok_or_else(|| StoreError::Io("event missing meta".into()))?;
            Self::index_event(&mut state, &event);
            if !meta.consensus {
                state.uncommitted.insert(event.event_hash, event);
            }
        }
        for entry in self.forks.iter() {
            let (key, _) = entry.map_err(StoreError::io)?;
            let bytes: crate::Hash = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Io("corrupt fork key".into()))?;
            state.forked.insert(CreatorId(bytes));
        }
        if let Some(entry) = self.blocks_by_height.last().map_err(StoreError::io)? {
            let block: Block = bincode::deserialize(&entry.1).map_err(StoreError::codec)?;
            state.latest_block = Some(block);
        }
        *self.state.write().expect("store state lock poisoned") = state;
        Ok(())
    }

    fn index_event(state: &mut StoreState, event: &Event) {
        // Merge heights strictly increase along each creator's chain, so
        // the head is simply the highest event seen. Height-keyed updates
        // keep rebuild order irrelevant. The genesis configuration event
        // sits outside every chain and is never a head.
        if event.is_genesis_era() && !event.kind.is_merge() {
            return;
        }
        let candidate = (event.event_hash, event.merge_height);
        let head = state.chain_heads.entry(event.creator).or_insert(candidate);
        if event.merge_height >= head.1 {
            *head = candidate;
        }
        if event.kind.is_merge() {
            let head = state.merge_heads.entry(event.creator).or_insert(candidate);
            if event.merge_height >= head.1 {
                *head = candidate;
            }
        }
        if !event.is_genesis_era() {
            state
                .tree_children
                .insert((event.creator, event.tree_hash), event.event_hash);
        }
    }

    pub fn ledger(&self) -> LedgerId {
        self.ledger
    }

    pub fn genesis_merge_hash(&self) -> EventHash {
        self.genesis_merge
    }

    pub fn exists(&self, hash: &EventHash) -> bool {
        self.events.contains_key(hash.0).unwrap_or(false)
    }

    pub fn get_event(&self, hash: &EventHash) -> Result<Option<Event>, StoreError> {
        match self.events.get(hash.0).map_err(StoreError::io)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(StoreError::codec)?)),
            None => Ok(None),
        }
    }

    pub fn get_meta(&self, hash: &EventHash) -> Result<Option<EventMeta>, StoreError> {
        self.read_meta(hash)
    }

    fn read_meta(&self, hash: &EventHash) -> Result<Option<EventMeta>, StoreError> {
        match self.event_meta.get(hash.0).map_err(StoreError::io)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(StoreError::codec)?)),
            None => Ok(None),
        }
    }

    /// Insert a validated event.
    ///
    /// Validation order: shape → signature → hash-matches-content →
    /// parents-exist → tree-parent-is-creator's-prior → merge-height
    /// correctness. `Duplicate` is a benign outcome; `MissingParents` is
    /// recoverable; any other failure is fatal for the event.
    pub fn insert(
        &self,
        event: &Event,
        origin: InsertOrigin,
        now_ms: u64,
    ) -> Result<InsertOutcome, StoreError> {
        if self.exists(&event.event_hash) {
            return Ok(InsertOutcome::Duplicate);
        }

        event.check_shape(self.ledger, false)?;
        event.verify_signature()?;
        event.verify_hash()?;

        let missing: Vec<EventHash> = event
            .parent_hashes
            .iter()
            .filter(|p| !self.exists(p))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(StoreError::MissingParents { hashes: missing });
        }

        self.check_tree_parent(event)?;
        self.check_merge_parents(event)?;
        self.check_merge_height(event)?;

        self.persist_event(event, now_ms)?;
        tracing::debug!(
            event = %event.event_hash,
            creator = %event.creator,
            origin = ?origin,
            merge = event.kind.is_merge(),
            "Inserted event"
        );
        Ok(InsertOutcome::Inserted)
    }

    /// Fixture/test path: index an event without shape or signature
    /// checks. Consensus fixtures use this to build DAGs containing
    /// deliberate forks.
    pub fn insert_unchecked(&self, event: &Event, now_ms: u64) -> Result<(), StoreError> {
        if self.exists(&event.event_hash) {
            return Ok(());
        }
        self.persist_event(event, now_ms)
    }

    /// Tree-parent rule: the tree parent must be the creator's own prior
    /// event (or the genesis merge for a creator's first event) and must
    /// not already have an accepted sibling. A second claimant is a fork:
    /// the insert is rejected and the creator is withheld from merges.
    fn check_tree_parent(&self, event: &Event) -> Result<(), StoreError> {
        let tree_parent = self
            .get_event(&event.tree_hash)?
            .ok_or_else(|| StoreError::MissingParents {
                hashes: vec![event.tree_hash],
            })?;
        if tree_parent.creator != event.creator && tree_parent.event_hash != self.genesis_merge {
            return Err(StoreError::ProtocolViolation(format!(
                "tree parent {} belongs to another creator",
                event.tree_hash
            )));
        }

        let mut state = self.state.write().expect("store state lock poisoned");
        if let Some(existing) = state.tree_children.get(&(event.creator, event.tree_hash)) {
            if *existing != event.event_hash {
                state.forked.insert(event.creator);
                drop(state);
                self.record_fork(&event.creator)?;
                tracing::warn!(
                    creator = %event.creator,
                    tree = %event.tree_hash,
                    "Fork detected; creator withheld from merges"
                );
                return Err(StoreError::ForkRejected {
                    creator: event.creator,
                });
            }
        }
        Ok(())
    }

    /// Merge-parent rules: non-tree parents must be merge events by
    /// distinct creators other than the event's own creator.
    fn check_merge_parents(&self, event: &Event) -> Result<(), StoreError> {
        if !event.kind.is_merge() {
            return Ok(());
        }
        let mut creators = HashSet::new();
        for parent_hash in event.non_tree_parents() {
            let parent = self
                .get_event(parent_hash)?
                .ok_or_else(|| StoreError::MissingParents {
                    hashes: vec![*parent_hash],
                })?;
            if !parent.kind.is_merge() {
                return Err(StoreError::ProtocolViolation(format!(
                    "non-tree parent {parent_hash} is not a merge event"
                )));
            }
            if parent.creator == event.creator {
                return Err(StoreError::ProtocolViolation(
                    "merge references the creator's own non-tree merge".into(),
                ));
            }
            if !creators.insert(parent.creator) {
                return Err(StoreError::ProtocolViolation(
                    "merge references two parents by the same creator".into(),
                ));
            }
        }
        Ok(())
    }

    /// `merge_height` must equal `1 + max(parent merge heights)`.
    fn check_merge_height(&self, event: &Event) -> Result<(), StoreError> {
        let mut max_parent = 0u64;
        for parent_hash in &event.parent_hashes {
            let parent = self
                .get_event(parent_hash)?
                .ok_or_else(|| StoreError::MissingParents {
                    hashes: vec![*parent_hash],
                })?;
            max_parent = max_parent.max(parent.merge_height);
        }
        if event.merge_height != max_parent + 1 {
            return Err(StoreError::ProtocolViolation(format!(
                "impossible merge height {} (expected {})",
                event.merge_height,
                max_parent + 1
            )));
        }
        Ok(())
    }

    fn persist_event(&self, event: &Event, now_ms: u64) -> Result<(), StoreError> {
        let meta = EventMeta::new(event.creator, now_ms);
        let event_bytes = bincode::serialize(event).map_err(StoreError::codec)?;
        let meta_bytes = bincode::serialize(&meta).map_err(StoreError::codec)?;
        self.events
            .insert(event.event_hash.0, event_bytes)
            .map_err(StoreError::io)?;
        self.event_meta
            .insert(event.event_hash.0, meta_bytes)
            .map_err(StoreError::io)?;
        self.events_by_creator
            .insert(
                creator_height_key(&event.creator, event.merge_height, &event.event_hash),
                &event.event_hash.0,
            )
            .map_err(StoreError::io)?;

        let mut state = self.state.write().expect("store state lock poisoned");
        Self::index_event(&mut state, event);
        state.uncommitted.insert(event.event_hash, event.clone());
        Ok(())
    }

    fn record_fork(&self, creator: &CreatorId) -> Result<(), StoreError> {
        self.forks
            .insert(creator.0, &[] as &[u8])
            .map_err(StoreError::io)?;
        Ok(())
    }

    /// Latest merge event by `creator` known locally; the genesis merge if
    /// none.
    pub fn local_branch_head(&self, creator: &CreatorId) -> EventHash {
        let state = self.state.read().expect("store state lock poisoned");
        state
            .merge_heads
            .get(creator)
            .map(|(hash, _)| *hash)
            .unwrap_or(self.genesis_merge)
    }

    /// Latest event of any kind on the creator's chain; the genesis merge
    /// if the creator has no events yet.
    pub fn chain_head(&self, creator: &CreatorId) -> EventHash {
        let state = self.state.read().expect("store state lock poisoned");
        state
            .chain_heads
            .get(creator)
            .map(|(hash, _)| *hash)
            .unwrap_or(self.genesis_merge)
    }

    /// All known merge heads, one per creator.
    pub fn merge_heads(&self) -> Vec<(CreatorId, EventHash)> {
        let state = self.state.read().expect("store state lock poisoned");
        state
            .merge_heads
            .iter()
            .map(|(c, (h, _))| (*c, *h))
            .collect()
    }

    /// Merge height of the creator's merge head (0 if none).
    pub fn creator_merge_height(&self, creator: &CreatorId) -> Result<u64, StoreError> {
        let state = self.state.read().expect("store state lock poisoned");
        Ok(state.merge_heads.get(creator).map(|(_, h)| *h).unwrap_or(0))
    }

    /// Creators with a detected fork, withheld from future merges.
    pub fn forked_creators(&self) -> HashSet<CreatorId> {
        self.state
            .read()
            .expect("store state lock poisoned")
            .forked
            .clone()
    }

    /// Snapshot of all events not yet committed by consensus, with forward
    /// and backward indices populated. This is the consensus engine's
    /// input.
    pub fn recent_history(&self) -> DagSlice {
        let state = self.state.read().expect("store state lock poisoned");
        let mut slice = DagSlice::from_events(state.uncommitted.values().cloned().collect());
        for creator in &state.forked {
            slice.forked.insert(*creator);
        }
        slice
    }

    /// Atomically mark a set of events as committed. All-or-none: meta
    /// updates for the whole set are applied as a single batch.
    pub fn mark_consensus(
        &self,
        hashes: &[EventHash],
        block_height: u64,
        consensus_date_ms: u64,
    ) -> Result<(), StoreError> {
        let mut meta_batch = sled::Batch::default();
        let mut index_batch = sled::Batch::default();
        for hash in hashes {
            let mut meta = self
                .read_meta(hash)?
                .ok_or_else(|| StoreError::Io(format!("no meta for {hash}")))?;
            meta.consensus = true;
            meta.consensus_date_ms = Some(consensus_date_ms);
            meta.block_height = Some(block_height);
            meta.updated_ms = consensus_date_ms;
            meta_batch.insert(
                &hash.0,
                bincode::serialize(&meta).map_err(StoreError::codec)?,
            );
            index_batch.insert(consensus_key(consensus_date_ms, hash).as_slice(), &hash.0);
        }
        self.event_meta
            .apply_batch(meta_batch)
            .map_err(StoreError::io)?;
        self.consensus_index
            .apply_batch(index_batch)
            .map_err(StoreError::io)?;

        let mut state = self.state.write().expect("store state lock poisoned");
        for hash in hashes {
            state.uncommitted.remove(hash);
        }
        Ok(())
    }

    /// Append a committed block and mark its events. The meta batch lands
    /// before the block record so a crash between the two leaves the
    /// events committed but the block re-derivable.
    pub fn commit_block(&self, block: &Block) -> Result<(), StoreError> {
        self.mark_consensus(&block.event_hashes, block.height, block.consensus_date_ms)?;
        self.persist_block(block)?;
        tracing::info!(
            height = block.height,
            hash = %block.block_hash,
            events = block.event_hashes.len(),
            "Committed block"
        );
        Ok(())
    }

    fn persist_block(&self, block: &Block) -> Result<(), StoreError> {
        let bytes = bincode::serialize(block).map_err(StoreError::codec)?;
        self.blocks
            .insert(block.block_hash.0, bytes.clone())
            .map_err(StoreError::io)?;
        self.blocks_by_height
            .insert(block.height.to_be_bytes(), bytes)
            .map_err(StoreError::io)?;
        let mut state = self.state.write().expect("store state lock poisoned");
        if state
            .latest_block
            .as_ref()
            .map(|b| b.height < block.height)
            .unwrap_or(true)
        {
            state.latest_block = Some(block.clone());
        }
        Ok(())
    }

    pub fn latest_block(&self) -> Block {
        self.state
            .read()
            .expect("store state lock poisoned")
            .latest_block
            .clone()
            .expect("store always holds the genesis block")
    }

    pub fn block_at(&self, height: u64) -> Result<Option<Block>, StoreError> {
        match self
            .blocks_by_height
            .get(height.to_be_bytes())
            .map_err(StoreError::io)?
        {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(StoreError::codec)?)),
            None => Ok(None),
        }
    }

    pub fn get_block(&self, hash: &BlockHash) -> Result<Option<Block>, StoreError> {
        match self.blocks.get(hash.0).map_err(StoreError::io)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(StoreError::codec)?)),
            None => Ok(None),
        }
    }

    /// Events a puller is missing, given its per-creator merge heights.
    ///
    /// Returns events ordered by `(merge_height, event_hash)` — a valid
    /// topological order because parent edges point to strictly lower
    /// merge heights — capped at `limit`.
    pub fn events_since(
        &self,
        known_heights: &std::collections::BTreeMap<CreatorId, u64>,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        let creators: Vec<CreatorId> = {
            let state = self.state.read().expect("store state lock poisoned");
            state.chain_heads.keys().copied().collect::<Vec<_>>()
        };
        let mut out = Vec::new();
        for creator in creators {
            let after = known_heights.get(&creator).copied().unwrap_or(0);
            let start = creator_height_key(&creator, after + 1, &EventHash::zero());
            let mut end = [0xffu8; 72];
            end[..32].copy_from_slice(&creator.0);
            for entry in self.events_by_creator.range(start..=end) {
                let (_, hash_bytes) = entry.map_err(StoreError::io)?;
                let bytes: crate::Hash = hash_bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| StoreError::Io("corrupt creator index".into()))?;
                if let Some(event) = self.get_event(&EventHash(bytes))? {
                    out.push(event);
                }
            }
        }
        out.sort_by(|a, b| {
            (a.merge_height, a.event_hash).cmp(&(b.merge_height, b.event_hash))
        });
        out.truncate(limit);
        Ok(out)
    }

    /// Merge heights of every known creator head (the pull cursor payload).
    pub fn known_heights(&self) -> std::collections::BTreeMap<CreatorId, u64> {
        let state = self.state.read().expect("store state lock poisoned");
        state
            .chain_heads
            .iter()
            .map(|(creator, (_, height))| (*creator, *height))
            .collect()
    }

    /// Fetch specific events by hash (targeted missing-parent pulls).
    pub fn get_events(&self, hashes: &[EventHash]) -> Result<Vec<Event>, StoreError> {
        let mut out = Vec::with_capacity(hashes.len());
        for hash in hashes {
            if let Some(event) = self.get_event(hash)? {
                out.push(event);
            }
        }
        out.sort_by(|a, b| {
            (a.merge_height, a.event_hash).cmp(&(b.merge_height, b.event_hash))
        });
        Ok(out)
    }

    /// Committed events in consensus order (ordered reads per the
    /// consensus index).
    pub fn consensus_history(&self) -> Result<Vec<EventHash>, StoreError> {
        let mut out = Vec::new();
        for entry in self.consensus_index.iter() {
            let (key, _) = entry.map_err(StoreError::io)?;
            let bytes: crate::Hash = key[8..]
                .try_into()
                .map_err(|_| StoreError::Io("corrupt consensus index".into()))?;
            out.push(EventHash(bytes));
        }
        Ok(out)
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(StoreError::io)?;
        Ok(())
    }

    /// Check the reachable-state DAG invariants: acyclicity, hash
    /// integrity, per-creator tree chains, and the basis-height bound for
    /// committed events. Used by tests and debug assertions.
    pub fn verify_dag_invariants(&self) -> Result<(), String> {
        let mut events = HashMap::new();
        for entry in self.events.iter() {
            let (_, value) = entry.map_err(|e| e.to_string())?;
            let event: Event = bincode::deserialize(&value).map_err(|e| e.to_string())?;
            events.insert(event.event_hash, event);
        }
        for event in events.values() {
            if event.computed_hash() != event.event_hash {
                return Err(format!("hash integrity violated for {}", event.event_hash));
            }
            for parent_hash in &event.parent_hashes {
                if let Some(parent) = events.get(parent_hash) {
                    if parent.merge_height >= event.merge_height {
                        return Err(format!(
                            "acyclicity violated: {} -> {}",
                            event.event_hash, parent_hash
                        ));
                    }
                }
            }
        }
        // Tree-monotone: at most one non-forked branch per (creator, tree).
        let mut tree_edges: HashMap<(CreatorId, EventHash), Vec<EventHash>> = HashMap::new();
        for event in events.values() {
            if !event.is_genesis_era() {
                tree_edges
                    .entry((event.creator, event.tree_hash))
                    .or_default()
                    .push(event.event_hash);
            }
        }
        let forked = self.forked_creators();
        for ((creator, _), children) in &tree_edges {
            if children.len() > 1 && !forked.contains(creator) {
                return Err(format!("undetected fork for creator {creator}"));
            }
        }
        // Basis bound: a committed event can only have seen blocks below
        // its own committing height, and parents never commit later than
        // their children.
        for event in events.values() {
            let Ok(Some(meta)) = self.read_meta(&event.event_hash) else {
                continue;
            };
            let Some(committed_at) = meta.block_height else {
                continue;
            };
            if !event.is_genesis_era() && event.basis_block_height >= committed_at {
                return Err(format!(
                    "basis height bound violated for {}",
                    event.event_hash
                ));
            }
            for parent_hash in &event.parent_hashes {
                if let Ok(Some(parent_meta)) = self.read_meta(parent_hash) {
                    if let Some(parent_height) = parent_meta.block_height {
                        if parent_height > committed_at {
                            return Err(format!(
                                "parent of {} committed later than its child",
                                event.event_hash
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Arena-style snapshot of the uncommitted DAG.
///
/// Events are keyed by hash; parent and child indices are collections of
/// keys, never owning references, so forward/back pointers cannot form
/// reference cycles.
#[derive(Clone, Debug, Default)]
pub struct DagSlice {
    events: HashMap<EventHash, Event>,
    parents: HashMap<EventHash, Vec<EventHash>>,
    children: HashMap<EventHash, Vec<EventHash>>,
    forked: HashSet<CreatorId>,
}

impl DagSlice {
    /// Build a slice from raw events, populating both indices and
    /// detecting forks visible inside the slice.
    pub fn from_events(events: Vec<Event>) -> Self {
        let mut slice = DagSlice::default();
        for event in events {
            slice.events.insert(event.event_hash, event);
        }
        let hashes: Vec<EventHash> = slice.events.keys().copied().collect();
        for hash in hashes {
            let event = slice.events[&hash].clone();
            let in_slice: Vec<EventHash> = event
                .parent_hashes
                .iter()
                .filter(|p| slice.events.contains_key(p))
                .copied()
                .collect();
            for parent in &in_slice {
                slice.children.entry(*parent).or_default().push(hash);
            }
            slice.parents.insert(hash, in_slice);
        }
        // Deterministic child ordering regardless of map iteration order.
        for children in slice.children.values_mut() {
            children.sort();
        }
        // Fork detection: two distinct events by one creator sharing a
        // tree hash.
        let mut tree_edges: HashMap<(CreatorId, EventHash), EventHash> = HashMap::new();
        for event in slice.events.values() {
            if event.is_genesis_era() {
                continue;
            }
            if let Some(existing) = tree_edges.insert((event.creator, event.tree_hash), event.event_hash)
            {
                if existing != event.event_hash {
                    slice.forked.insert(event.creator);
                }
            }
        }
        slice
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn contains(&self, hash: &EventHash) -> bool {
        self.events.contains_key(hash)
    }

    pub fn get(&self, hash: &EventHash) -> Option<&Event> {
        self.events.get(hash)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.values()
    }

    /// In-slice parents of an event (committed parents are outside the
    /// slice and therefore absent).
    pub fn parents_of(&self, hash: &EventHash) -> &[EventHash] {
        self.parents.get(hash).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn children_of(&self, hash: &EventHash) -> &[EventHash] {
        self.children.get(hash).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Creators with forks visible in this slice (plus any carried over
    /// from store-level detection).
    pub fn forked_creators(&self) -> &HashSet<CreatorId> {
        &self.forked
    }

    /// Strict in-slice ancestors of an event (excludes the event itself).
    pub fn ancestors(&self, of: &EventHash) -> HashSet<EventHash> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<EventHash> = self.parents_of(of).iter().copied().collect();
        while let Some(hash) = queue.pop_front() {
            if seen.insert(hash) {
                queue.extend(self.parents_of(&hash).iter().copied());
            }
        }
        seen
    }

    /// Merge events in the slice, sorted by `(merge_height, event_hash)`.
    pub fn merge_events(&self) -> Vec<&Event> {
        let mut merges: Vec<&Event> = self.events.values().filter(|e| e.kind.is_merge()).collect();
        merges.sort_by_key(|e| (e.merge_height, e.event_hash));
        merges
    }
}
