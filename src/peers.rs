//! Peer registry: reputation, backoff, idle accounting, and candidate
//! selection for gossip.
//!
//! Reputation is an integer in `[0, 100]` tracking perceived productivity.
//! Failures cost reputation on a grace-period schedule, idleness costs it
//! proportionally to idle time once the rest of the network advances, and
//! productive gossip earns it back one point at a time. Peers whose
//! reputation would fall below zero are deleted — unless they are current
//! witnesses, which are clamped at zero and never pruned.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::config::ContinuityConfig;
use crate::event::CreatorId;

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unknown peer {0}")]
    UnknownPeer(CreatorId),
}

/// Outcome of a success/failure record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerDisposition {
    Kept,
    Deleted,
}

/// Result of the last pull attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullResult {
    Success,
    Failure(String),
}

/// Snapshot taken at the first of a run of consecutive failures.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FailureSnapshot {
    pub at_ms: u64,
    /// Reputation before the run started.
    pub start_reputation: i64,
}

/// Idle accounting: the peer answered gossip but had nothing new.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct IdleState {
    pub time_ms: u64,
    /// Our block height when idleness was last accounted.
    pub local_block_height: u64,
}

/// Gossip status attached to each peer.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PeerStatus {
    pub backoff_until_ms: u64,
    pub last_pull_at_ms: u64,
    pub last_push_at_ms: u64,
    pub last_pull_result: Option<PullResult>,
    /// Opaque pagination token from the peer's last pull response.
    pub cursor: Option<Vec<u8>>,
    /// The peer's advertised commit horizon.
    pub required_block_height: u64,
    pub consecutive_failures: u32,
    pub first_failure: Option<FailureSnapshot>,
    pub idle: Option<IdleState>,
}

/// A known remote peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: CreatorId,
    pub address: String,
    pub reputation: i64,
    pub recommended: bool,
    pub status: PeerStatus,
    pub sequence: u64,
}

/// What a successful gossip session reported.
#[derive(Clone, Debug)]
pub struct GossipSuccess {
    pub events_received: usize,
    pub cursor: Option<Vec<u8>>,
    pub required_block_height: u64,
    /// Our own latest block height, for idle accounting.
    pub local_block_height: u64,
}

/// What a failed gossip session reported.
#[derive(Clone, Debug)]
pub struct GossipFailure {
    pub error: String,
    /// A newer cursor observed before the failure, if any. The stored
    /// cursor is preserved when this is `None`.
    pub cursor: Option<Vec<u8>>,
    /// Protocol violations delete the peer immediately.
    pub fatal: bool,
}

#[derive(Default)]
struct RegistryState {
    peers: HashMap<CreatorId, PeerRecord>,
    witnesses: HashSet<CreatorId>,
}

/// Set of known remote peers with reputation-driven candidate selection.
pub struct PeerRegistry {
    tree: sled::Tree,
    config: ContinuityConfig,
    state: RwLock<RegistryState>,
}

impl PeerRegistry {
    /// Open the registry over its sled tree, reloading persisted records.
    pub fn open(tree: sled::Tree, config: ContinuityConfig) -> Result<Self, RegistryError> {
        let mut peers = HashMap::new();
        for entry in tree.iter() {
            let (_, value) = entry.map_err(|e| RegistryError::Io(e.to_string()))?;
            let record: PeerRecord = bincode::deserialize(&value)
                .map_err(|e| RegistryError::Serialization(e.to_string()))?;
            peers.insert(record.id, record);
        }
        Ok(PeerRegistry {
            tree,
            config,
            state: RwLock::new(RegistryState {
                peers,
                witnesses: HashSet::new(),
            }),
        })
    }

    /// Replace the current witness set (re-derived per block height).
    /// Witnesses are protected from deletion and reputation floor.
    pub fn set_witnesses(&self, witnesses: HashSet<CreatorId>) {
        self.state
            .write()
            .expect("registry lock poisoned")
            .witnesses = witnesses;
    }

    pub fn is_witness(&self, id: &CreatorId) -> bool {
        self.state
            .read()
            .expect("registry lock poisoned")
            .witnesses
            .contains(id)
    }

    /// Register a peer on discovery. Existing records keep their state
    /// (the address and recommended flag are refreshed). At capacity, a
    /// new untrusted peer displaces the worst unprotected record or is
    /// rejected.
    pub fn ensure_peer(
        &self,
        id: CreatorId,
        address: &str,
        recommended: bool,
        _now_ms: u64,
    ) -> Result<Option<PeerRecord>, RegistryError> {
        let mut state = self.state.write().expect("registry lock poisoned");
        if let Some(record) = state.peers.get_mut(&id) {
            record.address = address.to_string();
            record.recommended = record.recommended || recommended;
            record.sequence += 1;
            let record = record.clone();
            drop(state);
            self.persist(&record)?;
            return Ok(Some(record));
        }

        let capacity = self.config.peer_capacity + self.config.untrusted_capacity;
        if state.peers.len() >= capacity {
            let witnesses = state.witnesses.clone();
            let displaced = state
                .peers
                .values()
                .filter(|p| !p.recommended && !witnesses.contains(&p.id) && p.reputation <= 0)
                .min_by_key(|p| (p.reputation, p.status.last_pull_at_ms))
                .map(|p| p.id);
            match displaced {
                Some(victim) => {
                    state.peers.remove(&victim);
                    drop(state);
                    self.delete_persisted(&victim)?;
                    tracing::debug!(peer = %victim, "Displaced peer at capacity");
                    state = self.state.write().expect("registry lock poisoned");
                }
                None => {
                    tracing::debug!(peer = %id, "Rejected new peer: registry full");
                    return Ok(None);
                }
            }
        }

        let record = PeerRecord {
            id,
            address: address.to_string(),
            reputation: 0,
            recommended,
            status: PeerStatus::default(),
            sequence: 0,
        };
        state.peers.insert(id, record.clone());
        drop(state);
        self.persist(&record)?;
        tracing::debug!(peer = %id, recommended, "Registered peer");
        Ok(Some(record))
    }

    /// Peers eligible for gossip at `now`, ordered by
    /// `(recommended desc, reputation desc, last_pull_at asc)`.
    pub fn candidates(&self, now_ms: u64) -> Vec<PeerRecord> {
        let state = self.state.read().expect("registry lock poisoned");
        let mut eligible: Vec<PeerRecord> = state
            .peers
            .values()
            .filter(|p| p.status.backoff_until_ms <= now_ms)
            .cloned()
            .collect();
        eligible.sort_by(|a, b| {
            b.recommended
                .cmp(&a.recommended)
                .then(b.reputation.cmp(&a.reputation))
                .then(a.status.last_pull_at_ms.cmp(&b.status.last_pull_at_ms))
        });
        eligible
    }

    /// Number of peers with reputation at or below `max_reputation`.
    pub fn count(&self, max_reputation: i64) -> usize {
        let state = self.state.read().expect("registry lock poisoned");
        state
            .peers
            .values()
            .filter(|p| p.reputation <= max_reputation)
            .count()
    }

    pub fn len(&self) -> usize {
        self.state.read().expect("registry lock poisoned").peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &CreatorId) -> Option<PeerRecord> {
        self.state
            .read()
            .expect("registry lock poisoned")
            .peers
            .get(id)
            .cloned()
    }

    /// Record a successful gossip session.
    pub fn record_success(
        &self,
        id: &CreatorId,
        outcome: GossipSuccess,
        now_ms: u64,
    ) -> Result<PeerDisposition, RegistryError> {
        let mut state = self.state.write().expect("registry lock poisoned");
        let is_witness = state.witnesses.contains(id);
        let record = state
            .peers
            .get_mut(id)
            .ok_or(RegistryError::UnknownPeer(*id))?;

        record.status.consecutive_failures = 0;
        record.status.first_failure = None;
        record.status.backoff_until_ms = now_ms;
        record.status.last_pull_at_ms = now_ms;
        record.status.last_pull_result = Some(PullResult::Success);
        record.status.required_block_height = outcome.required_block_height;
        if let Some(cursor) = outcome.cursor {
            record.status.cursor = Some(cursor);
        }

        if outcome.events_received > 0 {
            record.reputation = (record.reputation + 1).min(100);
            record.status.idle = None;
        } else if record.status.idle.is_none() {
            record.status.idle = Some(IdleState {
                time_ms: now_ms,
                local_block_height: outcome.local_block_height,
            });
        } else if record
            .status
            .idle
            .map(|i| i.local_block_height == outcome.local_block_height)
            .unwrap_or(false)
        {
            // Nobody has advanced; everyone is idle together. No penalty.
            if let Some(idle) = record.status.idle.as_mut() {
                idle.time_ms = now_ms;
            }
        } else {
            // Others advanced while this peer produced nothing.
            let idle = record.status.idle.expect("idle checked above");
            let time_per_point = self.config.max_idle_grace_ms.div_ceil(100).max(1);
            let points = (now_ms.saturating_sub(idle.time_ms) / time_per_point) as i64;
            record.reputation -= points;
            record.status.idle = Some(IdleState {
                time_ms: idle.time_ms + points as u64 * time_per_point,
                local_block_height: outcome.local_block_height,
            });
            let backoff = self
                .config
                .max_idle_ms
                .min(self.config.min_idle_ms * (points.max(1) as u64));
            record.status.backoff_until_ms = now_ms + backoff;
            if points > 0 {
                tracing::debug!(peer = %id, points, "Idle penalty applied");
            }
        }
        record.sequence += 1;

        if record.reputation < 0 {
            if is_witness {
                record.reputation = 0;
            } else {
                let id = *id;
                state.peers.remove(&id);
                drop(state);
                self.delete_persisted(&id)?;
                tracing::info!(peer = %id, "Deleted peer: reputation exhausted");
                return Ok(PeerDisposition::Deleted);
            }
        }

        // Capacity rule: a successful session with an untrusted non-witness
        // peer cannot push the untrusted population past capacity.
        if !is_witness && record.reputation == 0 {
            let others_at_zero = state
                .peers
                .values()
                .filter(|p| p.id != *id && p.reputation <= 0)
                .count();
            if others_at_zero >= self.config.peer_capacity {
                state.peers.remove(id);
                let id = *id;
                drop(state);
                self.delete_persisted(&id)?;
                tracing::debug!(peer = %id, "Dropped untrusted peer at capacity");
                return Ok(PeerDisposition::Deleted);
            }
        }

        let record = state.peers.get(id).cloned();
        drop(state);
        if let Some(record) = record {
            self.persist(&record)?;
        }
        Ok(PeerDisposition::Kept)
    }

    /// Record a failed gossip session.
    pub fn record_failure(
        &self,
        id: &CreatorId,
        outcome: GossipFailure,
        now_ms: u64,
    ) -> Result<PeerDisposition, RegistryError> {
        let mut state = self.state.write().expect("registry lock poisoned");
        let is_witness = state.witnesses.contains(id);
        let record = state
            .peers
            .get_mut(id)
            .ok_or(RegistryError::UnknownPeer(*id))?;

        if outcome.fatal {
            let id = *id;
            state.peers.remove(&id);
            drop(state);
            self.delete_persisted(&id)?;
            tracing::warn!(peer = %id, error = %outcome.error, "Deleted peer: protocol violation");
            return Ok(PeerDisposition::Deleted);
        }

        record.status.consecutive_failures += 1;
        record.status.last_pull_at_ms = now_ms;
        record.status.last_pull_result = Some(PullResult::Failure(outcome.error.clone()));
        if let Some(cursor) = outcome.cursor {
            record.status.cursor = Some(cursor);
        }

        match record.status.first_failure {
            None => {
                record.status.first_failure = Some(FailureSnapshot {
                    at_ms: now_ms,
                    start_reputation: record.reputation,
                });
                record.reputation -= 1;
            }
            Some(snapshot) => {
                let elapsed = now_ms.saturating_sub(snapshot.at_ms);
                let points = (elapsed / self.config.max_failure_grace_ms.max(1)) as i64 * 100;
                record.reputation =
                    (snapshot.start_reputation - 1).min(snapshot.start_reputation - points);
            }
        }

        let backoff = self
            .config
            .max_failure_ms
            .min(record.status.consecutive_failures as u64 * self.config.min_failure_ms);
        record.status.backoff_until_ms = now_ms + backoff;
        record.sequence += 1;

        if record.reputation < 0 {
            if is_witness {
                record.reputation = 0;
            } else {
                let id = *id;
                state.peers.remove(&id);
                drop(state);
                self.delete_persisted(&id)?;
                tracing::info!(peer = %id, error = %outcome.error, "Deleted peer: repeated failures");
                return Ok(PeerDisposition::Deleted);
            }
        }

        let record = state.peers.get(id).cloned();
        drop(state);
        if let Some(record) = record {
            self.persist(&record)?;
        }
        Ok(PeerDisposition::Kept)
    }

    /// Earliest moment a currently backed-off peer becomes eligible
    /// again. `None` when no peer is backed off past `now_ms`.
    pub fn next_backoff_expiry(&self, now_ms: u64) -> Option<u64> {
        let state = self.state.read().expect("registry lock poisoned");
        state
            .peers
            .values()
            .map(|p| p.status.backoff_until_ms)
            .filter(|until| *until > now_ms)
            .min()
    }

    /// Record an outbound notify push.
    pub fn record_notify(&self, id: &CreatorId, now_ms: u64) -> Result<(), RegistryError> {
        let mut state = self.state.write().expect("registry lock poisoned");
        if let Some(record) = state.peers.get_mut(id) {
            record.status.last_push_at_ms = now_ms;
            record.sequence += 1;
            let record = record.clone();
            drop(state);
            self.persist(&record)?;
        }
        Ok(())
    }

    fn persist(&self, record: &PeerRecord) -> Result<(), RegistryError> {
        let bytes = bincode::serialize(record)
            .map_err(|e| RegistryError::Serialization(e.to_string()))?;
        self.tree
            .insert(record.id.0, bytes)
            .map_err(|e| RegistryError::Io(e.to_string()))?;
        Ok(())
    }

    fn delete_persisted(&self, id: &CreatorId) -> Result<(), RegistryError> {
        self.tree
            .remove(id.0)
            .map_err(|e| RegistryError::Io(e.to_string()))?;
        Ok(())
    }
}
