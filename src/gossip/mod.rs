//! Gossip protocol: peer notification and event transfer.
//!
//! Two exchanges over a request/response transport:
//! - **notify** — fire-and-forget "I have new events" signal, no payload
//!   beyond the sender's identity and address.
//! - **pull** — returns an ordered batch of events the remote believes the
//!   requester is missing (plus any committed blocks past the requester's
//!   horizon), and an updated cursor carrying the remote's commit horizon.
//!
//! The transport itself is a trait seam: production nodes speak HTTP
//! ([`http`]), tests wire nodes together in-process ([`loopback`]).

pub mod http;
pub mod loopback;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::constants;
use crate::event::{CreatorId, Event, EventHash, LedgerId};
use crate::peers::PeerRegistry;
use crate::store::{EventStore, InsertOrigin, InsertOutcome, StoreError};

/// Pagination/position token exchanged between peers.
///
/// Opaque at the protocol level; peers echo it back to resume incremental
/// gossip where the previous session left off.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Per-creator merge heights the sending side already holds.
    pub known_heights: BTreeMap<CreatorId, u64>,
    /// The sending side's committed block height.
    pub required_block_height: u64,
}

impl Cursor {
    /// Serialize for storage in a peer record.
    pub fn to_opaque(&self) -> Vec<u8> {
        bincode::serialize(self).expect("cursor encoding cannot fail")
    }

    pub fn from_opaque(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }
}

/// Pull request: "send me what I'm missing" or a targeted hash fetch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PullRequest {
    pub ledger: LedgerId,
    pub peer_id: CreatorId,
    /// Requester's address, for peer discovery on first contact.
    pub address: Option<String>,
    pub cursor: Option<Cursor>,
    /// When non-empty, fetch exactly these events (missing-parent
    /// resolution) instead of a cursor batch.
    pub want_hashes: Vec<EventHash>,
}

/// Pull reply envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum PullReply {
    /// Events ordered parents-first, blocks past the requester's horizon,
    /// and the responder's cursor.
    Ok {
        events: Vec<Event>,
        blocks: Vec<Block>,
        cursor: Cursor,
    },
    /// The responder does not serve this ledger. Session-fatal.
    NotFound,
}

/// Notify request: no payload, just identity and reachability.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotifyRequest {
    pub ledger: LedgerId,
    pub peer_id: CreatorId,
    pub address: String,
}

/// Gossip protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum GossipError {
    /// Transport failure. Non-fatal; drives backoff.
    #[error("network error contacting {address}: {detail}")]
    Network {
        address: String,
        detail: String,
        http_status: Option<u16>,
    },
    /// The remote does not know this ledger. Fatal for the session only.
    #[error("ledger unknown to {address}")]
    NotFound { address: String },
    /// Malformed or invalid payload. Fatal: the peer is deleted.
    #[error("invalid payload from {address}: {detail}")]
    Validation { address: String, detail: String },
    /// The pull exceeded its deadline. Non-fatal.
    #[error("pull timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
}

impl GossipError {
    /// Whether this failure should delete the peer.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GossipError::Validation { .. })
    }
}

/// Request/response transport seam.
#[async_trait]
pub trait GossipTransport: Send + Sync {
    async fn pull(&self, address: &str, request: PullRequest) -> Result<PullReply, GossipError>;
    async fn notify(&self, address: &str, request: NotifyRequest) -> Result<(), GossipError>;
}

/// Transport-independent server side: answers pulls from the store and
/// turns notifies into worker wakeups.
pub struct GossipServer {
    store: Arc<EventStore>,
    registry: Arc<PeerRegistry>,
    wake: tokio::sync::mpsc::Sender<CreatorId>,
}

impl GossipServer {
    pub fn new(
        store: Arc<EventStore>,
        registry: Arc<PeerRegistry>,
        wake: tokio::sync::mpsc::Sender<CreatorId>,
    ) -> Self {
        GossipServer {
            store,
            registry,
            wake,
        }
    }

    /// Answer a pull: targeted hash fetch, or a cursor batch plus any
    /// blocks past the requester's commit horizon.
    pub fn handle_pull(&self, request: &PullRequest) -> PullReply {
        if request.ledger != self.store.ledger() {
            return PullReply::NotFound;
        }
        if let Some(address) = &request.address {
            let _ = self
                .registry
                .ensure_peer(request.peer_id, address, false, crate::now_ms());
        }

        let events = if !request.want_hashes.is_empty() {
            let capped: Vec<EventHash> = request
                .want_hashes
                .iter()
                .take(constants::PULL_BATCH_LIMIT)
                .copied()
                .collect();
            self.store.get_events(&capped).unwrap_or_default()
        } else {
            let known = request
                .cursor
                .as_ref()
                .map(|c| c.known_heights.clone())
                .unwrap_or_default();
            self.store
                .events_since(&known, constants::PULL_BATCH_LIMIT)
                .unwrap_or_default()
        };

        let local_height = self.store.latest_block().height;
        let requester_height = request
            .cursor
            .as_ref()
            .map(|c| c.required_block_height)
            .unwrap_or(0);
        let mut blocks = Vec::new();
        // Targeted fetches resolve specific parents; block transfer only
        // rides on cursor pulls.
        if request.want_hashes.is_empty() && requester_height < local_height {
            for height in (requester_height + 1)..=local_height {
                match self.store.block_at(height) {
                    Ok(Some(block)) => blocks.push(block),
                    _ => break,
                }
            }
        }

        PullReply::Ok {
            events,
            blocks,
            cursor: Cursor {
                known_heights: self.store.known_heights(),
                required_block_height: local_height,
            },
        }
    }

    /// Register the notifying peer and wake the worker. Coalesces: a full
    /// wake channel means a wakeup is already pending.
    pub fn handle_notify(&self, request: &NotifyRequest) -> bool {
        if request.ledger != self.store.ledger() {
            return false;
        }
        let _ = self
            .registry
            .ensure_peer(request.peer_id, &request.address, false, crate::now_ms());
        let _ = self.wake.try_send(request.peer_id);
        true
    }
}

/// What a completed pull session produced.
#[derive(Clone, Debug, Default)]
pub struct SessionOutcome {
    /// Newly inserted events.
    pub events_received: usize,
    /// Blocks applied from the peer's commit horizon.
    pub blocks_applied: usize,
    /// The responder's cursor, for the peer record.
    pub cursor: Option<Cursor>,
}

/// Client side of the gossip protocol: runs pull sessions and notifies.
pub struct GossipClient {
    store: Arc<EventStore>,
    registry: Arc<PeerRegistry>,
    transport: Arc<dyn GossipTransport>,
    local_id: CreatorId,
    local_address: String,
}

impl GossipClient {
    pub fn new(
        store: Arc<EventStore>,
        registry: Arc<PeerRegistry>,
        transport: Arc<dyn GossipTransport>,
        local_id: CreatorId,
        local_address: String,
    ) -> Self {
        GossipClient {
            store,
            registry,
            transport,
            local_id,
            local_address,
        }
    }

    fn base_request(&self) -> PullRequest {
        PullRequest {
            ledger: self.store.ledger(),
            peer_id: self.local_id,
            address: Some(self.local_address.clone()),
            cursor: Some(Cursor {
                known_heights: self.store.known_heights(),
                required_block_height: self.store.latest_block().height,
            }),
            want_hashes: vec![],
        }
    }

    /// Run one pull session against `address`: pull a batch, integrate the
    /// events (resolving missing parents with bounded targeted fetches),
    /// and apply any blocks past our commit horizon. `peer_id`, when
    /// known, lets fork evidence be attributed to the serving peer.
    pub async fn pull_session(
        &self,
        address: &str,
        peer_id: Option<CreatorId>,
        now_ms: u64,
    ) -> Result<SessionOutcome, GossipError> {
        let reply = self.transport.pull(address, self.base_request()).await?;
        let PullReply::Ok {
            events,
            blocks,
            cursor,
        } = reply
        else {
            return Err(GossipError::NotFound {
                address: address.to_string(),
            });
        };

        let mut outcome = SessionOutcome {
            cursor: Some(cursor),
            ..Default::default()
        };
        outcome.events_received = self.integrate(address, peer_id, events, now_ms).await?;
        outcome.blocks_applied = self.apply_blocks(address, peer_id, blocks, now_ms).await?;
        Ok(outcome)
    }

    /// Insert a batch, fetching missing parents by hash. Fetch recursion
    /// is bounded; a peer that cannot produce parents it referenced is
    /// treated as Byzantine.
    async fn integrate(
        &self,
        address: &str,
        peer_id: Option<CreatorId>,
        events: Vec<Event>,
        now_ms: u64,
    ) -> Result<usize, GossipError> {
        let mut inserted = 0usize;
        let mut pending = events;
        let mut rounds = 0usize;

        loop {
            let mut missing: BTreeSet<EventHash> = BTreeSet::new();
            let mut deferred = Vec::new();
            for event in pending {
                match self.store.insert(&event, InsertOrigin::Peer, now_ms) {
                    Ok(InsertOutcome::Inserted) => inserted += 1,
                    Ok(InsertOutcome::Duplicate) => {}
                    Err(StoreError::MissingParents { hashes }) => {
                        missing.extend(hashes);
                        deferred.push(event);
                    }
                    Err(StoreError::Validation(e)) => {
                        return Err(GossipError::Validation {
                            address: address.to_string(),
                            detail: e.to_string(),
                        });
                    }
                    Err(StoreError::ProtocolViolation(detail)) => {
                        return Err(GossipError::Validation {
                            address: address.to_string(),
                            detail,
                        });
                    }
                    Err(StoreError::ForkRejected { creator }) => {
                        // A peer serving its own (non-witness) fork is
                        // Byzantine; a relayed fork branch is merely
                        // dropped — the creator is already withheld.
                        let own_fork = peer_id.map(|id| id == creator).unwrap_or(false);
                        if own_fork && !self.registry.is_witness(&creator) {
                            return Err(GossipError::Validation {
                                address: address.to_string(),
                                detail: format!("fork attempt by non-witness {creator}"),
                            });
                        }
                        tracing::warn!(creator = %creator, "Dropped relayed fork branch");
                    }
                    Err(e) => {
                        // Local storage trouble is not the peer's fault.
                        tracing::error!(error = %e, "Insert failed during gossip");
                        return Err(GossipError::Network {
                            address: address.to_string(),
                            detail: e.to_string(),
                            http_status: None,
                        });
                    }
                }
            }

            if deferred.is_empty() {
                return Ok(inserted);
            }
            rounds += 1;
            if rounds > constants::MISSING_PARENT_FETCH_ROUNDS {
                return Err(GossipError::Network {
                    address: address.to_string(),
                    detail: "missing-parent fetch rounds exhausted".into(),
                    http_status: None,
                });
            }

            let mut request = self.base_request();
            request.cursor = None;
            request.want_hashes = missing.iter().copied().collect();
            let reply = self.transport.pull(address, request).await?;
            let PullReply::Ok {
                events: fetched, ..
            } = reply
            else {
                return Err(GossipError::NotFound {
                    address: address.to_string(),
                });
            };
            if fetched.is_empty() {
                return Err(GossipError::Validation {
                    address: address.to_string(),
                    detail: "peer cannot produce parents it referenced".into(),
                });
            }
            // Parents first, then the events that were waiting on them.
            pending = fetched;
            pending.extend(deferred);
        }
    }

    /// Apply committed blocks from a peer that is ahead of us. Each block
    /// must extend our chain, hash-verify, and reference only events we
    /// hold (fetched by hash if need be).
    async fn apply_blocks(
        &self,
        address: &str,
        peer_id: Option<CreatorId>,
        blocks: Vec<Block>,
        now_ms: u64,
    ) -> Result<usize, GossipError> {
        let mut applied = 0usize;
        for block in blocks {
            let latest = self.store.latest_block();
            if block.height != latest.height + 1 {
                // Out-of-order or stale block; harmless to skip.
                continue;
            }
            if block.previous_block_hash != latest.block_hash || !block.verify_hash() {
                return Err(GossipError::Validation {
                    address: address.to_string(),
                    detail: format!("block {} does not extend our chain", block.height),
                });
            }
            let missing: Vec<EventHash> = block
                .event_hashes
                .iter()
                .filter(|h| !self.store.exists(h))
                .copied()
                .collect();
            if !missing.is_empty() {
                let mut request = self.base_request();
                request.cursor = None;
                request.want_hashes = missing.clone();
                let reply = self.transport.pull(address, request).await?;
                if let PullReply::Ok { events, .. } = reply {
                    self.integrate(address, peer_id, events, now_ms).await?;
                }
                if block.event_hashes.iter().any(|h| !self.store.exists(h)) {
                    return Err(GossipError::Validation {
                        address: address.to_string(),
                        detail: format!("block {} references unknown events", block.height),
                    });
                }
            }
            self.store.commit_block(&block).map_err(|e| GossipError::Network {
                address: address.to_string(),
                detail: e.to_string(),
                http_status: None,
            })?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Fire-and-forget notify. Errors are logged, never propagated.
    pub async fn notify(&self, address: &str) {
        let request = NotifyRequest {
            ledger: self.store.ledger(),
            peer_id: self.local_id,
            address: self.local_address.clone(),
        };
        if let Err(e) = self.transport.notify(address, request).await {
            tracing::debug!(address, error = %e, "Notify failed");
        }
    }
}
