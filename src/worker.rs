//! The per-ledger worker: gossip → merge → consensus → commit.
//!
//! One worker owns all writes to its ledger's event store and peer
//! registry. Each cycle gossips with up to `gossip_fanout` candidate
//! peers (per-pull timeout enforced), lets the merge scheduler emit at
//! most one merge event, evaluates consensus over the recent history, and
//! commits a block when a decision closes. Between cycles the worker
//! sleeps until the earliest peer backoff expires or a notify wakes it;
//! concurrent notifies coalesce through a single bounded wake channel.
//!
//! Cancellation is honored at every suspension point. A cancelled cycle
//! leaves the store consistent: inserts are individually atomic and block
//! commits are single batches.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::block::Block;
use crate::config::ContinuityConfig;
use crate::consensus::{select_witnesses, ConsensusInput, ConsensusMethod};
use crate::event::CreatorId;
use crate::gossip::{Cursor, GossipClient};
use crate::merge::{Merger, NodeContext};
use crate::node::OperationQueue;
use crate::peers::{GossipFailure, GossipSuccess, PeerRegistry};
use crate::store::EventStore;

/// What one worker cycle accomplished.
#[derive(Clone, Debug, Default)]
pub struct CycleReport {
    pub peers_gossiped: usize,
    pub events_pulled: usize,
    pub blocks_applied: usize,
    pub merged: bool,
    pub committed_block: Option<u64>,
}

impl CycleReport {
    /// An idle cycle moved nothing; the worker may sleep.
    pub fn is_idle(&self) -> bool {
        self.events_pulled == 0
            && self.blocks_applied == 0
            && !self.merged
            && self.committed_block.is_none()
    }
}

/// Per-ledger cooperative driver.
pub struct Worker {
    store: Arc<EventStore>,
    registry: Arc<PeerRegistry>,
    client: Arc<GossipClient>,
    merger: Merger,
    method: Arc<dyn ConsensusMethod>,
    config: ContinuityConfig,
    queue: Arc<OperationQueue>,
    witness_pool: Vec<CreatorId>,
    local_id: CreatorId,
    wake: tokio::sync::mpsc::Receiver<CreatorId>,
    cancel: CancellationToken,
    /// Witnesses the last consensus evaluation still needs support from;
    /// gossip prefers them.
    priority_peers: Vec<CreatorId>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<EventStore>,
        registry: Arc<PeerRegistry>,
        client: Arc<GossipClient>,
        merger: Merger,
        method: Arc<dyn ConsensusMethod>,
        config: ContinuityConfig,
        queue: Arc<OperationQueue>,
        witness_pool: Vec<CreatorId>,
        local_id: CreatorId,
        wake: tokio::sync::mpsc::Receiver<CreatorId>,
        cancel: CancellationToken,
    ) -> Self {
        Worker {
            store,
            registry,
            client,
            merger,
            method,
            config,
            queue,
            witness_pool,
            local_id,
            wake,
            cancel,
            priority_peers: Vec::new(),
        }
    }

    /// Run one gossip → merge → consensus → commit cycle.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        let now = crate::now_ms();

        let latest = self.store.latest_block();
        let witnesses = select_witnesses(&latest.block_hash, &self.witness_pool);
        self.registry
            .set_witnesses(witnesses.members().iter().copied().collect());

        // Gossip with up to `gossip_fanout` candidates, preferring peers
        // the last consensus evaluation flagged as needed.
        let mut candidates = self.registry.candidates(now);
        if !self.priority_peers.is_empty() {
            let priority: HashSet<CreatorId> = self.priority_peers.iter().copied().collect();
            candidates.sort_by_key(|p| !priority.contains(&p.id));
        }
        let selected: Vec<_> = candidates
            .into_iter()
            .take(self.config.gossip_fanout)
            .collect();

        for peer in &selected {
            if self.cancel.is_cancelled() {
                return report;
            }
            report.peers_gossiped += 1;
            let pull = tokio::time::timeout(
                Duration::from_millis(self.config.pull_timeout_ms),
                self.client.pull_session(&peer.address, Some(peer.id), now),
            )
            .await;
            match pull {
                Ok(Ok(outcome)) => {
                    report.events_pulled += outcome.events_received;
                    report.blocks_applied += outcome.blocks_applied;
                    let required = outcome
                        .cursor
                        .as_ref()
                        .map(|c| c.required_block_height)
                        .unwrap_or(0);
                    let result = self.registry.record_success(
                        &peer.id,
                        GossipSuccess {
                            events_received: outcome.events_received,
                            cursor: outcome.cursor.as_ref().map(Cursor::to_opaque),
                            required_block_height: required,
                            local_block_height: self.store.latest_block().height,
                        },
                        crate::now_ms(),
                    );
                    if let Err(e) = result {
                        tracing::error!(peer = %peer.id, error = %e, "Failed to record gossip success");
                    }
                }
                Ok(Err(e)) => {
                    tracing::debug!(peer = %peer.id, error = %e, "Gossip pull failed");
                    let result = self.registry.record_failure(
                        &peer.id,
                        GossipFailure {
                            error: e.to_string(),
                            cursor: None,
                            fatal: e.is_fatal(),
                        },
                        crate::now_ms(),
                    );
                    if let Err(e) = result {
                        tracing::error!(peer = %peer.id, error = %e, "Failed to record gossip failure");
                    }
                }
                Err(_) => {
                    // A pull timeout is a non-fatal failure.
                    let result = self.registry.record_failure(
                        &peer.id,
                        GossipFailure {
                            error: format!("pull timed out after {} ms", self.config.pull_timeout_ms),
                            cursor: None,
                            fatal: false,
                        },
                        crate::now_ms(),
                    );
                    if let Err(e) = result {
                        tracing::error!(peer = %peer.id, error = %e, "Failed to record pull timeout");
                    }
                }
            }
        }

        // Merge: heights may have advanced through applied blocks, so the
        // context is re-derived.
        let latest = self.store.latest_block();
        let ctx = NodeContext {
            creator: self.local_id,
            latest_block_height: latest.height,
            latest_block_hash: latest.block_hash,
            witnesses: select_witnesses(&latest.block_hash, &self.witness_pool),
        };
        let operations = if self.merger.should_include_operations(self.queue.len()) {
            self.queue.drain(crate::constants::MAX_OPERATIONS_PER_EVENT)
        } else {
            Vec::new()
        };
        match self.merger.maybe_merge(&self.store, operations, &ctx, crate::now_ms()) {
            Ok(Some(_outcome)) => {
                report.merged = true;
                for peer in &selected {
                    if self.cancel.is_cancelled() {
                        return report;
                    }
                    self.client.notify(&peer.address).await;
                    let _ = self.registry.record_notify(&peer.id, crate::now_ms());
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(error = %e, "Merge failed; continuing");
            }
        }

        // Consensus over the recent history.
        let latest = self.store.latest_block();
        let witnesses = select_witnesses(&latest.block_hash, &self.witness_pool);
        let slice = self.store.recent_history();
        let result = self.method.evaluate(&ConsensusInput {
            slice: &slice,
            witnesses: &witnesses,
            latest_block_height: latest.height,
        });
        self.priority_peers = result.priority_peers.clone();
        if let Some(decision) = result.decision {
            let block = Block::new(
                latest.height + 1,
                latest.block_hash,
                decision.event_hashes,
                decision.consensus_proof,
                crate::now_ms(),
            );
            match self.store.commit_block(&block) {
                Ok(()) => report.committed_block = Some(block.height),
                Err(e) => tracing::error!(error = %e, "Failed to commit decided block"),
            }
        }

        report
    }

    /// Drive cycles until cancelled, sleeping between idle cycles until
    /// the earliest peer backoff expires or a notify arrives.
    pub async fn run(mut self) {
        let cancel = self.cancel.clone();
        tracing::info!(ledger = %self.store.ledger(), "Worker started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let wall = Duration::from_millis(self.config.cycle_wall_bound_ms);
            let report = match tokio::time::timeout(wall, self.run_cycle()).await {
                Ok(report) => report,
                Err(_) => {
                    tracing::warn!("Worker cycle exceeded its wall bound; yielding");
                    CycleReport::default()
                }
            };
            if let Some(height) = report.committed_block {
                tracing::info!(height, "Consensus committed a block");
            }
            if !report.is_idle() {
                // Keep cycling while work is flowing; stay cooperative.
                tokio::task::yield_now().await;
                continue;
            }

            let now = crate::now_ms();
            let sleep_ms = self
                .registry
                .next_backoff_expiry(now)
                .map(|until| until.saturating_sub(now))
                .unwrap_or(self.config.min_idle_ms)
                .clamp(50, self.config.max_idle_ms);
            let woken = tokio::select! {
                _ = cancel.cancelled() => None,
                woken = self.wake.recv() => woken,
                _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => None,
            };
            if let Some(peer) = woken {
                tracing::trace!(peer = %peer, "Woken by notify");
                // Coalesce any further queued wakeups into this cycle.
                while self.wake.try_recv().is_ok() {}
            }
        }
        if let Err(e) = self.store.flush() {
            tracing::error!(error = %e, "Failed to flush storage on shutdown");
        }
        tracing::info!(ledger = %self.store.ledger(), "Worker stopped");
    }
}
