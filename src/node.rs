//! Ledger node assembly: wiring the store, registry, gossip, merge
//! scheduler, and worker together, plus the local operation path.
//!
//! Producers submit opaque operations through [`LocalApi`]; each operation
//! passes the pluggable [`OperationValidator`] and lands in a bounded
//! queue that the merge scheduler drains. A full queue rejects producers
//! with backpressure rather than growing without bound.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::block::GenesisBundle;
use crate::config::{ConfigError, ContinuityConfig};
use crate::consensus::ConsensusRegistry;
use crate::crypto::SigningKeypair;
use crate::event::{CreatorId, Operation};
use crate::gossip::{GossipClient, GossipServer, GossipTransport};
use crate::merge::Merger;
use crate::peers::{PeerRegistry, RegistryError};
use crate::store::{EventStore, StoreError};
use crate::worker::Worker;

/// Node assembly errors.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown consensus method {0}")]
    UnknownConsensusMethod(String),
}

/// Operation validation failure, produced by the pluggable validator.
#[derive(Clone, Debug, thiserror::Error)]
#[error("operation validation failed: {0}")]
pub struct ValidationError(pub String);

/// Pluggable operation/record validator consulted before a regular event
/// payload is accepted from the local API.
pub trait OperationValidator: Send + Sync {
    fn validate(&self, operation: &serde_json::Value) -> Result<(), ValidationError>;
}

/// Accepts any well-formed JSON payload. The engine totally orders opaque
/// operations; semantic validation belongs to the embedding application.
pub struct AcceptAllOperations;

impl OperationValidator for AcceptAllOperations {
    fn validate(&self, _operation: &serde_json::Value) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Local submission failures.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("operation payload too large")]
    TooLarge,
    /// Backpressure: the queue is full; the producer should retry later.
    #[error("operation queue overloaded")]
    Overloaded,
}

/// Bounded queue of operations waiting to be folded into the chain.
pub struct OperationQueue {
    inner: Mutex<VecDeque<Operation>>,
    capacity: usize,
}

impl OperationQueue {
    pub fn new(capacity: usize) -> Self {
        OperationQueue {
            inner: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    pub fn push(&self, operation: Operation) -> Result<(), SubmitError> {
        let mut queue = self.inner.lock().expect("operation queue lock poisoned");
        if queue.len() >= self.capacity {
            return Err(SubmitError::Overloaded);
        }
        queue.push_back(operation);
        Ok(())
    }

    /// Remove and return up to `max` operations, oldest first.
    pub fn drain(&self, max: usize) -> Vec<Operation> {
        let mut queue = self.inner.lock().expect("operation queue lock poisoned");
        let take = max.min(queue.len());
        queue.drain(..take).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("operation queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Producer-facing handle: validate and enqueue operations, waking the
/// worker so they are folded promptly.
pub struct LocalApi {
    queue: Arc<OperationQueue>,
    validator: Arc<dyn OperationValidator>,
    wake: tokio::sync::mpsc::Sender<CreatorId>,
    local_id: CreatorId,
}

impl LocalApi {
    pub fn submit(&self, payload: serde_json::Value) -> Result<(), SubmitError> {
        self.validator.validate(&payload)?;
        let operation = Operation::from_value(&payload).ok_or(SubmitError::TooLarge)?;
        self.queue.push(operation)?;
        let _ = self.wake.try_send(self.local_id);
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

/// A fully wired ledger node. The [`Worker`] is returned separately so
/// the caller owns its task; everything else is shared handles.
pub struct LedgerNode {
    pub store: Arc<EventStore>,
    pub registry: Arc<PeerRegistry>,
    pub client: Arc<GossipClient>,
    pub server: Arc<GossipServer>,
    pub api: Arc<LocalApi>,
    pub local_id: CreatorId,
    pub cancel: CancellationToken,
}

impl LedgerNode {
    /// Assemble a node over an open database and a shared genesis bundle.
    ///
    /// The witness pool from the ledger configuration seeds the peer
    /// registry as recommended peers; the consensus method is resolved
    /// through the explicit registry passed by the caller.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        db: sled::Db,
        genesis: &GenesisBundle,
        keypair: SigningKeypair,
        advertised_addr: String,
        config: ContinuityConfig,
        transport: Arc<dyn GossipTransport>,
        validator: Arc<dyn OperationValidator>,
        methods: &ConsensusRegistry,
        method_name: &str,
    ) -> Result<(Arc<LedgerNode>, Worker), NodeError> {
        config.validate()?;
        let method = methods
            .get(method_name)
            .ok_or_else(|| NodeError::UnknownConsensusMethod(method_name.to_string()))?;

        let now = crate::now_ms();
        let local_id = CreatorId::from_key(&keypair.public);
        let store = Arc::new(EventStore::open(db.clone(), genesis, now)?);
        let peers_tree = db
            .open_tree("peers")
            .map_err(|e| StoreError::Io(e.to_string()))?;
        let registry = Arc::new(PeerRegistry::open(peers_tree, config.clone())?);

        // The configured witness pool is always known and recommended.
        for witness in &genesis.configuration.witness_pool {
            if witness.id == local_id {
                continue;
            }
            registry.ensure_peer(witness.id, &witness.address, true, now)?;
        }

        let (wake_tx, wake_rx) = tokio::sync::mpsc::channel(32);
        let server = Arc::new(GossipServer::new(
            store.clone(),
            registry.clone(),
            wake_tx.clone(),
        ));
        let client = Arc::new(GossipClient::new(
            store.clone(),
            registry.clone(),
            transport,
            local_id,
            advertised_addr,
        ));
        let queue = Arc::new(OperationQueue::new(config.operation_queue_capacity));
        let api = Arc::new(LocalApi {
            queue: queue.clone(),
            validator,
            wake: wake_tx,
            local_id,
        });

        let cancel = CancellationToken::new();
        let worker = Worker::new(
            store.clone(),
            registry.clone(),
            client.clone(),
            Merger::new(keypair, config.clone()),
            method,
            config,
            queue,
            genesis.configuration.witness_ids(),
            local_id,
            wake_rx,
            cancel.clone(),
        );

        let node = Arc::new(LedgerNode {
            store,
            registry,
            client,
            server,
            api,
            local_id,
            cancel,
        });
        Ok((node, worker))
    }

    /// Signal the worker to stop at its next suspension point.
    pub fn halt(&self) {
        self.cancel.cancel();
    }
}
