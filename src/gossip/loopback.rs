//! In-process gossip transport for tests and simulations.
//!
//! Wires any number of nodes together in one process by registering their
//! [`GossipServer`]s under string addresses. Unregistering an address
//! simulates an unreachable peer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::{GossipError, GossipServer, GossipTransport, NotifyRequest, PullReply, PullRequest};

/// Registry of in-process gossip servers, keyed by address.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    servers: Arc<RwLock<HashMap<String, Arc<GossipServer>>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, address: &str, server: Arc<GossipServer>) {
        self.servers
            .write()
            .expect("loopback lock poisoned")
            .insert(address.to_string(), server);
    }

    /// Remove a node from the network (simulates an unreachable peer).
    pub fn unregister(&self, address: &str) {
        self.servers
            .write()
            .expect("loopback lock poisoned")
            .remove(address);
    }

    pub fn transport(&self) -> Arc<dyn GossipTransport> {
        Arc::new(LoopbackTransport {
            servers: self.servers.clone(),
        })
    }

    fn server(&self, address: &str) -> Option<Arc<GossipServer>> {
        self.servers
            .read()
            .expect("loopback lock poisoned")
            .get(address)
            .cloned()
    }
}

struct LoopbackTransport {
    servers: Arc<RwLock<HashMap<String, Arc<GossipServer>>>>,
}

impl LoopbackTransport {
    fn server(&self, address: &str) -> Result<Arc<GossipServer>, GossipError> {
        self.servers
            .read()
            .expect("loopback lock poisoned")
            .get(address)
            .cloned()
            .ok_or_else(|| GossipError::Network {
                address: address.to_string(),
                detail: "connection refused".into(),
                http_status: None,
            })
    }
}

#[async_trait]
impl GossipTransport for LoopbackTransport {
    async fn pull(&self, address: &str, request: PullRequest) -> Result<PullReply, GossipError> {
        Ok(self.server(address)?.handle_pull(&request))
    }

    async fn notify(&self, address: &str, request: NotifyRequest) -> Result<(), GossipError> {
        self.server(address)?.handle_notify(&request);
        Ok(())
    }
}
