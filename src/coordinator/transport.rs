//! Transport abstraction and the in-process implementation
//!
//! [`LocalTransport`] is a registry of handlers keyed by address. It can cut
//! links between addresses to simulate partitions; a node can always reach
//! itself.

use crate::common::{Error, Result};
use crate::coordinator::messages::{TransportRequest, TransportResponse};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Sends requests to other nodes by address
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, address: &str, request: TransportRequest) -> Result<TransportResponse>;
}

/// Receives requests addressed to this node
#[async_trait]
pub trait TransportHandler: Send + Sync {
    async fn handle(&self, request: TransportRequest) -> Result<TransportResponse>;
}

/// Shared in-process network
#[derive(Clone, Default)]
pub struct LocalTransport {
    handlers: Arc<DashMap<String, Arc<dyn TransportHandler>>>,
    /// Unordered address pairs that cannot talk
    blocked: Arc<RwLock<BTreeSet<(String, String)>>>,
    isolated: Arc<RwLock<BTreeSet<String>>>,
}

fn link(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, address: impl Into<String>, handler: Arc<dyn TransportHandler>) {
        self.handlers.insert(address.into(), handler);
    }

    pub fn unregister(&self, address: &str) {
        self.handlers.remove(address);
    }

    /// Sending side bound to `local_address`
    pub fn channel(&self, local_address: impl Into<String>) -> LocalChannel {
        LocalChannel {
            network: self.clone(),
            local_address: local_address.into(),
        }
    }

    /// Cuts every link between the two groups
    pub fn partition(&self, side_a: &[&str], side_b: &[&str]) {
        let mut blocked = self.blocked.write();
        for a in side_a {
            for b in side_b {
                if a != b {
                    blocked.insert(link(a, b));
                }
            }
        }
        tracing::info!(?side_a, ?side_b, "partitioned local transport");
    }

    /// Cuts `address` off from everyone else
    pub fn isolate(&self, address: &str) {
        self.isolated.write().insert(address.to_string());
        tracing::info!(address, "isolated node");
    }

    /// Restores every link
    pub fn heal(&self) {
        self.blocked.write().clear();
        self.isolated.write().clear();
        tracing::info!("healed local transport");
    }

    pub fn can_reach(&self, from: &str, to: &str) -> bool {
        if from == to {
            return true;
        }
        let isolated = self.isolated.read();
        if isolated.contains(from) || isolated.contains(to) {
            return false;
        }
        !self.blocked.read().contains(&link(from, to))
    }

    async fn deliver(&self, from: &str, to: &str, request: TransportRequest) -> Result<TransportResponse> {
        if !self.can_reach(from, to) {
            return Err(Error::ConnectionFailed(format!("{} cannot reach {}", from, to)));
        }
        // clone out of the map so no shard lock is held across the await
        let handler = self
            .handlers
            .get(to)
            .map(|h| h.value().clone())
            .ok_or_else(|| Error::ConnectionFailed(format!("no node listening on {}", to)))?;
        handler.handle(request).await
    }
}

/// A node's view of the [`LocalTransport`]
#[derive(Clone)]
pub struct LocalChannel {
    network: LocalTransport,
    local_address: String,
}

impl LocalChannel {
    pub fn local_address(&self) -> &str {
        &self.local_address
    }
}

#[async_trait]
impl Transport for LocalChannel {
    async fn send(&self, address: &str, request: TransportRequest) -> Result<TransportResponse> {
        tracing::trace!(from = %self.local_address, to = address, action = request.action(), "sending");
        self.network.deliver(&self.local_address, address, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{DiscoveryNode, NodeRole};
    use crate::coordinator::messages::FollowerCheckRequest;

    struct Echo;

    #[async_trait]
    impl TransportHandler for Echo {
        async fn handle(&self, _request: TransportRequest) -> Result<TransportResponse> {
            Ok(TransportResponse::Ack)
        }
    }

    fn check() -> TransportRequest {
        TransportRequest::FollowerCheck(FollowerCheckRequest {
            source: DiscoveryNode::new("n1", "n1", "a", [NodeRole::Master]),
            term: 1,
        })
    }

    #[tokio::test]
    async fn test_partition_and_heal() {
        let network = LocalTransport::new();
        for address in ["a", "b", "c"] {
            network.register(address, Arc::new(Echo));
        }
        let a = network.channel("a");

        assert_eq!(a.send("b", check()).await.unwrap(), TransportResponse::Ack);
        network.partition(&["a"], &["b", "c"]);
        assert!(matches!(a.send("b", check()).await, Err(Error::ConnectionFailed(_))));
        // a node can always reach itself
        assert!(a.send("a", check()).await.is_ok());
        assert!(network.channel("b").send("c", check()).await.is_ok());

        network.heal();
        assert!(a.send("c", check()).await.is_ok());
    }

    #[tokio::test]
    async fn test_isolate_and_unknown_address() {
        let network = LocalTransport::new();
        network.register("a", Arc::new(Echo));
        network.register("b", Arc::new(Echo));
        network.isolate("b");
        assert!(!network.can_reach("a", "b"));
        assert!(network.can_reach("b", "b"));
        assert!(network.channel("a").send("zzz", check()).await.is_err());
    }
}
