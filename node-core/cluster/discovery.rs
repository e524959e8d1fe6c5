//! The cluster view is produced by an external discovery collaborator, per
//! spec.md §1's Non-goal on membership/consensus: the core only consumes
//! whatever snapshot it's handed.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::cluster::view::{ClusterViewSnapshot, NodeInfo};
use crate::error::Result;

/// Produces [`ClusterViewSnapshot`]s. The core ships one implementation,
/// [`StaticDiscovery`], suitable for tests and single-shot deployments; a
/// real cluster embeds this crate and supplies its own (etcd watch, gossip,
/// a control-plane poll loop...).
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Returns the current snapshot. Called once at startup and again any
    /// time the embedding binary decides to refresh (the core does not poll
    /// on its own — there is no membership protocol here).
    async fn snapshot(&self) -> Result<ClusterViewSnapshot>;
}

/// A fixed, file/config-provided view that never changes after construction.
/// This is the degenerate discovery source mentioned in spec.md §11: enough
/// to exercise the dispatcher and tests without a real discovery backend.
pub struct StaticDiscovery {
    snapshot: ClusterViewSnapshot,
}

impl StaticDiscovery {
    pub fn new(nodes: Vec<NodeInfo>) -> Self {
        let mut locations: HashMap<String, Vec<u64>> = HashMap::new();
        let mut by_id = HashMap::new();
        for node in nodes {
            for service in &node.services {
                locations.entry(service.clone()).or_default().push(node.node_id);
            }
            by_id.insert(node.node_id, node);
        }
        Self {
            snapshot: ClusterViewSnapshot {
                nodes: by_id,
                locations,
                retiring: Default::default(),
            },
        }
    }
}

#[async_trait]
impl DiscoverySource for StaticDiscovery {
    async fn snapshot(&self) -> Result<ClusterViewSnapshot> {
        Ok(self.snapshot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_discovery_indexes_services_by_node() {
        let discovery = StaticDiscovery::new(vec![NodeInfo {
            node_id: 2,
            address: "127.0.0.1:7001".into(),
            services: vec!["Math".into(), "Echo".into()],
            type_ids: HashMap::new(),
        }]);
        let snap = discovery.snapshot().await.unwrap();
        assert_eq!(snap.locations["Math"], vec![2]);
        assert_eq!(snap.locations["Echo"], vec![2]);
    }
}
