use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// What the current view knows about one node: its RPC address, the
/// services it hosts, and their type-ids.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node_id: u64,
    pub address: String,
    pub services: Vec<String>,
    pub type_ids: HashMap<String, u32>,
}

/// An immutable point-in-time view of the cluster. Produced wholesale by a
/// [`crate::cluster::discovery::DiscoverySource`] and swapped in atomically;
/// never mutated in place.
#[derive(Debug, Clone, Default)]
pub struct ClusterViewSnapshot {
    pub nodes: HashMap<u64, NodeInfo>,
    /// service name -> node ids currently hosting it, for fast resolution.
    pub locations: HashMap<String, Vec<u64>>,
    /// (node id, service name) pairs the discovery source has marked
    /// Retiring. The core treats this as authoritative without itself
    /// tracking service lifecycle across the network.
    pub retiring: HashSet<(u64, String)>,
}

impl ClusterViewSnapshot {
    pub fn is_retiring(&self, node_id: u64, service: &str) -> bool {
        self.retiring.contains(&(node_id, service.to_owned()))
    }
}

/// Holds the current snapshot behind a lock that's only ever taken to clone
/// or replace the `Arc` pointer, never to read through it — callers clone
/// the `Arc` once per dispatch and read the immutable snapshot lock-free
/// from then on.
pub struct ClusterView {
    current: RwLock<Arc<ClusterViewSnapshot>>,
}

impl ClusterView {
    pub fn new(initial: ClusterViewSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn snapshot(&self) -> Arc<ClusterViewSnapshot> {
        self.current.read().unwrap().clone()
    }

    /// Installs a new view. Updates are treated as monotone whole-snapshot
    /// replacements, never incremental patches.
    pub fn swap(&self, next: ClusterViewSnapshot) {
        *self.current.write().unwrap() = Arc::new(next);
    }
}

impl Default for ClusterView {
    fn default() -> Self {
        Self::new(ClusterViewSnapshot::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_replaces_the_whole_snapshot() {
        let view = ClusterView::default();
        assert!(view.snapshot().nodes.is_empty());

        let mut next = ClusterViewSnapshot::default();
        next.nodes.insert(
            2,
            NodeInfo {
                node_id: 2,
                address: "127.0.0.1:7001".into(),
                services: vec!["Math".into()],
                type_ids: HashMap::new(),
            },
        );
        next.locations.insert("Math".into(), vec![2]);
        view.swap(next);

        let snap = view.snapshot();
        assert_eq!(snap.locations["Math"], vec![2]);
    }

    #[test]
    fn retiring_lookup_matches_node_and_service() {
        let mut snap = ClusterViewSnapshot::default();
        snap.retiring.insert((1, "Math".into()));
        assert!(snap.is_retiring(1, "Math"));
        assert!(!snap.is_retiring(2, "Math"));
    }
}
