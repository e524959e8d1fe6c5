//! Node selection when a service lives on more than one remote node and the
//! caller did not pin a specific one (spec.md §4.4). `RoundRobin` is the
//! default; `Weighted` and `ConsistentHash` are the alternatives spec.md
//! names as "available" without prescribing their shape.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

/// Chooses one of `candidates` (node ids hosting the target service) for an
/// outbound call that didn't pin a node. Implementations must be
/// deterministic given the same candidate *set* only insofar as their
/// documented policy requires it (round-robin is stateful across calls by
/// design; consistent-hash is stateless and key-driven).
pub trait RoutingPolicy: Send + Sync {
    fn pick(&self, service: &str, candidates: &[u64]) -> Option<u64>;
}

/// Cycles through candidates in order, one step per call, per service name.
/// The default per spec.md §4.4.
#[derive(Default)]
pub struct RoundRobin {
    cursors: RwLock<HashMap<String, AtomicUsize>>,
}

impl RoutingPolicy for RoundRobin {
    fn pick(&self, service: &str, candidates: &[u64]) -> Option<u64> {
        if candidates.is_empty() {
            return None;
        }
        let cursors = self.cursors.read().unwrap();
        if let Some(cursor) = cursors.get(service) {
            let idx = cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
            return Some(candidates[idx]);
        }
        drop(cursors);
        let mut cursors = self.cursors.write().unwrap();
        let cursor = cursors.entry(service.to_owned()).or_insert_with(|| AtomicUsize::new(0));
        let idx = cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[idx])
    }
}

/// Picks a candidate with probability proportional to its configured weight
/// (default weight 1 for nodes with no explicit entry).
pub struct Weighted {
    weights: HashMap<u64, u32>,
}

impl Weighted {
    pub fn new(weights: HashMap<u64, u32>) -> Self {
        Self { weights }
    }

    fn weight_of(&self, node: u64) -> u32 {
        self.weights.get(&node).copied().unwrap_or(1).max(1)
    }
}

impl RoutingPolicy for Weighted {
    fn pick(&self, _service: &str, candidates: &[u64]) -> Option<u64> {
        if candidates.is_empty() {
            return None;
        }
        let total: u64 = candidates.iter().map(|n| self.weight_of(*n) as u64).sum();
        let mut roll = rand::random::<u64>() % total;
        for node in candidates {
            let w = self.weight_of(*node) as u64;
            if roll < w {
                return Some(*node);
            }
            roll -= w;
        }
        candidates.last().copied()
    }
}

/// Deterministically maps `service` onto one of `candidates` by hashing the
/// pair; stable as long as the candidate *order* is stable (callers pass the
/// cluster view's location list, which is).
#[derive(Default)]
pub struct ConsistentHash;

impl RoutingPolicy for ConsistentHash {
    fn pick(&self, service: &str, candidates: &[u64]) -> Option<u64> {
        if candidates.is_empty() {
            return None;
        }
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        service.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % candidates.len();
        Some(candidates[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles_through_candidates() {
        let policy = RoundRobin::default();
        let candidates = [1, 2, 3];
        let picks: Vec<_> = (0..6).map(|_| policy.pick("Math", &candidates).unwrap()).collect();
        assert_eq!(picks, vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn round_robin_tracks_cursor_per_service() {
        let policy = RoundRobin::default();
        assert_eq!(policy.pick("Math", &[1, 2]).unwrap(), 1);
        assert_eq!(policy.pick("Echo", &[5, 6]).unwrap(), 5);
        assert_eq!(policy.pick("Math", &[1, 2]).unwrap(), 2);
    }

    #[test]
    fn consistent_hash_is_stable_for_the_same_service() {
        let policy = ConsistentHash;
        let candidates = [1, 2, 3, 4];
        let first = policy.pick("Math", &candidates);
        let second = policy.pick("Math", &candidates);
        assert_eq!(first, second);
    }

    #[test]
    fn empty_candidates_pick_nothing() {
        assert!(RoundRobin::default().pick("Math", &[]).is_none());
        assert!(ConsistentHash.pick("Math", &[]).is_none());
    }
}
