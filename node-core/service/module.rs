use std::collections::HashMap;

use crate::error::{CoreError, Result};
use crate::service::events::SubscriptionId;
use crate::service::timer::TimerId;

/// Module-ids below this are reserved for callers; the arena allocates ids
/// at or above it for `AddModule` calls that don't request a specific id.
pub const AUTO_ID_SEED: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u64);

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hooks a module implementation can provide. Registered once with the node
/// at `AddModule` time; `on_release` is best-effort (errors are logged, not
/// propagated, since release must always complete).
pub trait ModuleHooks: Send {
    fn on_init(&mut self) -> Result<()> {
        Ok(())
    }

    fn on_release(&mut self) {}
}

struct NoopHooks;
impl ModuleHooks for NoopHooks {}

struct ModuleNode {
    parent: Option<ModuleId>,
    children: Vec<ModuleId>,
    timers: Vec<TimerId>,
    safe_timers: HashMap<u64, TimerId>,
    subscriptions: Vec<SubscriptionId>,
    hooks: Box<dyn ModuleHooks>,
}

/// The per-service arena of modules, keyed by id, with non-owning parent
/// and child links stored as ids rather than strong references.
pub struct ModuleTree {
    nodes: HashMap<ModuleId, ModuleNode>,
    root: ModuleId,
    next_auto_id: u64,
}

impl ModuleTree {
    pub fn new() -> Self {
        let root = ModuleId(0);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            ModuleNode {
                parent: None,
                children: Vec::new(),
                timers: Vec::new(),
                safe_timers: HashMap::new(),
                subscriptions: Vec::new(),
                hooks: Box::new(NoopHooks),
            },
        );
        Self {
            nodes,
            root,
            next_auto_id: AUTO_ID_SEED,
        }
    }

    pub fn root(&self) -> ModuleId {
        self.root
    }

    pub fn contains(&self, id: ModuleId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Attaches a new module under `parent`. If `requested_id` is `Some`, it
    /// must be below [`AUTO_ID_SEED`] and not already in use; otherwise an id
    /// is auto-allocated. On `on_init` failure the link is undone and the id
    /// released back for reuse (auto-allocated ids are not reused).
    pub fn add_module(
        &mut self,
        parent: ModuleId,
        requested_id: Option<u64>,
        mut hooks: Box<dyn ModuleHooks>,
    ) -> Result<ModuleId> {
        if !self.nodes.contains_key(&parent) {
            return Err(CoreError::Handler(format!(
                "add_module: parent {parent} does not exist"
            )));
        }

        let id = match requested_id {
            | Some(raw) if raw < AUTO_ID_SEED => ModuleId(raw),
            | Some(raw) => {
                return Err(CoreError::Handler(format!(
                    "add_module: requested id {raw} is not below the \
                     user-reserved range"
                )));
            },
            | None => {
                let id = ModuleId(self.next_auto_id);
                self.next_auto_id += 1;
                id
            },
        };

        if self.nodes.contains_key(&id) {
            return Err(CoreError::Handler(format!(
                "add_module: id {id} already in use"
            )));
        }

        if let Err(e) = hooks.on_init() {
            return Err(e);
        }

        self.nodes.insert(
            id,
            ModuleNode {
                parent: Some(parent),
                children: Vec::new(),
                timers: Vec::new(),
                safe_timers: HashMap::new(),
                subscriptions: Vec::new(),
                hooks,
            },
        );
        self.nodes.get_mut(&parent).unwrap().children.push(id);
        Ok(id)
    }

    pub fn parent_of(&self, id: ModuleId) -> Option<ModuleId> {
        self.nodes.get(&id).and_then(|n| n.parent)
    }

    pub fn children_of(&self, id: ModuleId) -> &[ModuleId] {
        self.nodes
            .get(&id)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn track_timer(&mut self, module: ModuleId, timer: TimerId) {
        if let Some(node) = self.nodes.get_mut(&module) {
            node.timers.push(timer);
        }
    }

    pub fn untrack_timer(&mut self, module: ModuleId, timer: TimerId) {
        if let Some(node) = self.nodes.get_mut(&module) {
            node.timers.retain(|t| *t != timer);
        }
    }

    pub fn safe_timer_slot(&self, module: ModuleId, slot: u64) -> Option<TimerId> {
        self.nodes.get(&module)?.safe_timers.get(&slot).copied()
    }

    pub fn set_safe_timer_slot(&mut self, module: ModuleId, slot: u64, timer: TimerId) {
        if let Some(node) = self.nodes.get_mut(&module) {
            node.safe_timers.insert(slot, timer);
        }
    }

    pub fn track_subscription(&mut self, module: ModuleId, sub: SubscriptionId) {
        if let Some(node) = self.nodes.get_mut(&module) {
            node.subscriptions.push(sub);
        }
    }

    /// Recursively releases `id` and every descendant, deepest first.
    /// Returns the ids released, innermost-first, each paired with its
    /// collected timers and subscriptions so the caller (the timer
    /// dispatcher and event bus, which the arena does not own) can cancel
    /// them.
    pub fn release_module(
        &mut self,
        id: ModuleId,
    ) -> Result<Vec<(ModuleId, Vec<TimerId>, Vec<SubscriptionId>)>> {
        if id == self.root {
            return Err(CoreError::Handler(
                "release_module: cannot release the root module".into(),
            ));
        }
        let mut released = Vec::new();
        self.release_recursive(id, &mut released)?;
        Ok(released)
    }

    fn release_recursive(
        &mut self,
        id: ModuleId,
        out: &mut Vec<(ModuleId, Vec<TimerId>, Vec<SubscriptionId>)>,
    ) -> Result<()> {
        let children = self
            .nodes
            .get(&id)
            .map(|n| n.children.clone())
            .unwrap_or_default();
        for child in children {
            self.release_recursive(child, out)?;
        }

        let mut node = self
            .nodes
            .remove(&id)
            .ok_or_else(|| CoreError::Handler(format!("release_module: {id} not found")))?;
        node.hooks.on_release();

        if let Some(parent) = node.parent {
            if let Some(parent_node) = self.nodes.get_mut(&parent) {
                parent_node.children.retain(|c| *c != id);
            }
        }

        out.push((id, node.timers, node.subscriptions));
        Ok(())
    }

    pub fn descendant_count(&self) -> usize {
        self.nodes.len() - 1
    }
}

impl Default for ModuleTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_ids_start_at_seed() {
        let mut tree = ModuleTree::new();
        let a = tree
            .add_module(tree.root(), None, Box::new(NoopHooks))
            .unwrap();
        assert_eq!(a, ModuleId(AUTO_ID_SEED));
    }

    #[test]
    fn user_reserved_id_below_seed_is_accepted() {
        let mut tree = ModuleTree::new();
        let a = tree
            .add_module(tree.root(), Some(42), Box::new(NoopHooks))
            .unwrap();
        assert_eq!(a, ModuleId(42));
    }

    #[test]
    fn requested_id_at_or_above_seed_is_rejected() {
        let mut tree = ModuleTree::new();
        let err = tree
            .add_module(tree.root(), Some(AUTO_ID_SEED), Box::new(NoopHooks))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::CoreErrorKind::Handler);
    }

    #[test]
    fn release_cascades_depth_first_and_shrinks_descendant_count() {
        let mut tree = ModuleTree::new();
        let a = tree
            .add_module(tree.root(), Some(1), Box::new(NoopHooks))
            .unwrap();
        let _b = tree.add_module(a, Some(2), Box::new(NoopHooks)).unwrap();
        assert_eq!(tree.descendant_count(), 2);

        let released = tree.release_module(a).unwrap();
        assert_eq!(released.len(), 2);
        // b (the child) is released before a (the parent).
        assert_eq!(released[0].0, ModuleId(2));
        assert_eq!(released[1].0, ModuleId(1));
        assert_eq!(tree.descendant_count(), 0);
    }

    #[test]
    fn root_cannot_be_released() {
        let mut tree = ModuleTree::new();
        assert!(tree.release_module(tree.root()).is_err());
    }
}
