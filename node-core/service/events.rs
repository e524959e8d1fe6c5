use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::service::module::ModuleId;
use crate::service::tree::LoopHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Invoked on the owning service's loop when a subscribed event is published.
pub type EventCallback = Arc<dyn Fn(&LoopHandle, serde_json::Value) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    module: ModuleId,
    callback: EventCallback,
}

/// A posted event delivered on the service loop: same-process, same-service
/// publish/subscribe keyed by a free-form event-kind string.
pub struct EventDelivery {
    pub module: ModuleId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub callback: EventCallback,
}

/// Scoped to one service. Publishing never calls subscriber code directly —
/// it posts one [`EventDelivery`] per subscriber onto the owning service's
/// inbound queue, so delivery always happens on a loop turn.
pub struct EventBus {
    subscriptions: HashMap<String, Vec<Subscription>>,
    next_id: AtomicU64,
    outbound: mpsc::Sender<EventDelivery>,
}

impl EventBus {
    pub fn new(outbound: mpsc::Sender<EventDelivery>) -> Self {
        Self {
            subscriptions: HashMap::new(),
            next_id: AtomicU64::new(1),
            outbound,
        }
    }

    pub fn subscribe(
        &mut self,
        module: ModuleId,
        kind: impl Into<String>,
        callback: EventCallback,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.entry(kind.into()).or_default().push(Subscription {
            id,
            module,
            callback,
        });
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        for subs in self.subscriptions.values_mut() {
            subs.retain(|s| s.id != id);
        }
    }

    /// Drops every subscription belonging to `module`. Called by the owning
    /// service when it releases that module.
    pub fn unsubscribe_all(&mut self, ids: &[SubscriptionId]) {
        for id in ids {
            self.unsubscribe(*id);
        }
    }

    /// Enqueues one delivery per current subscriber of `kind`. Never blocks
    /// the publisher on a full queue beyond the bounded channel's capacity;
    /// a full queue here surfaces as a dropped event, matching the inbound
    /// queue's own back-pressure policy.
    pub fn publish(&self, kind: &str, payload: serde_json::Value) {
        let Some(subs) = self.subscriptions.get(kind) else {
            return;
        };
        for sub in subs {
            let delivery = EventDelivery {
                module: sub.module,
                kind: kind.to_owned(),
                payload: payload.clone(),
                callback: sub.callback.clone(),
            };
            if self.outbound.try_send(delivery).is_err() {
                tracing::warn!(kind, module = %sub.module, "dropped event: inbound queue full");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_callback() -> EventCallback {
        Arc::new(|_: &LoopHandle, _: serde_json::Value| {})
    }

    #[tokio::test]
    async fn publish_delivers_once_per_subscriber() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut bus = EventBus::new(tx);
        bus.subscribe(ModuleId(1), "trigger.fired", noop_callback());
        bus.subscribe(ModuleId(2), "trigger.fired", noop_callback());
        bus.publish("trigger.fired", serde_json::json!({"n": 1}));

        let mut seen = vec![];
        for _ in 0..2 {
            seen.push(rx.recv().await.unwrap().module);
        }
        seen.sort_by_key(|m| m.0);
        assert_eq!(seen, vec![ModuleId(1), ModuleId(2)]);
    }

    #[tokio::test]
    async fn unsubscribe_all_removes_every_subscription_for_a_module() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut bus = EventBus::new(tx);
        let a = bus.subscribe(ModuleId(1), "x", noop_callback());
        let b = bus.subscribe(ModuleId(1), "y", noop_callback());
        bus.unsubscribe_all(&[a, b]);
        bus.publish("x", serde_json::Value::Null);
        bus.publish("y", serde_json::Value::Null);
        drop(bus);
        assert!(rx.recv().await.is_none());
    }
}
