use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use crate::error::{CoreError, Result};
use crate::service::module::ModuleId;
use crate::service::tree::LoopHandle;

/// Invoked on the owning service's loop when a timer fires.
pub type TimerCallback = Arc<dyn Fn(&LoopHandle) + Send + Sync>;

/// `moduleId << 32 | seq`: the high bits make the owning module recoverable
/// from the id alone, the low bits are a per-module monotonic counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

impl TimerId {
    pub fn new(module: ModuleId, seq: u32) -> Self {
        TimerId((module.0 << 32) | seq as u64)
    }

    pub fn module(self) -> ModuleId {
        ModuleId(self.0 >> 32)
    }
}

impl std::fmt::Display for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone)]
pub enum TimerKind {
    After,
    Ticker(Duration),
    Cron(std::sync::Arc<cron::Schedule>),
}

struct TimerEntry {
    module: ModuleId,
    kind: TimerKind,
    callback: TimerCallback,
    cancelled: bool,
}

#[derive(Eq, PartialEq)]
struct HeapEntry {
    fire_at: Instant,
    id: TimerId,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fire_at.cmp(&other.fire_at).then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A timer firing, ready for the owning service loop to deliver.
pub struct TimerFiring {
    pub id: TimerId,
    pub module: ModuleId,
    pub callback: TimerCallback,
}

/// Min-heap keyed on next-fire time, scoped to one service. `Ticker` and
/// `Cron` timers are re-armed on pop; `After` timers are one-shot and
/// dropped from `entries` once fired.
pub struct TimerDispatcher {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    entries: HashMap<TimerId, TimerEntry>,
    next_seq: HashMap<ModuleId, u32>,
}

impl TimerDispatcher {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            next_seq: HashMap::new(),
        }
    }

    fn alloc_id(&mut self, module: ModuleId) -> TimerId {
        let seq = self.next_seq.entry(module).or_insert(0);
        let id = TimerId::new(module, *seq);
        *seq += 1;
        id
    }

    pub fn after(&mut self, module: ModuleId, delay: Duration, callback: TimerCallback) -> TimerId {
        let id = self.alloc_id(module);
        self.arm(id, module, TimerKind::After, Instant::now() + delay, callback);
        id
    }

    pub fn ticker(&mut self, module: ModuleId, period: Duration, callback: TimerCallback) -> TimerId {
        let id = self.alloc_id(module);
        self.arm(
            id,
            module,
            TimerKind::Ticker(period),
            Instant::now() + period,
            callback,
        );
        id
    }

    pub fn cron(
        &mut self,
        module: ModuleId,
        schedule: cron::Schedule,
        callback: TimerCallback,
    ) -> Result<TimerId> {
        let schedule = Arc::new(schedule);
        let next = next_cron_instant(&schedule)
            .ok_or_else(|| CoreError::Handler("cron schedule has no future occurrence".into()))?;
        let id = self.alloc_id(module);
        self.arm(id, module, TimerKind::Cron(schedule), next, callback);
        Ok(id)
    }

    fn arm(
        &mut self,
        id: TimerId,
        module: ModuleId,
        kind: TimerKind,
        fire_at: Instant,
        callback: TimerCallback,
    ) {
        self.entries.insert(
            id,
            TimerEntry {
                module,
                kind,
                callback,
                cancelled: false,
            },
        );
        self.heap.push(Reverse(HeapEntry { fire_at, id }));
    }

    /// Idempotent: cancelling an already-cancelled or unknown id is a no-op.
    pub fn cancel(&mut self, id: TimerId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.cancelled = true;
        }
        self.entries.remove(&id);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(e)| e.fire_at)
    }

    /// Pops every timer whose deadline has passed, re-arming periodic kinds.
    /// A firing is suppressed (not returned) if the timer was cancelled
    /// after being scheduled but before this pop.
    pub fn pop_due(&mut self, now: Instant) -> Vec<TimerFiring> {
        let mut fired = Vec::new();
        while let Some(Reverse(top)) = self.heap.peek() {
            if top.fire_at > now {
                break;
            }
            let Reverse(entry) = self.heap.pop().unwrap();

            let Some(meta) = self.entries.get(&entry.id) else {
                continue;
            };
            if meta.cancelled {
                self.entries.remove(&entry.id);
                continue;
            }

            let module = meta.module;
            match &meta.kind {
                | TimerKind::After => {
                    self.entries.remove(&entry.id);
                },
                | TimerKind::Ticker(period) => {
                    let period = *period;
                    self.heap.push(Reverse(HeapEntry {
                        fire_at: entry.fire_at + period,
                        id: entry.id,
                    }));
                },
                | TimerKind::Cron(schedule) => {
                    if let Some(next) = next_cron_instant(schedule) {
                        self.heap.push(Reverse(HeapEntry {
                            fire_at: next,
                            id: entry.id,
                        }));
                    } else {
                        self.entries.remove(&entry.id);
                    }
                },
            }

            fired.push(TimerFiring {
                id: entry.id,
                module,
                callback: meta.callback.clone(),
            });
        }
        fired
    }

    pub fn cancel_all(&mut self, ids: &[TimerId]) {
        for id in ids {
            self.cancel(*id);
        }
    }
}

impl Default for TimerDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn next_cron_instant(schedule: &cron::Schedule) -> Option<Instant> {
    let next_utc = schedule.upcoming(Utc).next()?;
    let delta = next_utc.signed_duration_since(Utc::now());
    let delta = delta.to_std().unwrap_or(Duration::ZERO);
    Some(Instant::now() + delta)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_callback() -> TimerCallback {
        Arc::new(|_: &LoopHandle| {})
    }

    #[test]
    fn after_fires_once_past_its_deadline() {
        let mut dispatcher = TimerDispatcher::new();
        let module = ModuleId(1);
        let id = dispatcher.after(module, Duration::from_millis(0), noop_callback());
        let fired = dispatcher.pop_due(Instant::now());
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].id, id);
        // Gone: a second pop finds nothing.
        assert!(dispatcher.pop_due(Instant::now()).is_empty());
    }

    #[test]
    fn ticker_rearms_after_firing() {
        let mut dispatcher = TimerDispatcher::new();
        let module = ModuleId(1);
        let id = dispatcher.ticker(module, Duration::from_millis(1), noop_callback());
        std::thread::sleep(Duration::from_millis(5));
        let fired = dispatcher.pop_due(Instant::now());
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].id, id);
        assert!(dispatcher.next_deadline().is_some());
    }

    #[test]
    fn cancelled_timer_never_fires_even_if_already_due() {
        let mut dispatcher = TimerDispatcher::new();
        let module = ModuleId(1);
        let id = dispatcher.after(module, Duration::from_millis(0), noop_callback());
        dispatcher.cancel(id);
        assert!(dispatcher.pop_due(Instant::now()).is_empty());
    }

    #[test]
    fn id_encodes_owning_module() {
        let module = ModuleId(7);
        let mut dispatcher = TimerDispatcher::new();
        let id = dispatcher.after(module, Duration::from_secs(10), noop_callback());
        assert_eq!(id.module(), module);
    }
}
