use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::cluster::Dispatch;
use crate::error::{CoreError, Result};
use crate::service::events::{EventBus, EventCallback, EventDelivery};
use crate::service::handler::HandlerTable;
use crate::service::module::{ModuleHooks, ModuleId, ModuleTree};
use crate::service::timer::{TimerCallback, TimerDispatcher, TimerId};
use crate::service::worker::WorkerPool;

/// A callback registered by `async_call`, run on the caller's loop once the
/// reply (or a terminal error) arrives. Never runs on the RPC read path.
pub type CallCallback = Box<dyn FnOnce(&LoopHandle, Result<serde_json::Value>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Installed,
    Initialized,
    Running,
    Retiring,
    Stopped,
}

impl ServiceState {
    fn to_u8(self) -> u8 {
        match self {
            | ServiceState::Installed => 0,
            | ServiceState::Initialized => 1,
            | ServiceState::Running => 2,
            | ServiceState::Retiring => 3,
            | ServiceState::Stopped => 4,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            | 0 => ServiceState::Installed,
            | 1 => ServiceState::Initialized,
            | 2 => ServiceState::Running,
            | 3 => ServiceState::Retiring,
            | _ => ServiceState::Stopped,
        }
    }
}

pub(crate) enum InboundItem {
    Request {
        method: String,
        args: serde_json::Value,
        responder: Option<oneshot::Sender<Result<serde_json::Value>>>,
    },
    CallCompleted {
        callback: CallCallback,
        result: Result<serde_json::Value>,
    },
    TimerFired {
        id: TimerId,
        callback: TimerCallback,
    },
    Event(EventDelivery),
    Task(Box<dyn FnOnce(&LoopHandle) + Send>),
}

struct LoopInner {
    name: String,
    type_id: u32,
    state: AtomicU8,
    inbound_tx: mpsc::Sender<InboundItem>,
    tree: Mutex<ModuleTree>,
    timers: Mutex<TimerDispatcher>,
    events: Mutex<EventBus>,
    handlers: RwLock<HandlerTable>,
    dispatch: RwLock<Option<std::sync::Weak<dyn Dispatch>>>,
    worker: WorkerPool,
}

/// A cheap, `Clone`-able capability handle passed to handlers and held by
/// modules. All mutation of the module tree, timers, and event bus happens
/// through this type's methods rather than direct field access, since they
/// are shared with the loop task via `Arc`.
#[derive(Clone)]
pub struct LoopHandle {
    inner: Arc<LoopInner>,
}

impl LoopHandle {
    pub fn service_name(&self) -> &str {
        &self.inner.name
    }

    pub fn type_id(&self) -> u32 {
        self.inner.type_id
    }

    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ServiceState) {
        self.inner.state.store(state.to_u8(), Ordering::Release);
    }

    pub(crate) fn set_dispatch(&self, dispatch: std::sync::Weak<dyn Dispatch>) {
        *self.inner.dispatch.write().unwrap() = Some(dispatch);
    }

    fn dispatch(&self) -> Result<Arc<dyn Dispatch>> {
        self.inner
            .dispatch
            .read()
            .unwrap()
            .as_ref()
            .and_then(|w| w.upgrade())
            .ok_or_else(|| CoreError::Fatal(anyhow::anyhow!("cluster not attached")))
    }

    pub fn root(&self) -> ModuleId {
        self.inner.tree.lock().unwrap().root()
    }

    pub fn add_module(
        &self,
        parent: ModuleId,
        requested_id: Option<u64>,
        hooks: Box<dyn ModuleHooks>,
    ) -> Result<ModuleId> {
        self.inner
            .tree
            .lock()
            .unwrap()
            .add_module(parent, requested_id, hooks)
    }

    /// Cancels every timer and subscription owned by `id` and its
    /// descendants (deepest first), then detaches them from the tree.
    pub fn release_module(&self, id: ModuleId) -> Result<()> {
        let released = self.inner.tree.lock().unwrap().release_module(id)?;
        let mut timers = self.inner.timers.lock().unwrap();
        let mut events = self.inner.events.lock().unwrap();
        for (_, timer_ids, sub_ids) in released {
            timers.cancel_all(&timer_ids);
            events.unsubscribe_all(&sub_ids);
        }
        Ok(())
    }

    pub fn after(&self, module: ModuleId, delay: Duration, callback: TimerCallback) -> TimerId {
        let id = self.inner.timers.lock().unwrap().after(module, delay, callback);
        self.inner.tree.lock().unwrap().track_timer(module, id);
        id
    }

    pub fn ticker(&self, module: ModuleId, period: Duration, callback: TimerCallback) -> TimerId {
        let id = self.inner.timers.lock().unwrap().ticker(module, period, callback);
        self.inner.tree.lock().unwrap().track_timer(module, id);
        id
    }

    pub fn cron(
        &self,
        module: ModuleId,
        schedule: cron::Schedule,
        callback: TimerCallback,
    ) -> Result<TimerId> {
        let id = self.inner.timers.lock().unwrap().cron(module, schedule, callback)?;
        self.inner.tree.lock().unwrap().track_timer(module, id);
        Ok(id)
    }

    pub fn cancel_timer(&self, module: ModuleId, id: TimerId) {
        self.inner.timers.lock().unwrap().cancel(id);
        self.inner.tree.lock().unwrap().untrack_timer(module, id);
    }

    /// Re-issuing `slot` cancels whatever timer previously held that slot
    /// before arming the new one, so handler code can call this
    /// unconditionally (e.g. on every config reload) without leaking timers.
    pub fn safe_after(
        &self,
        module: ModuleId,
        slot: u64,
        delay: Duration,
        callback: TimerCallback,
    ) -> TimerId {
        self.replace_safe_slot(module, slot);
        let id = self.after(module, delay, callback);
        self.inner.tree.lock().unwrap().set_safe_timer_slot(module, slot, id);
        id
    }

    pub fn safe_ticker(
        &self,
        module: ModuleId,
        slot: u64,
        period: Duration,
        callback: TimerCallback,
    ) -> TimerId {
        self.replace_safe_slot(module, slot);
        let id = self.ticker(module, period, callback);
        self.inner.tree.lock().unwrap().set_safe_timer_slot(module, slot, id);
        id
    }

    pub fn safe_cron(
        &self,
        module: ModuleId,
        slot: u64,
        schedule: cron::Schedule,
        callback: TimerCallback,
    ) -> Result<TimerId> {
        self.replace_safe_slot(module, slot);
        let id = self.cron(module, schedule, callback)?;
        self.inner.tree.lock().unwrap().set_safe_timer_slot(module, slot, id);
        Ok(id)
    }

    fn replace_safe_slot(&self, module: ModuleId, slot: u64) {
        let existing = self.inner.tree.lock().unwrap().safe_timer_slot(module, slot);
        if let Some(id) = existing {
            self.cancel_timer(module, id);
        }
    }

    pub fn subscribe(
        &self,
        module: ModuleId,
        kind: impl Into<String>,
        callback: EventCallback,
    ) -> crate::service::events::SubscriptionId {
        let id = self.inner.events.lock().unwrap().subscribe(module, kind, callback);
        self.inner.tree.lock().unwrap().track_subscription(module, id);
        id
    }

    pub fn publish(&self, kind: &str, payload: serde_json::Value) {
        self.inner.events.lock().unwrap().publish(kind, payload);
    }

    pub fn worker(&self) -> &WorkerPool {
        &self.inner.worker
    }

    /// Runs `f` on the blocking thread pool and posts its result back onto
    /// this service's own loop as a completed task, so handler code never
    /// needs its own channel plumbing to get a blocking result back onto the
    /// loop it came from. A worker that outlives its service (queue
    /// overloaded or already stopped by the time it finishes) just drops its
    /// result; a panic inside `f` is logged and otherwise swallowed, the
    /// same way a handler panic is.
    pub fn spawn_worker<T, F, C>(&self, f: F, on_done: C)
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
        C: FnOnce(&LoopHandle, T) + Send + 'static,
    {
        let handle = self.clone();
        let join = self.inner.worker.spawn(f);
        tokio::spawn(async move {
            match join.await {
                | Ok(result) => {
                    if handle.post(move |h| on_done(h, result)).is_err() {
                        tracing::debug!(service = handle.service_name(), "dropped worker result: service loop gone");
                    }
                },
                | Err(e) => {
                    tracing::warn!(service = handle.service_name(), error = %e, "worker task panicked or was cancelled");
                },
            }
        });
    }

    /// Posts a closure onto this service's own inbound queue — the only
    /// safe way to touch this service's state from outside its loop.
    pub fn post(&self, task: impl FnOnce(&LoopHandle) + Send + 'static) -> Result<()> {
        self.inner
            .inbound_tx
            .try_send(InboundItem::Task(Box::new(task)))
            .map_err(|_| CoreError::Overloaded(self.inner.name.clone()))
    }

    /// Blocking-style call: waits for the reply. Legal from outside the
    /// loop (external threads, or a worker spawned via [`WorkerPool`]) —
    /// calling this from inside a handler risks self-deadlock if `target`
    /// can resolve back to this same service.
    pub async fn call(
        &self,
        target: &str,
        args: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        self.dispatch()?
            .call(self.inner.name.clone(), target, args, timeout, false)
            .await
    }

    /// Non-blocking call: fires the request and returns immediately;
    /// `callback` runs on this service's loop once the reply, or a terminal
    /// error, arrives. Safe to call from inside a handler.
    pub fn async_call(
        &self,
        target: &str,
        args: serde_json::Value,
        timeout: Duration,
        callback: CallCallback,
    ) -> Result<()> {
        self.dispatch()?.async_call(
            self.clone(),
            self.inner.name.clone(),
            target,
            args,
            timeout,
            callback,
        )
    }

    /// One-way call: bypasses the pending registry, returns as soon as the
    /// request is enqueued/written.
    pub fn send(&self, target: &str, args: serde_json::Value) -> Result<()> {
        self.dispatch()?.send(self.inner.name.clone(), target, args)
    }

    /// Enqueues a request destined for this handle's own service, the way a
    /// local call or an inbound RPC arrives. Safe from any thread: the queue
    /// is the only thing mutated and it is already shared via `Arc`. Used by
    /// [`crate::cluster`] for the local half of dispatch, since a `Service`'s
    /// receiver is consumed by its running loop task and cannot be reached
    /// from there directly.
    ///
    /// `allow_retiring` mirrors the caller's `AllowRetiring` opt-in on
    /// [`crate::cluster::Dispatch::call`]: a service in the `Retiring` state
    /// still drains its queue, but a new request is rejected with
    /// `CoreError::Retiring` unless the caller explicitly opted in.
    pub(crate) fn enqueue_request(
        &self,
        method: String,
        args: serde_json::Value,
        responder: Option<oneshot::Sender<Result<serde_json::Value>>>,
        allow_retiring: bool,
    ) -> Result<()> {
        match self.state() {
            | ServiceState::Stopped => {
                return Err(CoreError::Handler(format!(
                    "service {} is stopped",
                    self.service_name()
                )));
            },
            | ServiceState::Retiring if !allow_retiring => {
                return Err(CoreError::Retiring(self.service_name().to_owned()));
            },
            | _ => {},
        }
        self.inner
            .inbound_tx
            .try_send(InboundItem::Request { method, args, responder })
            .map_err(|_| CoreError::Overloaded(self.service_name().to_owned()))
    }

    /// Posts a completed async-call callback onto this handle's own service
    /// loop. Called by [`crate::cluster`]'s RPC client read path and timeout
    /// sweeper so that user callback code always runs on the caller's loop,
    /// never on the network task.
    pub(crate) fn enqueue_call_completed(
        &self,
        callback: CallCallback,
        result: Result<serde_json::Value>,
    ) -> Result<()> {
        self.inner
            .inbound_tx
            .try_send(InboundItem::CallCompleted { callback, result })
            .map_err(|_| CoreError::Overloaded(self.service_name().to_owned()))
    }
}

/// The execution tree rooted at one service: its inbound queue, module
/// arena, timer dispatcher, event bus, and handler table, plus the loop
/// that drains them. Constructed by [`Service::new`]; run with
/// [`Service::run`] after `Init` registers handlers and seals the table.
pub struct Service {
    handle: LoopHandle,
    inbound_rx: mpsc::Receiver<InboundItem>,
    events_rx: mpsc::Receiver<EventDelivery>,
}

impl Service {
    pub fn new(name: impl Into<String>, type_id: u32) -> (Self, LoopHandle) {
        let name = name.into();
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let (events_tx, events_rx) = mpsc::channel(1024);

        let inner = Arc::new(LoopInner {
            worker: WorkerPool::new(name.clone()),
            name,
            type_id,
            state: AtomicU8::new(ServiceState::Installed.to_u8()),
            inbound_tx,
            tree: Mutex::new(ModuleTree::new()),
            timers: Mutex::new(TimerDispatcher::new()),
            events: Mutex::new(EventBus::new(events_tx)),
            handlers: RwLock::new(HandlerTable::new()),
            dispatch: RwLock::new(None),
        });
        let handle = LoopHandle { inner };
        (
            Service {
                handle: handle.clone(),
                inbound_rx,
                events_rx,
            },
            handle,
        )
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    /// Registers a handler. Only legal before [`Service::seal_handlers`].
    pub fn register(
        &self,
        method: impl Into<String>,
        handler: Arc<dyn crate::service::handler::Handler>,
        no_reply: bool,
    ) {
        self.handle.inner.handlers.write().unwrap().register(method, handler, no_reply);
    }

    pub fn seal_handlers(&self) {
        self.handle.inner.handlers.write().unwrap().seal();
        self.handle.set_state(ServiceState::Initialized);
    }

    /// Enqueues an inbound request destined for this service's handler
    /// table. Used by the cluster dispatcher for both local hand-off and
    /// requests arriving over RPC.
    pub fn enqueue_request(
        &self,
        method: String,
        args: serde_json::Value,
        responder: Option<oneshot::Sender<Result<serde_json::Value>>>,
        allow_retiring: bool,
    ) -> Result<()> {
        self.handle.enqueue_request(method, args, responder, allow_retiring)
    }

    pub(crate) fn enqueue_call_completed(
        &self,
        callback: CallCallback,
        result: Result<serde_json::Value>,
    ) -> Result<()> {
        self.handle.enqueue_call_completed(callback, result)
    }

    /// Runs the service loop until the inbound channel is closed (i.e. the
    /// last `LoopHandle`/sender is dropped) or a `Stop` task requests exit.
    /// Drains strictly in arrival order; a timer firing that becomes due
    /// while other items are queued is delivered after those already
    /// waiting, preserving §5's queue-order guarantee.
    pub async fn run(mut self) {
        self.handle.set_state(ServiceState::Running);
        tracing::info!(service = self.handle.service_name(), "service loop started");

        loop {
            let deadline = self.handle.inner.timers.lock().unwrap().next_deadline();
            let sleep = sleep_until_opt(deadline);

            tokio::select! {
                biased;

                item = self.inbound_rx.recv() => {
                    match item {
                        Some(item) => self.handle_item(item).await,
                        None => break,
                    }
                }

                delivery = self.events_rx.recv() => {
                    if let Some(delivery) = delivery {
                        self.handle_item(InboundItem::Event(delivery)).await;
                    }
                }

                _ = sleep => {
                    let fired = {
                        let mut timers = self.handle.inner.timers.lock().unwrap();
                        timers.pop_due(Instant::now())
                    };
                    for firing in fired {
                        self.handle_item(InboundItem::TimerFired {
                            id: firing.id,
                            callback: firing.callback,
                        })
                        .await;
                    }
                }
            }

            if self.handle.state() == ServiceState::Stopped {
                break;
            }
        }

        tracing::info!(service = self.handle.service_name(), "service loop stopped");
    }

    async fn handle_item(&self, item: InboundItem) {
        match item {
            | InboundItem::Request { method, args, responder } => {
                self.dispatch_request(method, args, responder).await;
            },
            | InboundItem::CallCompleted { callback, result } => {
                callback(&self.handle, result);
            },
            | InboundItem::TimerFired { callback, .. } => {
                callback(&self.handle);
            },
            | InboundItem::Event(delivery) => {
                (delivery.callback)(&self.handle, delivery.payload);
            },
            | InboundItem::Task(task) => {
                task(&self.handle);
            },
        }
    }

    async fn dispatch_request(
        &self,
        method: String,
        args: serde_json::Value,
        responder: Option<oneshot::Sender<Result<serde_json::Value>>>,
    ) {
        let handler = { self.handle.inner.handlers.read().unwrap().get(&method) };
        let result = match handler {
            | Ok(handler) => {
                let outcome =
                    std::panic::AssertUnwindSafe(handler.call(&self.handle, args)).catch_unwind().await;
                match outcome {
                    | Ok(result) => result,
                    | Err(panic) => {
                        let message = panic_message(&panic);
                        tracing::error!(method, message, "handler panicked");
                        Err(CoreError::Panic(message))
                    },
                }
            },
            | Err(e) => Err(e),
        };
        if let Some(responder) = responder {
            let _ = responder.send(result);
        }
    }

    /// Transitions Running to Retiring: in-flight work completes, new
    /// external requests are refused by the cluster dispatcher, but the
    /// loop itself keeps draining (including timers already armed).
    pub fn retire(&self) {
        self.handle.set_state(ServiceState::Retiring);
    }

    /// Stops the loop after the current item (called from within the loop
    /// via a posted task, e.g. from an administrative RPC handler).
    pub fn stop(&self) {
        self.handle.set_state(ServiceState::Stopped);
    }
}

fn sleep_until_opt(deadline: Option<Instant>) -> tokio::time::Sleep {
    match deadline {
        | Some(instant) => tokio::time::sleep_until(instant),
        | None => tokio::time::sleep(Duration::from_secs(3600)),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHooks;
    impl ModuleHooks for NoopHooks {}

    #[tokio::test]
    async fn local_request_without_a_registered_handler_errors() {
        let (service, handle) = Service::new("Math", 1);
        service.seal_handlers();
        tokio::spawn(service.run());

        let (tx, rx) = oneshot::channel();
        handle
            .inner
            .inbound_tx
            .send(InboundItem::Request {
                method: "Math.Missing".into(),
                args: serde_json::Value::Null,
                responder: Some(tx),
            })
            .await
            .unwrap();
        let result = rx.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn registered_handler_echoes_its_argument() {
        use async_trait::async_trait;

        struct Echo;
        #[async_trait]
        impl crate::service::handler::Handler for Echo {
            async fn call(
                &self,
                _ctx: &LoopHandle,
                args: serde_json::Value,
            ) -> Result<serde_json::Value> {
                Ok(args)
            }
        }

        let (service, handle) = Service::new("Math", 1);
        service.register("Math.Echo", Arc::new(Echo), false);
        service.seal_handlers();
        tokio::spawn(service.run());

        let (tx, rx) = oneshot::channel();
        handle
            .inner
            .inbound_tx
            .send(InboundItem::Request {
                method: "Math.Echo".into(),
                args: serde_json::json!(42),
                responder: Some(tx),
            })
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap().unwrap(), serde_json::json!(42));
    }

    #[tokio::test]
    async fn release_module_cancels_its_timers() {
        let (service, handle) = Service::new("Math", 1);
        service.seal_handlers();

        let module = handle.add_module(handle.root(), Some(1), Box::new(NoopHooks)).unwrap();
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired2 = fired.clone();
        handle.after(
            module,
            Duration::from_millis(0),
            Arc::new(move |_| {
                fired2.store(true, Ordering::SeqCst);
            }),
        );
        handle.release_module(module).unwrap();

        tokio::spawn(service.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn spawn_worker_posts_its_result_back_onto_the_loop() {
        let (service, handle) = Service::new("Math", 1);

        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));

        handle.spawn_worker(
            || 2 + 2,
            move |_h, result: i32| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(result);
                }
            },
        );

        service.seal_handlers();
        tokio::spawn(service.run());

        assert_eq!(rx.await.unwrap(), 4);
    }
}
