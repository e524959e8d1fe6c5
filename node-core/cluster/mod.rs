//! The cluster dispatcher: resolves a logical `service.Method` call to
//! either a local handler invocation or an outgoing RPC (spec.md §4.4).

pub mod admin;
pub mod client;
pub mod discovery;
pub mod routing;
pub mod view;

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;

pub use client::{RpcClient, RpcClientConfig};
pub use discovery::{DiscoverySource, StaticDiscovery};
pub use routing::{ConsistentHash, RoundRobin, RoutingPolicy, Weighted};
pub use server::RpcServer;
pub use view::{ClusterView, ClusterViewSnapshot, NodeInfo};

use crate::error::{CoreError, Result};
use crate::service::tree::{CallCallback, LoopHandle};

mod server;

/// Resolves `"Service.Method"` into `("Service", "Method")`. Neither half may
/// be empty; a target without a `.` or with an empty service/method is
/// malformed and resolves to `NoService`.
fn split_target(target: &str) -> Option<(&str, &str)> {
    let (service, method) = target.split_once('.')?;
    if service.is_empty() || method.is_empty() {
        return None;
    }
    Some((service, method))
}

/// The object-safe seam [`LoopHandle`] dispatches through. Kept separate
/// from [`Cluster`]'s concrete type so `service::tree` doesn't need to know
/// about RPC clients, discovery, or routing — only that *something* can
/// resolve a `service.Method` target.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn call(
        &self,
        caller: String,
        target: &str,
        args: serde_json::Value,
        timeout: Duration,
        allow_retiring: bool,
    ) -> Result<serde_json::Value>;

    fn async_call(
        &self,
        caller_handle: LoopHandle,
        caller: String,
        target: &str,
        args: serde_json::Value,
        timeout: Duration,
        callback: CallCallback,
    ) -> Result<()>;

    fn send(&self, caller: String, target: &str, args: serde_json::Value) -> Result<()>;
}

/// Aggregates the local node's identity and hosted services, the cluster
/// view, one [`RpcClient`] per remote node, and the local [`RpcServer`].
pub struct Cluster {
    node_id: u64,
    view: ClusterView,
    routing: Arc<dyn RoutingPolicy>,
    local: RwLock<HashMap<String, LoopHandle>>,
    clients: RwLock<HashMap<u64, Arc<RpcClient>>>,
    client_config: RpcClientConfig,
}

impl Cluster {
    pub fn new(node_id: u64, routing: Arc<dyn RoutingPolicy>) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            view: ClusterView::default(),
            routing,
            local: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            client_config: RpcClientConfig::default(),
        })
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    /// Attaches `handle` as this node's local hosting of `name` and wires it
    /// back to `self` so the service's `LoopHandle::call`/`async_call`/`send`
    /// resolve through this cluster. Call once per service, after `Init`.
    pub fn register_local(self: &Arc<Self>, name: impl Into<String>, handle: LoopHandle) {
        let name = name.into();
        handle.set_dispatch(Arc::downgrade(self) as Weak<dyn Dispatch>);
        self.local.write().unwrap().insert(name, handle);
    }

    /// Installs a new cluster view snapshot and spawns an [`RpcClient`] for
    /// any remote node not already known. Existing clients for nodes no
    /// longer present are left running (a node reappearing in a later
    /// snapshot reuses its client rather than reconnecting from scratch);
    /// the core has no notion of permanently removing a node, only of it
    /// being briefly unreachable, per spec.md's Non-goal on membership.
    pub fn set_view(self: &Arc<Self>, snapshot: ClusterViewSnapshot) {
        let mut clients = self.clients.write().unwrap();
        for (&node_id, info) in &snapshot.nodes {
            if node_id == self.node_id || clients.contains_key(&node_id) {
                continue;
            }
            let client = RpcClient::spawn(node_id, info.address.clone(), RpcClientConfig {
                call_timeout: self.client_config.call_timeout,
                reconnect_interval: self.client_config.reconnect_interval,
                sweep_interval: self.client_config.sweep_interval,
                max_checks_per_sweep: self.client_config.max_checks_per_sweep,
            });
            clients.insert(node_id, client);
        }
        drop(clients);
        self.view.swap(snapshot);
    }

    pub fn view_snapshot(&self) -> Arc<ClusterViewSnapshot> {
        self.view.snapshot()
    }

    /// Dispatches a request already resolved to be local — used by
    /// [`RpcServer`] when an inbound frame targets a service this node
    /// hosts, and internally for `Call`/`AsyncCall`/`Send` targets that
    /// resolve locally. `allow_retiring` is the caller's `AllowRetiring`
    /// opt-in; a service in the `Retiring` state rejects the request with
    /// `CoreError::Retiring` unless set.
    pub async fn dispatch_local(
        &self,
        target: &str,
        args: serde_json::Value,
        allow_retiring: bool,
    ) -> Result<serde_json::Value> {
        let (service, _method) = split_target(target).ok_or_else(|| CoreError::NoService(target.to_owned()))?;
        let handle = self
            .local
            .read()
            .unwrap()
            .get(service)
            .cloned()
            .ok_or_else(|| CoreError::NoService(target.to_owned()))?;

        let (tx, rx) = tokio::sync::oneshot::channel();
        handle.enqueue_request(target.to_owned(), args, Some(tx), allow_retiring)?;
        rx.await.map_err(|_| CoreError::Handler(format!("{target}: service dropped the request")))?
    }

    /// Resolves `target`'s service half to either "local" or a specific
    /// remote node id, applying the routing policy when more than one node
    /// hosts it. Returns `NoService`/`Disconnected`/`Retiring` per spec.md's
    /// §4.4 resolution table.
    fn resolve(&self, target: &str, allow_retiring: bool) -> Result<Resolution> {
        let (service, _method) = split_target(target).ok_or_else(|| CoreError::NoService(target.to_owned()))?;

        if self.local.read().unwrap().contains_key(service) {
            return Ok(Resolution::Local);
        }

        let snapshot = self.view.snapshot();
        let candidates = snapshot.locations.get(service).cloned().unwrap_or_default();
        if candidates.is_empty() {
            return Err(CoreError::NoService(target.to_owned()));
        }

        let node_id = if candidates.len() == 1 {
            candidates[0]
        } else {
            self.routing
                .pick(service, &candidates)
                .ok_or_else(|| CoreError::NoService(target.to_owned()))?
        };

        if !allow_retiring && snapshot.is_retiring(node_id, service) {
            return Err(CoreError::Retiring(service.to_owned()));
        }

        Ok(Resolution::Remote(node_id))
    }

    fn client_for(&self, node_id: u64) -> Result<Arc<RpcClient>> {
        self.clients
            .read()
            .unwrap()
            .get(&node_id)
            .cloned()
            .ok_or(CoreError::Disconnected(node_id))
    }
}

enum Resolution {
    Local,
    Remote(u64),
}

#[async_trait]
impl Dispatch for Cluster {
    async fn call(
        &self,
        _caller: String,
        target: &str,
        args: serde_json::Value,
        timeout: Duration,
        allow_retiring: bool,
    ) -> Result<serde_json::Value> {
        match self.resolve(target, allow_retiring)? {
            | Resolution::Local => self.dispatch_local(target, args, allow_retiring).await,
            | Resolution::Remote(node_id) => {
                let client = self.client_for(node_id)?;
                if !client.is_connected() {
                    return Err(CoreError::Disconnected(node_id));
                }
                tokio::time::timeout(timeout, client.call(target, args))
                    .await
                    .unwrap_or_else(|_| {
                        Err(CoreError::Timeout {
                            service_method: target.to_owned(),
                            elapsed: timeout,
                        })
                    })
            },
        }
    }

    fn async_call(
        &self,
        caller_handle: LoopHandle,
        _caller: String,
        target: &str,
        args: serde_json::Value,
        timeout: Duration,
        callback: CallCallback,
    ) -> Result<()> {
        match self.resolve(target, false)? {
            | Resolution::Local => {
                // Local dispatch has no network hop to time out against;
                // the target service's own queue back-pressure is the only
                // bound on how long this takes.
                let _ = timeout;
                let target_handle = self
                    .local
                    .read()
                    .unwrap()
                    .get(split_target(target).unwrap().0)
                    .cloned()
                    .ok_or_else(|| CoreError::NoService(target.to_owned()))?;

                let (tx, rx) = tokio::sync::oneshot::channel();
                target_handle.enqueue_request(target.to_owned(), args, Some(tx), false)?;

                let target = target.to_owned();
                tokio::spawn(async move {
                    let result = rx.await.unwrap_or_else(|_| {
                        Err(CoreError::Handler(format!("{target}: service dropped the request")))
                    });
                    if caller_handle.enqueue_call_completed(callback, result).is_err() {
                        tracing::warn!(service_method = %target, "dropped local async-call callback: caller gone");
                    }
                });
                Ok(())
            },
            | Resolution::Remote(node_id) => {
                let client = self.client_for(node_id)?;
                if !client.is_connected() {
                    return Err(CoreError::Disconnected(node_id));
                }
                client.async_call(caller_handle, target, args, timeout, callback)
            },
        }
    }

    fn send(&self, _caller: String, target: &str, args: serde_json::Value) -> Result<()> {
        match self.resolve(target, false)? {
            | Resolution::Local => {
                let target_handle = self
                    .local
                    .read()
                    .unwrap()
                    .get(split_target(target).unwrap().0)
                    .cloned()
                    .ok_or_else(|| CoreError::NoService(target.to_owned()))?;
                target_handle.enqueue_request(target.to_owned(), args, None, false)
            },
            | Resolution::Remote(node_id) => {
                let client = self.client_for(node_id)?;
                if !client.is_connected() {
                    return Err(CoreError::Disconnected(node_id));
                }
                let target = target.to_owned();
                tokio::spawn(async move {
                    let _ = client.send(&target, args).await;
                });
                Ok(())
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreErrorKind;
    use crate::service::tree::{Service, ServiceState};

    #[tokio::test]
    async fn retiring_local_service_rejects_calls_without_allow_retiring() {
        let (service, handle) = Service::new("Echo", 1);
        service.seal_handlers();
        handle.set_state(ServiceState::Running);
        handle.set_state(ServiceState::Retiring);

        let cluster = Cluster::new(1, Arc::new(RoundRobin::default()));
        cluster.register_local("Echo", handle);
        tokio::spawn(service.run());

        let err = cluster
            .dispatch_local("Echo.Ping", serde_json::Value::Null, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), CoreErrorKind::Retiring);
    }

    #[tokio::test]
    async fn retiring_local_service_still_serves_callers_who_opt_in() {
        let (service, handle) = Service::new("Echo", 1);
        service.register(
            "Echo.Ping",
            Arc::new(|_handle, _args: serde_json::Value| async move { Ok(serde_json::Value::Null) }),
            false,
        );
        service.seal_handlers();
        handle.set_state(ServiceState::Running);
        handle.set_state(ServiceState::Retiring);

        let cluster = Cluster::new(1, Arc::new(RoundRobin::default()));
        cluster.register_local("Echo", handle);
        tokio::spawn(service.run());

        cluster
            .dispatch_local("Echo.Ping", serde_json::Value::Null, true)
            .await
            .unwrap();
    }
}
