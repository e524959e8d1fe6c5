//! Node bootstrap: Setup/Init/Start/Stop, grounded on the sampled source's
//! `node/node.go` and `service/servicemgr.go`. A `Node` owns the process's
//! [`Cluster`], its [`NodeAdmin`] handle, and the ordered list of services it
//! was configured to host; `Setup` records what to build, `Init` builds it,
//! `Start` runs it, `Stop` tears it down in reverse.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::cluster::admin::NodeAdmin;
use crate::cluster::{Cluster, DiscoverySource, NodeInfo, RoundRobin, RpcServer, StaticDiscovery};
use crate::config::ConfigLoader;
use crate::error::{CoreError, Result};
use crate::service::{Service, ServiceContext};
use crate::shutdown::Shutdown;

/// Registers a service's handlers and module tree against its freshly
/// created [`Service`], the way the sampled source's `IService.Init` wires
/// up a service before `OnInit` runs. Boxed so `Node::setup` can collect a
/// heterogeneous list of them in declared order.
pub type ServiceFactory = Box<dyn FnOnce(&Service, &ServiceContext) + Send>;

struct PendingService {
    name: String,
    type_id: u32,
    factory: ServiceFactory,
}

/// Owns one node's identity, cluster dispatcher, and hosted services.
/// Construct with [`Node::new`], call [`Node::setup`] once per hosted
/// service in the order they should install, then [`Node::init`] and
/// [`Node::start`].
pub struct Node {
    node_id: u64,
    config_loader: Arc<ConfigLoader>,
    shutdown: Shutdown,
    pending: Vec<PendingService>,
    built: Vec<Service>,
    cluster: Arc<Cluster>,
    admin: Arc<NodeAdmin>,
    run_handles: Vec<JoinHandle<()>>,
}

impl Node {
    pub fn new(config_loader: Arc<ConfigLoader>) -> Result<Self> {
        let config = config_loader
            .load()
            .map_err(|e| CoreError::Fatal(anyhow::anyhow!("loading config: {e}")))?;
        let node_id = config.main.node_id;
        Ok(Self {
            node_id,
            config_loader,
            shutdown: Shutdown::default(),
            pending: Vec::new(),
            built: Vec::new(),
            cluster: Cluster::new(node_id, Arc::new(RoundRobin::default())),
            admin: Arc::new(NodeAdmin::new(node_id)),
            run_handles: Vec::new(),
        })
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn cluster(&self) -> Arc<Cluster> {
        Arc::clone(&self.cluster)
    }

    pub fn admin(&self) -> Arc<NodeAdmin> {
        Arc::clone(&self.admin)
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Records a service for installation. Mirrors the sampled source's
    /// `service.Setup`: order matters, since `Init`/`Start` walk this list
    /// forward and `Stop` walks it backward.
    pub fn setup(&mut self, name: impl Into<String>, type_id: u32, factory: ServiceFactory) {
        self.pending.push(PendingService {
            name: name.into(),
            type_id,
            factory,
        });
    }

    /// Builds every pending service: creates its execution tree, runs its
    /// factory to register handlers and modules, seals the handler table,
    /// registers it with the cluster, and tracks its loop handle with
    /// [`NodeAdmin`]. Corresponds to `node.initNode`'s service-install loop
    /// plus `service.Init`. Also installs the initial cluster view from the
    /// configured static peer list.
    pub async fn init(&mut self) -> Result<()> {
        let config = self
            .config_loader
            .load()
            .map_err(|e| CoreError::Fatal(anyhow::anyhow!("loading config: {e}")))?;

        let peers: Vec<NodeInfo> = config
            .main
            .peers
            .iter()
            .map(|(&node_id, addr)| NodeInfo {
                node_id,
                address: addr.clone(),
                services: Vec::new(),
                type_ids: std::collections::HashMap::new(),
            })
            .collect();
        let snapshot = StaticDiscovery::new(peers).snapshot().await?;
        self.cluster.set_view(snapshot);

        for pending in std::mem::take(&mut self.pending) {
            let ctx = ServiceContext::new(
                pending.name.clone(),
                Arc::clone(&self.config_loader),
                self.shutdown.clone(),
            );
            let (service, handle) = Service::new(pending.name.clone(), pending.type_id);
            (pending.factory)(&service, &ctx);
            service.seal_handlers();

            self.cluster.register_local(pending.name.clone(), handle.clone());
            self.admin.track(handle);
            self.built.push(service);
        }

        self.install_admin_service();

        Ok(())
    }

    /// Installs the `NodeAdmin` pseudo-service: a local-only handler for
    /// `Retire`/`Resume`/`Describe`, reachable over the same RPC transport
    /// as any other service but never published in the cluster view, so no
    /// remote node can route to it (spec.md Design Note (iii)).
    fn install_admin_service(&mut self) {
        let (service, handle) = Service::new("NodeAdmin", 0);

        let admin = Arc::clone(&self.admin);
        service.register(
            "NodeAdmin.Retire",
            Arc::new(move |_ctx: crate::service::tree::LoopHandle, _args: serde_json::Value| {
                let admin = Arc::clone(&admin);
                async move {
                    admin.retire();
                    Ok(serde_json::Value::Null)
                }
            }),
            false,
        );

        let admin = Arc::clone(&self.admin);
        service.register(
            "NodeAdmin.Resume",
            Arc::new(move |_ctx: crate::service::tree::LoopHandle, _args: serde_json::Value| {
                let admin = Arc::clone(&admin);
                async move {
                    admin.resume();
                    Ok(serde_json::Value::Null)
                }
            }),
            false,
        );

        let admin = Arc::clone(&self.admin);
        service.register(
            "NodeAdmin.Describe",
            Arc::new(move |_ctx: crate::service::tree::LoopHandle, _args: serde_json::Value| {
                let admin = Arc::clone(&admin);
                async move {
                    serde_json::to_value(admin.describe())
                        .map_err(|e| CoreError::Handler(e.to_string()))
                }
            }),
            false,
        );

        service.seal_handlers();
        self.cluster.register_local("NodeAdmin", handle.clone());
        self.admin.track(handle);
        self.built.push(service);
    }

    /// Spawns every installed service's run loop plus the RPC server.
    /// Corresponds to `service.Start`.
    pub fn start(&mut self, rpc_addr: SocketAddr) {
        for service in self.built.drain(..) {
            self.run_handles.push(tokio::spawn(service.run()));
        }

        let server = Arc::new(RpcServer::new());
        let cluster = Arc::clone(&self.cluster);
        tokio::spawn(async move {
            if let Err(e) = server.serve(rpc_addr, cluster).await {
                tracing::error!(error = %e, "rpc server exited");
            }
        });
    }

    /// Retires every service (stops accepting new work, finishes what's
    /// in flight) without tearing down the process. Reachable via the
    /// admin RPC surface or the process's retire signal handler.
    pub fn retire(&self) {
        self.admin.retire();
    }

    /// Stops every service in reverse install order and broadcasts
    /// shutdown to anything awaiting it, then waits for every loop task to
    /// actually exit. Corresponds to `service.StopAllService`.
    pub async fn stop(&mut self) {
        self.admin.stop_all();
        self.shutdown.broadcast_shutdown();
        for handle in self.run_handles.drain(..) {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_with_no_pending_services_still_installs_node_admin() {
        let loader = Arc::new(ConfigLoader::from_path(&None));
        let mut node = Node::new(loader).unwrap();
        node.init().await.unwrap();
        assert_eq!(node.built.len(), 1);
        assert!(node.cluster.view_snapshot().nodes.is_empty());
    }

    #[tokio::test]
    async fn setup_then_init_registers_the_service_with_the_cluster() {
        let loader = Arc::new(ConfigLoader::from_path(&None));
        let mut node = Node::new(loader).unwrap();
        node.setup("Echo", 1, Box::new(|_service, _ctx| {}));
        node.init().await.unwrap();
        // the user-defined service plus the auto-installed NodeAdmin
        assert_eq!(node.built.len(), 2);
    }

    #[tokio::test]
    async fn node_admin_retire_is_reachable_over_call() {
        let loader = Arc::new(ConfigLoader::from_path(&None));
        let mut node = Node::new(loader).unwrap();
        node.init().await.unwrap();
        node.start("127.0.0.1:0".parse().unwrap());

        let cluster = node.cluster();
        let reply = cluster
            .dispatch_local("NodeAdmin.Retire", serde_json::Value::Null, false)
            .await
            .unwrap();
        assert_eq!(reply, serde_json::Value::Null);
        assert!(node.admin().is_retiring());
    }
}
