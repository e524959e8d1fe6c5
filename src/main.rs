mod cli;
mod metric_defs;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use cli::LogFormat;
use colored::Colorize;
use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_util::MetricKindMask;
use node_core::config::{ConfigLoader, Role};
use node_core::netutils::parse_addr;
use node_core::node::Node;
use tokio::select;
use tracing::{debug, error, info, trace, warn, Subscriber};
use tracing_subscriber::FmtSubscriber;

fn setup_logging_subscriber(f: &LogFormat) -> Box<dyn Subscriber + Send + Sync> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "meshd=debug,node_core=debug,gateway=debug,scheduler=debug,dispatcher=debug".into());

    let sub = FmtSubscriber::builder()
        .with_thread_names(true)
        .with_max_level(tracing::Level::INFO)
        .with_env_filter(env_filter);

    match f {
        | cli::LogFormat::Pretty => Box::new(sub.pretty().finish()),
        | cli::LogFormat::Compact => Box::new(sub.compact().finish()),
        | cli::LogFormat::Json => Box::new(sub.json().finish()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = cli::CliOpts::parse();

    tracing::subscriber::set_global_default(setup_logging_subscriber(&opts.log_format))?;

    debug!("** {} **", "meshd".magenta());
    trace!(config = opts.config, "loading configuration");
    let config_loader = Arc::new(ConfigLoader::from_path(&opts.config));
    let config = config_loader.load()?;

    let prometheus_sockaddr = parse_addr(&config.main.prometheus_address, config.main.prometheus_port)?;
    let builder = PrometheusBuilder::new();
    info!(addr = ?prometheus_sockaddr, "prometheus http listener");
    builder
        .idle_timeout(MetricKindMask::HISTOGRAM, Some(Duration::from_secs(120)))
        .with_http_listener(prometheus_sockaddr)
        .install()
        .expect("failed to install prometheus recorder");
    metric_defs::install_metrics();

    let mut node = Node::new(Arc::clone(&config_loader))?;
    let roles = config.main.roles.clone();

    if roles.contains(&Role::Scheduler) {
        node.setup("Scheduler", 1, scheduler::factory());
    }
    if roles.contains(&Role::Dispatcher) {
        node.setup("Dispatcher", 2, dispatcher::factory());
    }

    node.init().await.map_err(|e| anyhow::anyhow!("initializing node: {e}"))?;

    let rpc_addr = parse_addr(&config.main.advertise_address, config.main.rpc_port)?;
    info!(addr = ?rpc_addr, node_id = node.node_id(), "starting node");
    node.start(rpc_addr);

    let mut gateway_handle = None;
    if roles.contains(&Role::Gateway) {
        let gateway_addr = parse_addr(&config.gateway.address, config.gateway.port)?;
        let cluster = node.cluster();
        let gateway_shutdown = node.shutdown_handle();
        gateway_handle = Some(tokio::spawn(gateway::start_gateway_server(
            cluster,
            gateway_addr,
            gateway_shutdown,
        )));
    }

    let mut shutdown = node.shutdown_handle();
    loop {
        select! {
            _ = shutdown.recv() => {
                warn!("received shutdown signal from a downstream service");
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("received Ctrl+C (SIGINT)");
                break;
            },
            _ = wait_for_retire_signal() => {
                warn!("received retire signal, draining in-flight work without stopping the node");
                node.retire();
            },
        }
    }

    info!("stopping node");
    node.stop().await;
    if let Some(handle) = gateway_handle {
        handle.abort();
    }
    info!("bye!");

    Ok(())
}

/// Waits for the sampled source's retire signal (`SIGUSR1` on unix). There is
/// no portable equivalent on other platforms, which is exactly why retire is
/// also reachable as `NodeAdmin.Retire` over RPC — see
/// `node_core::cluster::admin`. On non-unix targets this future never
/// resolves, so retire is only reachable through that RPC surface.
async fn wait_for_retire_signal() {
    #[cfg(unix)]
    {
        let mut sigusr1 = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())
            .expect("failed to install SIGUSR1 handler");
        sigusr1.recv().await;
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}
