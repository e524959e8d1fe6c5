//! The gateway demo service: an HTTP front door translating REST calls into
//! [`Cluster`] dispatches. Unlike the scheduler and dispatcher demo
//! services, the gateway never joins the service execution tree — it is a
//! plain async task driving `axum`, the way the sampled source's API server
//! sits outside the node's service tree and talks to it only through the
//! scheduler's gRPC client.

pub mod errors;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use metrics::{histogram, increment_counter};
use node_core::cluster::{Cluster, Dispatch};
use node_core::shutdown::Shutdown;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use errors::GatewayError;

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

struct AppState {
    cluster: Arc<Cluster>,
}

pub async fn start_gateway_server(
    cluster: Arc<Cluster>,
    addr: SocketAddr,
    mut shutdown: Shutdown,
) -> anyhow::Result<()> {
    let state = Arc::new(AppState { cluster });

    let app = Router::new()
        .route("/v1/triggers", post(create_trigger))
        .route("/v1/triggers", get(list_triggers))
        .route("/v1/triggers/:id", delete(delete_trigger))
        .route("/v1/deliver", post(deliver))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    info!(%addr, "starting gateway");
    let server = axum::Server::try_bind(&addr)?.serve(app.into_make_service());

    tokio::select! {
        _ = shutdown.recv() => {
            warn!("gateway received shutdown signal");
        },
        res = server => {
            if let Err(e) = res {
                warn!(error = %e, "gateway server exited with an error");
            }
        },
    }
    Ok(())
}

async fn create_trigger(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, GatewayError> {
    let reply = call(&state, "Scheduler.CreateTrigger", body).await?;
    Ok(Json(reply))
}

async fn list_triggers(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, GatewayError> {
    let reply = call(&state, "Scheduler.ListTriggers", serde_json::Value::Null).await?;
    Ok(Json(reply))
}

async fn delete_trigger(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    let reply = call(&state, "Scheduler.DeleteTrigger", serde_json::json!({ "id": id })).await?;
    Ok(Json(reply))
}

async fn deliver(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, GatewayError> {
    let reply = call(&state, "Dispatcher.Deliver", body).await?;
    Ok(Json(reply))
}

async fn call(
    state: &AppState,
    target: &str,
    args: serde_json::Value,
) -> Result<serde_json::Value, GatewayError> {
    let start = std::time::Instant::now();
    let result = state
        .cluster
        .call("Gateway".to_owned(), target, args, DEFAULT_CALL_TIMEOUT, false)
        .await;

    let labels = [
        ("target", target.to_owned()),
        ("outcome", if result.is_ok() { "ok" } else { "error" }.to_owned()),
    ];
    increment_counter!("gateway.requests_total", &labels);
    histogram!("gateway.request_duration_seconds", start.elapsed().as_secs_f64(), &labels);

    result.map_err(GatewayError::from)
}
