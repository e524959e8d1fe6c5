//! The dispatcher demo service: hosts `Dispatcher.Deliver`, a fire-and-forget
//! webhook delivery with retry/backoff. Registered against a [`Service`] via
//! [`factory`] the same way the scheduler and gateway demo services are.

pub mod retry;
pub mod webhook;

use std::sync::Arc;

use metrics::counter;
use node_core::error::{CoreError, Result};
use node_core::node::ServiceFactory;
use node_core::service::{Service, ServiceContext};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use retry::{Retry, RetryConfig};
use webhook::{attempt_delivery, WebhookTarget};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverRequest {
    pub target: WebhookTarget,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

/// Drives a [`WebhookTarget`] through a [`Retry`] policy until delivery
/// succeeds or the policy is exhausted. Runs entirely on the blocking thread
/// pool (see [`factory`]): the delay between attempts is a plain
/// `std::thread::sleep`, which would stall the service loop if called there
/// directly, which is exactly why this never runs outside `spawn_worker`.
fn deliver_blocking(target: WebhookTarget, payload: serde_json::Value, retry: RetryConfig) -> u32 {
    let url = target.url.clone();
    let mut last_attempt = 0;
    for delay in Retry::with_config(retry) {
        std::thread::sleep(delay.duration());
        let outcome = attempt_delivery(&target, &payload);
        counter!("dispatcher.attempts_total", 1);
        last_attempt = delay.attempt_number();
        if outcome.delivered {
            info!(url = %url, attempt = last_attempt, "webhook delivered");
            return last_attempt;
        }
        if delay.last_attempt() {
            warn!(
                url = %url,
                attempts = last_attempt,
                error = ?outcome.error,
                "webhook delivery exhausted all retries"
            );
            counter!("dispatcher.delivery_failures_total", 1);
            return last_attempt;
        }
        warn!(
            url = %url,
            attempt = last_attempt,
            error = ?outcome.error,
            "webhook delivery attempt failed, retrying"
        );
    }
    last_attempt
}

/// Registers the `Dispatcher.Deliver` handler. The handler itself only
/// validates the request, then hands the whole delivery-with-retry sequence
/// off to [`node_core::service::tree::LoopHandle::spawn_worker`]: a webhook
/// with a long retry schedule must not stall this service's loop, which
/// would otherwise block every other inbound item behind it.
pub fn factory() -> ServiceFactory {
    Box::new(move |service: &Service, _ctx: &ServiceContext| {
        service.register(
            "Dispatcher.Deliver",
            Arc::new(|handle, args: serde_json::Value| async move {
                let request: DeliverRequest =
                    serde_json::from_value(args).map_err(|e| CoreError::Handler(e.to_string()))?;
                counter!("dispatcher.invocations_total", 1);
                let retry = request.retry.unwrap_or_default();
                let url = request.target.url.clone();
                handle.spawn_worker(
                    move || deliver_blocking(request.target, request.payload, retry),
                    move |_h, attempts| {
                        tracing::debug!(url = %url, attempts, "delivery worker finished");
                    },
                );
                Ok(serde_json::Value::Null)
            }),
            false,
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn deliver_request_round_trips_through_json() {
        let req = DeliverRequest {
            target: WebhookTarget {
                url: "https://example.com/hook".to_owned(),
                method: "POST".to_owned(),
                headers: HashMap::new(),
                timeout_s: None,
            },
            payload: serde_json::json!({"hello": "world"}),
            retry: None,
        };
        let value = serde_json::to_value(&req).unwrap();
        let back: DeliverRequest = serde_json::from_value(value).unwrap();
        assert_eq!(back.target.url, req.target.url);
    }
}
