//! Delivers a single webhook attempt over HTTP. Synchronous on purpose: the
//! whole delivery-with-retry sequence runs inside `Service::spawn_worker`
//! (`lib.rs`'s `deliver_blocking`), so this only ever runs off the owning
//! service's loop, on the blocking thread pool.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookTarget {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub timeout_s: Option<u64>,
}

fn default_method() -> String {
    "POST".to_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub delivered: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

/// Performs one delivery attempt. Redirects are never followed: a webhook
/// target that wants to move should update its own registration rather than
/// have us blindly chase a 3xx.
pub fn attempt_delivery(target: &WebhookTarget, body: &serde_json::Value) -> DeliveryOutcome {
    match attempt_delivery_impl(target, body) {
        | Ok(status) => DeliveryOutcome {
            delivered: status.is_success(),
            status_code: Some(status.as_u16()),
            error: if status.is_success() {
                None
            } else {
                Some(format!("non-success status: {status}"))
            },
        },
        | Err(e) => DeliveryOutcome {
            delivered: false,
            status_code: None,
            error: Some(e.to_string()),
        },
    }
}

fn attempt_delivery_impl(target: &WebhookTarget, body: &serde_json::Value) -> Result<reqwest::StatusCode, reqwest::Error> {
    let client = reqwest::blocking::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(target.timeout_s.unwrap_or(10)))
        .build()?;

    let method: reqwest::Method = target.method.parse().unwrap_or(reqwest::Method::POST);
    let mut request = client.request(method, &target.url).json(body);
    for (key, value) in &target.headers {
        request = request.header(key, value);
    }

    let response = request.send()?;
    Ok(response.status())
}
