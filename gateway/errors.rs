//! Maps [`CoreError`] onto HTTP status codes for the gateway's handlers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use node_core::error::{CoreError, CoreErrorKind};

pub struct GatewayError(CoreError);

impl From<CoreError> for GatewayError {
    fn from(e: CoreError) -> Self {
        GatewayError(e)
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            | CoreErrorKind::NoService => StatusCode::NOT_FOUND,
            | CoreErrorKind::Retiring => StatusCode::SERVICE_UNAVAILABLE,
            | CoreErrorKind::Overloaded => StatusCode::TOO_MANY_REQUESTS,
            | CoreErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            | CoreErrorKind::Disconnected => StatusCode::BAD_GATEWAY,
            | CoreErrorKind::Marshal => StatusCode::BAD_REQUEST,
            | CoreErrorKind::Handler => StatusCode::UNPROCESSABLE_ENTITY,
            | CoreErrorKind::Panic | CoreErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}
