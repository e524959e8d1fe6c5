use serde::{Deserialize, Serialize};

/// The logical contents of a single RPC message, independent of the
/// processor used to encode it onto the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Frame {
    Request(RequestFrame),
    Response(ResponseFrame),
}

impl Frame {
    pub fn seq(&self) -> u64 {
        match self {
            | Frame::Request(r) => r.seq,
            | Frame::Response(r) => r.seq,
        }
    }
}

/// A request to invoke `service_method` (`"service.Method"`) on the peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub seq: u64,
    pub service_method: String,
    pub no_reply: bool,
    /// The marshaled argument, as produced by the caller's processor.
    pub payload: serde_json::Value,
    /// Out-of-band metadata a caller can attach (tracing parent span, etc).
    #[serde(default)]
    pub addition: Option<serde_json::Value>,
}

/// The reply to a previously issued [`RequestFrame`], matched by `seq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub seq: u64,
    pub error: Option<String>,
    pub payload: serde_json::Value,
}

impl ResponseFrame {
    pub fn ok(seq: u64, payload: serde_json::Value) -> Self {
        Self {
            seq,
            error: None,
            payload,
        }
    }

    pub fn err(seq: u64, error: impl Into<String>) -> Self {
        Self {
            seq,
            error: Some(error.into()),
            payload: serde_json::Value::Null,
        }
    }
}
