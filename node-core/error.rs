use std::time::Duration;

/// The full error taxonomy an RPC call, a dispatch, or a handler invocation
/// can surface. Every fallible operation in this crate's public API resolves
/// to one of these kinds; callers match on [`CoreError::kind`] rather than on
/// the error's `Display` text.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// No service by that name is known anywhere in the cluster view.
    #[error("no such service: {0}")]
    NoService(String),

    /// The target node's RPC client has no live connection.
    #[error("disconnected from node {0}")]
    Disconnected(u64),

    /// The target service exists but is in the `Retiring` state and the
    /// caller did not opt in with `AllowRetiring`.
    #[error("service {0} is retiring")]
    Retiring(String),

    /// No reply arrived before the call's deadline.
    #[error("call to {service_method} timed out after {0:?}", .elapsed)]
    Timeout {
        service_method: String,
        elapsed: Duration,
    },

    /// The target's inbound queue rejected the request because it is full.
    #[error("service {0} is overloaded")]
    Overloaded(String),

    /// The argument or reply failed to (de)serialize.
    #[error("marshaling error: {0}")]
    Marshal(#[from] node_wire::WireError),

    /// The handler itself returned an application-level error.
    #[error("handler error: {0}")]
    Handler(String),

    /// The handler panicked; the service loop recovered and kept running.
    #[error("handler panicked: {0}")]
    Panic(String),

    /// An unrecoverable condition; the service (or process) should stop.
    #[error("fatal error: {0}")]
    Fatal(#[source] anyhow::Error),
}

impl CoreError {
    pub fn kind(&self) -> CoreErrorKind {
        match self {
            | CoreError::NoService(_) => CoreErrorKind::NoService,
            | CoreError::Disconnected(_) => CoreErrorKind::Disconnected,
            | CoreError::Retiring(_) => CoreErrorKind::Retiring,
            | CoreError::Timeout { .. } => CoreErrorKind::Timeout,
            | CoreError::Overloaded(_) => CoreErrorKind::Overloaded,
            | CoreError::Marshal(_) => CoreErrorKind::Marshal,
            | CoreError::Handler(_) => CoreErrorKind::Handler,
            | CoreError::Panic(_) => CoreErrorKind::Panic,
            | CoreError::Fatal(_) => CoreErrorKind::Fatal,
        }
    }

    /// Whether a caller can reasonably retry the same call unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            CoreErrorKind::Disconnected
                | CoreErrorKind::Timeout
                | CoreErrorKind::Overloaded
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreErrorKind {
    NoService,
    Disconnected,
    Retiring,
    Timeout,
    Overloaded,
    Marshal,
    Handler,
    Panic,
    Fatal,
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnected_and_timeout_are_retryable() {
        assert!(CoreError::Disconnected(1).is_retryable());
        assert!(
            CoreError::Timeout {
                service_method: "Foo.Bar".into(),
                elapsed: Duration::from_secs(1),
            }
            .is_retryable()
        );
        assert!(!CoreError::NoService("Foo".into()).is_retryable());
    }
}
