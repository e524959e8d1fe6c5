use metrics::{describe_counter, describe_histogram, Unit};

/// Optional but adds description/help message to the metrics emitted to the
/// metric sink.
pub(crate) fn install_metrics() {
    describe_counter!("rpc.requests_total", Unit::Count, "Total RPC requests processed");
    describe_histogram!(
        "rpc.duration_seconds",
        Unit::Seconds,
        "Total latency of RPC processing in seconds"
    );

    describe_counter!(
        "gateway.requests_total",
        Unit::Count,
        "Total HTTP requests handled by the gateway"
    );
    describe_histogram!(
        "gateway.request_duration_seconds",
        Unit::Seconds,
        "Latency of gateway requests translated into cluster dispatches"
    );

    describe_counter!(
        "dispatcher.invocations_total",
        Unit::Count,
        "Total number of Dispatcher.Deliver invocations"
    );
    describe_counter!(
        "dispatcher.attempts_total",
        Unit::Count,
        "Total number of webhook delivery attempts, across all retries"
    );
    describe_counter!(
        "dispatcher.delivery_failures_total",
        Unit::Count,
        "Total number of webhook deliveries that exhausted their retry policy"
    );
}
