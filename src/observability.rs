use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "bookd_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "bookd_request_duration_seconds";

/// Counter: submit outcomes. Labels: action (created/updated).
pub const SUBMIT_ACTIONS_TOTAL: &str = "bookd_submit_actions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "bookd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "bookd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "bookd_connections_rejected_total";

/// Gauge: number of distinct identities in the store.
pub const IDENTITIES_ACTIVE: &str = "bookd_identities_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bookd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "bookd_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Request variant to a short label for metrics.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::Submit { .. } => "submit",
        Request::Survey { .. } => "survey",
        Request::Get { .. } => "get",
        Request::List { .. } => "list",
        Request::Slots { .. } => "slots",
        Request::Watch { .. } => "watch",
        Request::Unwatch => "unwatch",
        Request::Ping => "ping",
    }
}
