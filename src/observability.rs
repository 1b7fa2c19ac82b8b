use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "resalloc_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "resalloc_query_duration_seconds";

/// Counter: allocation writes refused by the validator. Labels: reason.
pub const ALLOCATIONS_REJECTED_TOTAL: &str = "resalloc_allocations_rejected_total";

/// Gauge: pairs reported by the last conflict scan.
pub const CONFLICTS_FOUND: &str = "resalloc_conflicts_found";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: open client connections.
pub const CONNECTIONS_ACTIVE: &str = "resalloc_connections_active";

/// Counter: connections accepted.
pub const CONNECTIONS_TOTAL: &str = "resalloc_connections_total";

/// Counter: connections refused at the limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "resalloc_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "resalloc_wal_flush_duration_seconds";

/// Histogram: records per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "resalloc_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "resalloc_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op when `port` is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter: {e}"),
    }
}

/// Short metrics label per command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertEvent { .. } => "insert_event",
        Command::UpdateEvent { .. } => "update_event",
        Command::DeleteEvent { .. } => "delete_event",
        Command::InsertResource { .. } => "insert_resource",
        Command::UpdateResource { .. } => "update_resource",
        Command::DeleteResource { .. } => "delete_resource",
        Command::InsertAllocation { .. } => "insert_allocation",
        Command::BatchInsertAllocations { .. } => "batch_insert_allocations",
        Command::UpdateAllocation { .. } => "update_allocation",
        Command::DeleteAllocation { .. } => "delete_allocation",
        Command::SelectEvents => "select_events",
        Command::SelectResources => "select_resources",
        Command::SelectAllocations { .. } => "select_allocations",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectValidate { .. } => "select_validate",
        Command::SelectUsage { .. } => "select_usage",
        Command::SelectUpcoming { .. } => "select_upcoming",
        Command::SelectDashboard { .. } => "select_dashboard",
        Command::SelectRecentAllocations { .. } => "select_recent_allocations",
    }
}
