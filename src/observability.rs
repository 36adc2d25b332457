use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "gatebook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "gatebook_query_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: appointments successfully booked.
pub const APPOINTMENTS_BOOKED_TOTAL: &str = "gatebook_appointments_booked_total";

/// Counter: rejected booking attempts. Labels: reason.
pub const BOOKING_REJECTIONS_TOTAL: &str = "gatebook_booking_rejections_total";

/// Counter: update/approve/cancel/delete operations applied. Labels: op.
pub const LIFECYCLE_OPERATIONS_TOTAL: &str = "gatebook_lifecycle_operations_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "gatebook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "gatebook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "gatebook_connections_rejected_total";

/// Gauge: live appointments held by the store.
pub const APPOINTMENTS_LIVE: &str = "gatebook_appointments_live";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "gatebook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "gatebook_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "gatebook_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertAppointment(_) => "insert_appointment",
        Command::UpdateAppointment { .. } => "update_appointment",
        Command::SetStatus { .. } => "set_status",
        Command::DeleteAppointment { .. } => "delete_appointment",
        Command::SelectAppointment { .. } => "select_appointment",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectTerminals => "select_terminals",
    }
}
