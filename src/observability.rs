use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotwise_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotwise_query_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

pub const BOOKINGS_CREATED_TOTAL: &str = "slotwise_bookings_created_total";
pub const BOOKINGS_UPDATED_TOTAL: &str = "slotwise_bookings_updated_total";
pub const BOOKINGS_CANCELLED_TOTAL: &str = "slotwise_bookings_cancelled_total";

/// Counter: freed slots handed to a waitlisted user.
pub const WAITLIST_PROMOTIONS_TOTAL: &str = "slotwise_waitlist_promotions_total";

/// Counter: promotion attempts that errored (the freeing operation still succeeded).
pub const WAITLIST_PROMOTION_FAILURES_TOTAL: &str = "slotwise_waitlist_promotion_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotwise_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotwise_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotwise_connections_rejected_total";

/// Counter: logins that did not resolve to a caller identity.
pub const AUTH_FAILURES_TOTAL: &str = "slotwise_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotwise_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotwise_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotwise_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertProvider { .. } => "insert_provider",
        Command::UpdateProvider { .. } => "update_provider",
        Command::DeleteProvider { .. } => "delete_provider",
        Command::InsertBooking { .. } => "insert_booking",
        Command::Reschedule {
            booking_id: None, ..
        } => "reschedule_own",
        Command::Reschedule { .. } => "reschedule_admin",
        Command::CancelOwnBooking => "cancel_own_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::JoinWaitlist { .. } => "join_waitlist",
        Command::LeaveWaitlist { .. } => "leave_waitlist",
        Command::SelectMyBooking => "select_my_booking",
        Command::SelectBookings => "select_bookings",
        Command::SelectWaitlist => "select_waitlist",
        Command::SelectProviders { .. } => "select_providers",
    }
}
