use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "counterbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "counterbook_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "counterbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "counterbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "counterbook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "counterbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "counterbook_wal_flush_batch_size";

// ── Admission ───────────────────────────────────────────────────

/// Counter: bookings accepted.
pub const BOOKINGS_ADMITTED_TOTAL: &str = "counterbook_bookings_admitted_total";

/// Counter: booking requests refused. Labels: reason.
pub const BOOKINGS_REJECTED_TOTAL: &str = "counterbook_bookings_rejected_total";

/// Counter: past appointments persisted as completed by the reconciler.
pub const RECONCILED_TOTAL: &str = "counterbook_reconciled_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SelectAvailability { .. } => "select_availability",
        Command::InsertBooking(_) => "insert_booking",
        Command::UpdateBooking { .. } => "update_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::RateBooking { .. } => "rate_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectBookingById { .. } => "select_booking_by_id",
        Command::SelectBookingByProtocol { .. } => "select_booking_by_protocol",
        Command::ToggleDayBlock { .. } => "toggle_day_block",
        Command::ToggleSlotBlock { .. } => "toggle_slot_block",
        Command::ToggleMonthBlock { .. } => "toggle_month_block",
        Command::SelectBlockedDates => "select_blocked_dates",
        Command::SelectBlockedSlots => "select_blocked_slots",
        Command::SelectSummary => "select_summary",
    }
}
