use std::net::SocketAddr;

use crate::model::Decision;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: booking requests admitted into the pending queue.
pub const BOOKINGS_SUBMITTED_TOTAL: &str = "rigbook_bookings_submitted_total";

/// Counter: decisions taken on pending bookings. Labels: outcome.
pub const BOOKING_DECISIONS_TOTAL: &str = "rigbook_booking_decisions_total";

/// Counter: bookings cancelled by their requester.
pub const BOOKINGS_CANCELLED_TOTAL: &str = "rigbook_bookings_cancelled_total";

/// Counter: successful check-ins.
pub const CHECKINS_TOTAL: &str = "rigbook_checkins_total";

/// Counter: bookings marked no-show by the sweep.
pub const NO_SHOWS_MARKED_TOTAL: &str = "rigbook_no_shows_marked_total";

/// Counter: notifications handed to a delivery channel.
pub const NOTIFICATIONS_SENT_TOTAL: &str = "rigbook_notifications_sent_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: bookings currently awaiting a decision.
pub const PENDING_BOOKINGS: &str = "rigbook_pending_bookings";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "rigbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "rigbook_wal_flush_batch_size";

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

/// Map a decision outcome to a short label for metrics.
pub fn decision_label(decision: &Decision) -> &'static str {
    match decision {
        Decision::Approved => "approved",
        Decision::RejectedDueToConflict => "rejected_conflict",
    }
}

/// Label for an explicit approver rejection (no Decision value carries it).
pub const DECISION_REJECTED: &str = "rejected";
