use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests served. Labels: method, route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "deskpool_http_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: method, route.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "deskpool_http_request_duration_seconds";

/// Counter: requests that hit the deadline.
pub const HTTP_TIMEOUTS_TOTAL: &str = "deskpool_http_timeouts_total";

// ── Reservation outcomes ────────────────────────────────────────

/// Counter: bookings written.
pub const BOOKINGS_CREATED_TOTAL: &str = "deskpool_bookings_created_total";

/// Counter: bookings refused by the oracle. Labels: reason.
pub const BOOKINGS_REJECTED_TOTAL: &str = "deskpool_bookings_rejected_total";

/// Counter: offerings written.
pub const OFFERINGS_CREATED_TOTAL: &str = "deskpool_offerings_created_total";

/// Counter: offerings refused (no covering assignment, overlap). Labels: reason.
pub const OFFERINGS_REJECTED_TOTAL: &str = "deskpool_offerings_rejected_total";

// ── Background tasks ────────────────────────────────────────────

/// Counter: rows hard-deleted by the reaper. Labels: table.
pub const REAPER_ROWS_REMOVED_TOTAL: &str = "deskpool_reaper_rows_removed_total";

/// Counter: reaper ticks that ended in an error.
pub const REAPER_FAILURES_TOTAL: &str = "deskpool_reaper_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "deskpool_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "deskpool_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> anyhow::Result<()> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus metrics exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a rejected reservation, used on the `reason` label.
pub fn rejection_label(err: &crate::engine::EngineError) -> &'static str {
    use crate::engine::EngineError;
    match err {
        EngineError::BookingConflict { .. } => "booked",
        EngineError::NotOffered { .. } => "not_offered",
        EngineError::NotAssigned { .. } => "not_assigned",
        EngineError::OfferingOverlap(_) => "offering_overlap",
        _ => "other",
    }
}
