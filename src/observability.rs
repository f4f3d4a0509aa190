use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "bandroom_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "bandroom_query_duration_seconds";

// ── Scheduling ──────────────────────────────────────────────────

/// Counter: rejected proposals and reschedules. Labels: reason.
pub const BOOKINGS_REJECTED_TOTAL: &str = "bandroom_bookings_rejected_total";

/// Counter: occupancy or schedule reads answered empty because storage failed.
pub const OCCUPANCY_FAIL_OPEN_TOTAL: &str = "bandroom_occupancy_fail_open_total";

/// Counter: read-cache hits.
pub const CACHE_HITS_TOTAL: &str = "bandroom_cache_hits_total";

/// Counter: read-cache misses.
pub const CACHE_MISSES_TOTAL: &str = "bandroom_cache_misses_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: open pgwire connections.
pub const CONNECTIONS_ACTIVE: &str = "bandroom_connections_active";

/// Counter: connections accepted.
pub const CONNECTIONS_TOTAL: &str = "bandroom_connections_total";

/// Counter: connections refused at the limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "bandroom_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bandroom_wal_flush_duration_seconds";

/// Histogram: events per WAL flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "bandroom_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if `None`.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertBand { .. } => "insert_band",
        Command::UpdateBand { .. } => "update_band",
        Command::DeleteBand { .. } => "delete_band",
        Command::InsertMusician { .. } => "insert_musician",
        Command::UpdateMusician { .. } => "update_musician",
        Command::DeleteMusician { .. } => "delete_musician",
        Command::InsertMember { .. } => "insert_member",
        Command::DeleteMember { .. } => "delete_member",
        Command::ProposeBooking { .. } => "propose_booking",
        Command::RescheduleBooking { .. } => "reschedule_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::SelectOccupancy { .. } => "select_occupancy",
        Command::SelectSchedule { .. } => "select_schedule",
        Command::SelectBands => "select_bands",
        Command::SelectMusicians { .. } => "select_musicians",
        Command::SelectFreeMusicians => "select_free_musicians",
        Command::SelectRehearsalHours { .. } => "select_rehearsal_hours",
        Command::SelectGenres => "select_genres",
        Command::SelectStats => "select_stats",
    }
}
