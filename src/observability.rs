use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: claims attempted. Labels: outcome.
pub const CLAIMS_TOTAL: &str = "slotbook_claims_total";

/// Counter: booking transitions attempted. Labels: action, outcome.
pub const TRANSITIONS_TOTAL: &str = "slotbook_transitions_total";

/// Counter: optimistic version mismatches that forced a retry.
pub const CAS_RETRIES_TOTAL: &str = "slotbook_cas_retries_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "slotbook_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (records per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "slotbook_journal_flush_batch_size";

/// Gauge: unfinished work items.
pub const WORK_QUEUE_DEPTH: &str = "slotbook_work_queue_depth";

// ── Collaborators ───────────────────────────────────────────────

/// Counter: work items processed. Labels: kind, outcome.
pub const WORK_ITEMS_TOTAL: &str = "slotbook_work_items_total";

/// Counter: failed calendar collaborator calls. Labels: action.
pub const CALENDAR_SYNC_FAILURES_TOTAL: &str = "slotbook_calendar_sync_failures_total";

/// Counter: calendar syncs that exhausted their attempts.
pub const CALENDAR_PERMANENT_FAILURES_TOTAL: &str = "slotbook_calendar_permanent_failures_total";

/// Counter: reminders handed to the notifier. Labels: outcome.
pub const REMINDERS_FIRED_TOTAL: &str = "slotbook_reminders_fired_total";

/// Counter: lifecycle notices sent. Labels: kind, outcome.
pub const NOTIFICATIONS_TOTAL: &str = "slotbook_notifications_total";

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
