use tracing::trace;

// Each helper feeds both the installed recorder (rendered by /metrics) and
// the `fleet.metrics` trace target.

pub fn inc_requests(route: &'static str) {
    ::metrics::counter!("fleet_requests_total", "route" => route).increment(1);
    trace!(
        target = "fleet.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn item_elapsed(kind: &'static str, success: bool, elapsed_ms: u128) {
    let outcome = if success { "success" } else { "failure" };
    ::metrics::counter!("fleet_items_total", "kind" => kind, "outcome" => outcome).increment(1);
    ::metrics::histogram!("fleet_item_duration_ms", "kind" => kind).record(elapsed_ms as f64);
    trace!(
        target = "fleet.metrics",
        kind = kind,
        success = success,
        elapsed_ms = elapsed_ms as u64,
        "item_elapsed"
    );
}

pub fn job_finished(kind: &'static str, status: &'static str, elapsed_ms: u128) {
    ::metrics::counter!("fleet_jobs_finished_total", "kind" => kind, "status" => status)
        .increment(1);
    ::metrics::histogram!("fleet_job_duration_ms", "kind" => kind).record(elapsed_ms as f64);
    trace!(
        target = "fleet.metrics",
        kind = kind,
        status = status,
        elapsed_ms = elapsed_ms as u64,
        "job_finished"
    );
}

pub fn session_checkout(in_use: usize) {
    ::metrics::gauge!("fleet_sessions_in_use").set(in_use as f64);
    trace!(
        target = "fleet.metrics",
        in_use = in_use as u64,
        "session_checkout"
    );
}
