use tracing::trace;

// Trace-based counters; the Prometheus recorder installed in main renders
// whatever a metrics layer derives from these events.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "closet.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn inbound_message(kind: &'static str) {
    trace!(target = "closet.metrics", kind = kind, "inbound_messages_total_inc");
}

pub fn transition(from: &'static str, to: &'static str) {
    trace!(
        target = "closet.metrics",
        from = from,
        to = to,
        "state_transitions_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "closet.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn flow_action(action: &str, ok: bool) {
    trace!(
        target = "closet.metrics",
        action = action,
        ok = ok,
        "flow_requests_total_inc"
    );
}
