use std::{
    collections::HashMap,
    fmt::Write as _,
    sync::{Mutex, OnceLock},
};

static METRICS_STATE: OnceLock<MetricsState> = OnceLock::new();

#[derive(Default)]
pub(crate) struct MetricsState {
    pub(crate) auth_failures: Mutex<HashMap<&'static str, u64>>,
    pub(crate) rate_limit_hits: Mutex<HashMap<(&'static str, &'static str), u64>>,
    pub(crate) ws_disconnects: Mutex<HashMap<&'static str, u64>>,
    pub(crate) gateway_events_emitted: Mutex<HashMap<(String, String), u64>>,
    pub(crate) gateway_events_dropped: Mutex<HashMap<(String, String, String), u64>>,
    pub(crate) gateway_events_parse_rejected: Mutex<HashMap<(String, String), u64>>,
    pub(crate) bus_publish_failures: Mutex<HashMap<&'static str, u64>>,
}

pub(crate) fn metrics_state() -> &'static MetricsState {
    METRICS_STATE.get_or_init(MetricsState::default)
}

#[allow(clippy::too_many_lines)]
pub(crate) fn render_metrics() -> String {
    let auth_failures = metrics_state()
        .auth_failures
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone());
    let rate_limit_hits = metrics_state()
        .rate_limit_hits
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone());
    let ws_disconnects = metrics_state()
        .ws_disconnects
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone());
    let gateway_events_emitted = metrics_state()
        .gateway_events_emitted
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone());
    let gateway_events_dropped = metrics_state()
        .gateway_events_dropped
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone());
    let gateway_events_parse_rejected = metrics_state()
        .gateway_events_parse_rejected
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone());
    let bus_publish_failures = metrics_state()
        .bus_publish_failures
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone());

    let mut output = String::new();
    output.push_str("# HELP quorum_auth_failures_total Count of auth-related failures by reason\n");
    output.push_str("# TYPE quorum_auth_failures_total counter\n");
    let mut auth_entries: Vec<_> = auth_failures.into_iter().collect();
    auth_entries.sort_by_key(|(reason, _)| *reason);
    for (reason, value) in auth_entries {
        let _ = writeln!(
            output,
            "quorum_auth_failures_total{{reason=\"{reason}\"}} {value}"
        );
    }

    output
        .push_str("# HELP quorum_rate_limit_hits_total Count of rate-limit rejections by surface\n");
    output.push_str("# TYPE quorum_rate_limit_hits_total counter\n");
    let mut rate_entries: Vec<_> = rate_limit_hits.into_iter().collect();
    rate_entries.sort_by_key(|((surface, reason), _)| (*surface, *reason));
    for ((surface, reason), value) in rate_entries {
        let _ = writeln!(
            output,
            "quorum_rate_limit_hits_total{{surface=\"{surface}\",reason=\"{reason}\"}} {value}"
        );
    }

    output.push_str(
        "# HELP quorum_ws_disconnects_total Count of websocket disconnect events by reason\n",
    );
    output.push_str("# TYPE quorum_ws_disconnects_total counter\n");
    let mut ws_entries: Vec<_> = ws_disconnects.into_iter().collect();
    ws_entries.sort_by_key(|(reason, _)| *reason);
    for (reason, value) in ws_entries {
        let _ = writeln!(
            output,
            "quorum_ws_disconnects_total{{reason=\"{reason}\"}} {value}"
        );
    }

    output.push_str(
        "# HELP quorum_gateway_events_emitted_total Count of emitted gateway events by scope and type\n",
    );
    output.push_str("# TYPE quorum_gateway_events_emitted_total counter\n");
    let mut emitted_entries: Vec<_> = gateway_events_emitted.into_iter().collect();
    emitted_entries.sort();
    for ((scope, event_type), value) in emitted_entries {
        let _ = writeln!(
            output,
            "quorum_gateway_events_emitted_total{{scope=\"{scope}\",event_type=\"{event_type}\"}} {value}"
        );
    }

    output.push_str(
        "# HELP quorum_gateway_events_dropped_total Count of dropped gateway events by scope, type, and reason\n",
    );
    output.push_str("# TYPE quorum_gateway_events_dropped_total counter\n");
    let mut dropped_entries: Vec<_> = gateway_events_dropped.into_iter().collect();
    dropped_entries.sort();
    for ((scope, event_type, reason), value) in dropped_entries {
        let _ = writeln!(
            output,
            "quorum_gateway_events_dropped_total{{scope=\"{scope}\",event_type=\"{event_type}\",reason=\"{reason}\"}} {value}"
        );
    }

    output.push_str(
        "# HELP quorum_gateway_events_parse_rejected_total Count of gateway events rejected during parsing by scope and reason\n",
    );
    output.push_str("# TYPE quorum_gateway_events_parse_rejected_total counter\n");
    let mut parse_rejected_entries: Vec<_> = gateway_events_parse_rejected.into_iter().collect();
    parse_rejected_entries.sort();
    for ((scope, reason), value) in parse_rejected_entries {
        let _ = writeln!(
            output,
            "quorum_gateway_events_parse_rejected_total{{scope=\"{scope}\",reason=\"{reason}\"}} {value}"
        );
    }

    output.push_str(
        "# HELP quorum_bus_publish_failures_total Count of fan-out publishes that fell back to local delivery\n",
    );
    output.push_str("# TYPE quorum_bus_publish_failures_total counter\n");
    let mut bus_entries: Vec<_> = bus_publish_failures.into_iter().collect();
    bus_entries.sort_by_key(|(topic, _)| *topic);
    for (topic, value) in bus_entries {
        let _ = writeln!(
            output,
            "quorum_bus_publish_failures_total{{topic=\"{topic}\"}} {value}"
        );
    }

    output
}

pub(crate) fn record_auth_failure(reason: &'static str) {
    if let Ok(mut counters) = metrics_state().auth_failures.lock() {
        let entry = counters.entry(reason).or_insert(0);
        *entry += 1;
    }
}

pub(crate) fn record_rate_limit_hit(surface: &'static str, reason: &'static str) {
    if let Ok(mut counters) = metrics_state().rate_limit_hits.lock() {
        let entry = counters.entry((surface, reason)).or_insert(0);
        *entry += 1;
    }
}

pub(crate) fn record_ws_disconnect(reason: &'static str) {
    if let Ok(mut counters) = metrics_state().ws_disconnects.lock() {
        let entry = counters.entry(reason).or_insert(0);
        *entry += 1;
    }
}

pub(crate) fn record_gateway_event_emitted(scope: &'static str, event_type: &str) {
    if let Ok(mut counters) = metrics_state().gateway_events_emitted.lock() {
        let entry = counters
            .entry((scope.to_owned(), event_type.to_owned()))
            .or_insert(0);
        *entry += 1;
    }
}

pub(crate) fn record_gateway_event_dropped(
    scope: &'static str,
    event_type: &str,
    reason: &'static str,
) {
    if let Ok(mut counters) = metrics_state().gateway_events_dropped.lock() {
        let entry = counters
            .entry((scope.to_owned(), event_type.to_owned(), reason.to_owned()))
            .or_insert(0);
        *entry += 1;
    }
}

pub(crate) fn record_gateway_event_parse_rejected(scope: &'static str, reason: &'static str) {
    if let Ok(mut counters) = metrics_state().gateway_events_parse_rejected.lock() {
        let entry = counters
            .entry((scope.to_owned(), reason.to_owned()))
            .or_insert(0);
        *entry += 1;
    }
}

pub(crate) fn record_bus_publish_failure(topic: &'static str) {
    if let Ok(mut counters) = metrics_state().bus_publish_failures.lock() {
        let entry = counters.entry(topic).or_insert(0);
        *entry += 1;
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::{metrics_state, record_gateway_event_dropped, render_metrics};

    #[test]
    fn records_dropped_events_by_scope_type_and_reason() {
        let event_type = format!("drop_test_{}", Uuid::new_v4());
        record_gateway_event_dropped("room", &event_type, "full_queue");

        let dropped = metrics_state()
            .gateway_events_dropped
            .lock()
            .expect("gateway dropped metrics mutex should not be poisoned");
        let key = (
            String::from("room"),
            event_type,
            String::from("full_queue"),
        );
        assert_eq!(dropped.get(&key).copied(), Some(1));
    }

    #[test]
    fn rendered_output_is_prometheus_text() {
        record_gateway_event_dropped("room", "render_test", "closed");
        let output = render_metrics();
        assert!(output.contains("# TYPE quorum_gateway_events_dropped_total counter"));
        assert!(output.contains("quorum_gateway_events_dropped_total{scope=\"room\""));
    }
}
