// Process-wide relay metrics with a Prometheus text renderer.
//
// A global registry is installed once at startup; call sites use the free
// functions and become no-ops when no registry is set (unit tests).

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

const WS_ENDPOINTS: [&str; 5] =
    ["join_session", "send_message", "notify_typing", "share_public_key", "destroy_session"];
const UNKNOWN_ENDPOINT_LABEL: &str = "unknown";

static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

#[derive(Default)]
pub struct RelayMetrics {
    ws_rate_total: Mutex<HashMap<String, u64>>,
    ws_errors_total: Mutex<HashMap<String, u64>>,
    ws_duration_count: Mutex<HashMap<String, u64>>,
    ws_duration_sum_ms: Mutex<HashMap<String, u64>>,
    sessions_created_total: AtomicU64,
    sessions_destroyed_total: AtomicU64,
    sessions_reaped_total: AtomicU64,
}

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_ws_request(endpoint: &str, is_error: bool, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_request(endpoint, is_error, latency_ms);
    }
}

pub fn increment_sessions_created() {
    if let Some(metrics) = global_metrics() {
        metrics.sessions_created_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn increment_sessions_destroyed() {
    if let Some(metrics) = global_metrics() {
        metrics.sessions_destroyed_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn increment_sessions_reaped() {
    if let Some(metrics) = global_metrics() {
        metrics.sessions_reaped_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn render_global() -> String {
    global_metrics().map(|metrics| metrics.render_prometheus()).unwrap_or_default()
}

impl RelayMetrics {
    pub fn record_ws_request(&self, endpoint: &str, is_error: bool, latency_ms: u64) {
        let endpoint = normalize_ws_endpoint(endpoint);
        increment_counter(&self.ws_rate_total, &endpoint, 1);
        increment_counter(&self.ws_duration_sum_ms, &endpoint, latency_ms);
        increment_counter(&self.ws_duration_count, &endpoint, 1);
        if is_error {
            increment_counter(&self.ws_errors_total, &endpoint, 1);
        }
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_ws_rate_total Total WebSocket calls by endpoint.\n");
        output.push_str("# TYPE relay_ws_rate_total counter\n");
        append_counter_lines(&mut output, "relay_ws_rate_total", &self.ws_rate_total);

        output.push_str("# HELP relay_ws_errors_total Total WebSocket call errors by endpoint.\n");
        output.push_str("# TYPE relay_ws_errors_total counter\n");
        append_counter_lines(&mut output, "relay_ws_errors_total", &self.ws_errors_total);

        output.push_str("# HELP relay_ws_duration_ms_count WebSocket call count by endpoint.\n");
        output.push_str("# TYPE relay_ws_duration_ms_count counter\n");
        append_counter_lines(&mut output, "relay_ws_duration_ms_count", &self.ws_duration_count);

        output.push_str(
            "# HELP relay_ws_duration_ms_sum Cumulative WebSocket call latency by endpoint.\n",
        );
        output.push_str("# TYPE relay_ws_duration_ms_sum counter\n");
        append_counter_lines(&mut output, "relay_ws_duration_ms_sum", &self.ws_duration_sum_ms);

        output.push_str("# HELP relay_sessions_created_total Sessions created.\n");
        output.push_str("# TYPE relay_sessions_created_total counter\n");
        output.push_str(&format!(
            "relay_sessions_created_total {}\n",
            self.sessions_created_total.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP relay_sessions_destroyed_total Sessions destroyed.\n");
        output.push_str("# TYPE relay_sessions_destroyed_total counter\n");
        output.push_str(&format!(
            "relay_sessions_destroyed_total {}\n",
            self.sessions_destroyed_total.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP relay_sessions_reaped_total Sessions removed for inactivity.\n");
        output.push_str("# TYPE relay_sessions_reaped_total counter\n");
        output.push_str(&format!(
            "relay_sessions_reaped_total {}\n",
            self.sessions_reaped_total.load(Ordering::SeqCst)
        ));

        output
    }
}

fn normalize_ws_endpoint(endpoint: &str) -> String {
    if WS_ENDPOINTS.contains(&endpoint) {
        endpoint.to_string()
    } else {
        UNKNOWN_ENDPOINT_LABEL.to_string()
    }
}

fn increment_counter(map: &Mutex<HashMap<String, u64>>, key: &str, delta: u64) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(key.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(output: &mut String, name: &str, map: &Mutex<HashMap<String, u64>>) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<(&String, &u64)> = guard.iter().collect();
    entries.sort_by_key(|(key, _)| key.as_str());
    for (endpoint, value) in entries {
        output.push_str(&format!("{name}{{endpoint=\"{endpoint}\"}} {value}\n"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_requests_accumulate_by_endpoint() {
        let metrics = RelayMetrics::default();
        metrics.record_ws_request("send_message", false, 3);
        metrics.record_ws_request("send_message", true, 7);
        metrics.record_ws_request("join_session", false, 1);

        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("relay_ws_rate_total{endpoint=\"send_message\"} 2"));
        assert!(rendered.contains("relay_ws_errors_total{endpoint=\"send_message\"} 1"));
        assert!(rendered.contains("relay_ws_duration_ms_sum{endpoint=\"send_message\"} 10"));
        assert!(rendered.contains("relay_ws_rate_total{endpoint=\"join_session\"} 1"));
    }

    #[test]
    fn unknown_endpoints_collapse_into_one_label() {
        let metrics = RelayMetrics::default();
        metrics.record_ws_request("made_up", false, 1);
        metrics.record_ws_request("also_made_up", false, 1);

        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("relay_ws_rate_total{endpoint=\"unknown\"} 2"));
    }

    #[test]
    fn session_counters_render() {
        let metrics = RelayMetrics::default();
        metrics.sessions_created_total.fetch_add(2, Ordering::SeqCst);
        metrics.sessions_reaped_total.fetch_add(1, Ordering::SeqCst);

        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("relay_sessions_created_total 2"));
        assert!(rendered.contains("relay_sessions_destroyed_total 0"));
        assert!(rendered.contains("relay_sessions_reaped_total 1"));
    }
}
