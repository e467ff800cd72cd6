//! Prometheus metrics recording and endpoint.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(PrometheusBuilder::new().install_recorder()?)
}

/// Record a subscriber attaching to a session channel.
pub fn record_subscribe() {
    metrics::gauge!("statewire_subscribers_active").increment(1.0);
}

/// Record a subscriber going away.
pub fn record_unsubscribe() {
    metrics::gauge!("statewire_subscribers_active").decrement(1.0);
}

/// Record a sequenced event fanned out by a channel.
pub fn record_event(kind: &str) {
    let labels = [("kind", kind.to_string())];
    metrics::counter!("statewire_events_published_total", &labels).increment(1);
}

/// Record a subscriber dropped for exceeding its buffer watermark.
pub fn record_overflow() {
    metrics::counter!("statewire_subscriber_overflows_total").increment(1);
}

/// Record an override folded into canonical state.
pub fn record_override_accepted() {
    metrics::counter!("statewire_overrides_total", "outcome" => "accepted").increment(1);
}

/// Record an override refused with error `code`.
pub fn record_override_rejected(code: &str) {
    let labels = [("outcome", "rejected".to_string()), ("code", code.to_string())];
    metrics::counter!("statewire_overrides_total", &labels).increment(1);
}
