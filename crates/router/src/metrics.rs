use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static UPSTREAM_CALLS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static BROKER_TOKEN_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static VALIDATION_FAILURES_TOTAL: OnceLock<IntCounter> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "trestle_router_http_requests_total",
                    "Router HTTP request count.",
                ),
                &["route", "method", "status"],
            )
            .expect("create trestle_router_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "trestle_router_http_request_duration_seconds",
                    "Router HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create trestle_router_http_request_duration_seconds"),
        )
    })
}

fn upstream_calls_total() -> &'static IntCounterVec {
    UPSTREAM_CALLS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "trestle_router_upstream_calls_total",
                    "Outbound calls to registered data sources.",
                ),
                &["source_kind", "outcome"],
            )
            .expect("create trestle_router_upstream_calls_total"),
        )
    })
}

fn broker_token_requests_total() -> &'static IntCounterVec {
    BROKER_TOKEN_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "trestle_router_broker_token_requests_total",
                    "Credential broker token acquisitions.",
                ),
                &["outcome"],
            )
            .expect("create trestle_router_broker_token_requests_total"),
        )
    })
}

fn validation_failures_total() -> &'static IntCounter {
    VALIDATION_FAILURES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "trestle_router_validation_failures_total",
                "Queries rejected by the validator.",
            )
            .expect("create trestle_router_validation_failures_total"),
        )
    })
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

pub fn observe_upstream_call(source_kind: &str, outcome: &str) {
    upstream_calls_total()
        .with_label_values(&[source_kind, outcome])
        .inc();
}

pub fn observe_broker_token_request(outcome: &str) {
    broker_token_requests_total()
        .with_label_values(&[outcome])
        .inc();
}

pub fn inc_validation_failure() {
    validation_failures_total().inc();
}

/// Registers every collector and seeds the label sets with a fixed vocabulary,
/// so each metric family appears at zero on a fresh process. Vec collectors
/// emit nothing until at least one labeled child exists.
fn touch_collectors() {
    let _ = http_requests_total();
    let _ = http_request_duration_seconds();
    let _ = validation_failures_total();

    for kind in ["warehouse", "legacy"] {
        for outcome in ["ok", "error"] {
            let _ = upstream_calls_total().with_label_values(&[kind, outcome]);
        }
    }
    for outcome in ["ok", "error"] {
        let _ = broker_token_requests_total().with_label_values(&[outcome]);
    }
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    touch_collectors();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_exposes_every_family_before_any_traffic() {
        let (buffer, content_type) = render().unwrap();
        let body = String::from_utf8(buffer).unwrap();

        assert!(content_type.starts_with("text/plain"));
        for family in [
            "trestle_router_upstream_calls_total",
            "trestle_router_broker_token_requests_total",
            "trestle_router_validation_failures_total",
        ] {
            assert!(body.contains(family), "missing {}", family);
        }
    }
}
