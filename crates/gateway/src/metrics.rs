use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static STAGE_OUTCOMES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static STAGE_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static AUDIT_ENQUEUE_FAILURES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static REDACTIONS_TOTAL: OnceLock<IntCounter> = OnceLock::new();

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
                    "qgate_gateway_http_requests_total",
                    "Gateway HTTP request count.",
                ),
                &["route", "method", "status"],
            )
            .expect("create qgate_gateway_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "qgate_gateway_http_request_duration_seconds",
                    "Gateway HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create qgate_gateway_http_request_duration_seconds"),
        )
    })
}

fn stage_outcomes_total() -> &'static IntCounterVec {
    STAGE_OUTCOMES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "qgate_stage_outcomes_total",
                    "Pipeline stage outcomes by stage and error kind.",
                ),
                &["stage", "outcome"],
            )
            .expect("create qgate_stage_outcomes_total"),
        )
    })
}

fn stage_duration_seconds() -> &'static HistogramVec {
    STAGE_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "qgate_stage_duration_seconds",
                    "Pipeline stage duration in seconds.",
                )
                .buckets(vec![
                    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
                ]),
                &["stage"],
            )
            .expect("create qgate_stage_duration_seconds"),
        )
    })
}

fn audit_enqueue_failures_total() -> &'static IntCounterVec {
    AUDIT_ENQUEUE_FAILURES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "qgate_audit_enqueue_failures_total",
                    "Audit records the queue refused.",
                ),
                &["reason"],
            )
            .expect("create qgate_audit_enqueue_failures_total"),
        )
    })
}

fn redactions_total() -> &'static IntCounter {
    REDACTIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "qgate_sanitizer_redacted_columns_total",
                "Columns redacted or masked by the output sanitizer.",
            )
            .expect("create qgate_sanitizer_redacted_columns_total"),
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

/// `outcome` is `"ok"` or an error kind such as `"AUTHORIZATION"`.
pub fn observe_stage(stage: &str, outcome: &str, duration: Duration) {
    stage_outcomes_total()
        .with_label_values(&[stage, outcome])
        .inc();
    stage_duration_seconds()
        .with_label_values(&[stage])
        .observe(duration.as_secs_f64());
}

pub fn inc_audit_enqueue_failure(reason: &str) {
    audit_enqueue_failures_total()
        .with_label_values(&[reason])
        .inc();
}

pub fn add_redacted_columns(count: usize) {
    redactions_total().inc_by(count as u64);
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = redactions_total();

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
    fn render_exposes_registered_families() {
        observe_stage("sql_validator", "SQL_VALIDATION", Duration::from_millis(2));
        inc_audit_enqueue_failure("backpressure");

        let (body, content_type) = render().expect("render should succeed");
        let text = String::from_utf8(body).expect("metrics should be utf-8");
        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("qgate_stage_outcomes_total"));
        assert!(text.contains("qgate_audit_enqueue_failures_total"));
        assert!(text.contains("qgate_sanitizer_redacted_columns_total"));
    }
}
