//! Prometheus metrics served on `GET /metrics`
//!
//! Metrics live in a worker-private registry. Registration failure is logged
//! once and turns every recorder into a no-op; metrics never fail a request.

use once_cell::sync::Lazy;
use prometheus::{
    exponential_buckets, Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use tracing::warn;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static METRICS: Lazy<Option<WorkerMetrics>> = Lazy::new(|| match WorkerMetrics::register(&REGISTRY) {
    Ok(metrics) => Some(metrics),
    Err(e) => {
        warn!(error = %e, "Failed to register metrics, recording disabled");
        None
    }
});

struct WorkerMetrics {
    provision_total: IntCounterVec,
    provision_duration_seconds: Histogram,
    ttl_updates_total: IntCounterVec,
    reregistrations_total: IntCounterVec,
    shared_secret_fetches_total: IntCounterVec,
}

impl WorkerMetrics {
    fn register(registry: &Registry) -> prometheus::Result<Self> {
        // COUNTER
        let provision_total = IntCounterVec::new(
            Opts::new(
                "windlass_provision_total",
                "Provisioning runs by outcome.",
            ),
            &["result"],
        )?;
        let ttl_updates_total = IntCounterVec::new(
            Opts::new(
                "windlass_ttl_updates_total",
                "TTL check updates sent to the registry.",
            ),
            &["kind", "status"],
        )?;
        let reregistrations_total = IntCounterVec::new(
            Opts::new(
                "windlass_reregistrations_total",
                "Self-healing re-registrations after a missing check.",
            ),
            &["kind"],
        )?;
        let shared_secret_fetches_total = IntCounterVec::new(
            Opts::new(
                "windlass_shared_secret_fetches_total",
                "Shared secret read attempts by outcome.",
            ),
            &["result"],
        )?;

        // HISTOGRAM
        let provision_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "windlass_provision_duration_seconds",
                "Wall time of a provisioning run.",
            )
            .buckets(exponential_buckets(0.25, 2.0, 10)?),
        )?;

        registry.register(Box::new(provision_total.clone()))?;
        registry.register(Box::new(provision_duration_seconds.clone()))?;
        registry.register(Box::new(ttl_updates_total.clone()))?;
        registry.register(Box::new(reregistrations_total.clone()))?;
        registry.register(Box::new(shared_secret_fetches_total.clone()))?;

        Ok(Self {
            provision_total,
            provision_duration_seconds,
            ttl_updates_total,
            reregistrations_total,
            shared_secret_fetches_total,
        })
    }
}

/// Record a finished provisioning run (`success`, `conflict`, `invalid` or a step label)
pub fn record_provision(result: &str, duration_secs: f64) {
    if let Some(m) = METRICS.as_ref() {
        m.provision_total.with_label_values(&[result]).inc();
        m.provision_duration_seconds.observe(duration_secs);
    }
}

/// Record a TTL update for a `worker` or `project` check
pub fn record_ttl_update(kind: &str, status: &str) {
    if let Some(m) = METRICS.as_ref() {
        m.ttl_updates_total.with_label_values(&[kind, status]).inc();
    }
}

/// Record a self-healing re-registration
pub fn record_reregistration(kind: &str) {
    if let Some(m) = METRICS.as_ref() {
        m.reregistrations_total.with_label_values(&[kind]).inc();
    }
}

/// Record one shared secret read attempt
pub fn record_secret_fetch(found: bool) {
    if let Some(m) = METRICS.as_ref() {
        let result = if found { "found" } else { "missing" };
        m.shared_secret_fetches_total
            .with_label_values(&[result])
            .inc();
    }
}

/// Render all metrics in the Prometheus text exposition format
pub fn render() -> Result<String, prometheus::Error> {
    Lazy::force(&METRICS);
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
