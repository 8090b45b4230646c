//! Prometheus metrics for dispatch and communication observability.

use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use std::sync::OnceLock;
use tracing::warn;

/// Global metrics registry
static REGISTRY: OnceLock<Option<MetricsRegistry>> = OnceLock::new();

/// Collection of all MoE data-movement metrics
pub struct MetricsRegistry {
    pub registry: Registry,

    // Communication metrics
    pub all_to_all_seconds: Histogram,
    pub all_to_all_bytes: Counter,

    // Dispatch metrics
    pub kernel_builds: Counter,
    pub tokens_dispatched: Counter,
    pub tokens_dropped: Counter,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let all_to_all_seconds = Histogram::with_opts(
            HistogramOpts::new("moe_all_to_all_seconds", "Time spent in timed all-to-all exchanges")
                .buckets(vec![0.0001, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;
        registry.register(Box::new(all_to_all_seconds.clone()))?;

        let all_to_all_bytes = Counter::with_opts(
            Opts::new("moe_all_to_all_bytes_total", "Bytes handed to timed all-to-all exchanges"),
        )?;
        registry.register(Box::new(all_to_all_bytes.clone()))?;

        let kernel_builds = Counter::with_opts(
            Opts::new("moe_kernel_builds_total", "Dispatch kernel bundles built"),
        )?;
        registry.register(Box::new(kernel_builds.clone()))?;

        let tokens_dispatched = Counter::with_opts(
            Opts::new("moe_tokens_dispatched_total", "Routing choices that landed in a slot"),
        )?;
        registry.register(Box::new(tokens_dispatched.clone()))?;

        let tokens_dropped = Counter::with_opts(
            Opts::new("moe_tokens_dropped_total", "Routing choices dropped by capacity overflow"),
        )?;
        registry.register(Box::new(tokens_dropped.clone()))?;

        Ok(Self {
            registry,
            all_to_all_seconds,
            all_to_all_bytes,
            kernel_builds,
            tokens_dispatched,
            tokens_dropped,
        })
    }

    /// Gather all metrics as Prometheus text format.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Get the global metrics registry, `None` if registration failed.
pub fn get_metrics() -> Option<&'static MetricsRegistry> {
    REGISTRY
        .get_or_init(|| match MetricsRegistry::new() {
            Ok(registry) => Some(registry),
            Err(e) => {
                warn!(error = %e, "Metrics registry unavailable");
                None
            }
        })
        .as_ref()
}

/// Record one timed all-to-all exchange.
pub fn record_all_to_all(duration_secs: f64, bytes: usize) {
    if let Some(m) = get_metrics() {
        m.all_to_all_seconds.observe(duration_secs);
        m.all_to_all_bytes.inc_by(bytes as f64);
    }
}

/// Record a kernel bundle build.
pub fn record_kernel_build() {
    if let Some(m) = get_metrics() {
        m.kernel_builds.inc();
    }
}

/// Record the placement outcome of one routing assignment.
pub fn record_routing(dispatched: usize, dropped: usize) {
    if let Some(m) = get_metrics() {
        m.tokens_dispatched.inc_by(dispatched as f64);
        m.tokens_dropped.inc_by(dropped as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() -> prometheus::Result<()> {
        let metrics = MetricsRegistry::new()?;
        metrics.all_to_all_seconds.observe(0.002);
        metrics.tokens_dropped.inc_by(3.0);

        let output = metrics.gather();
        assert!(output.contains("moe_all_to_all_seconds"));
        assert!(output.contains("moe_tokens_dropped_total 3"));
        Ok(())
    }

    #[test]
    fn test_record_routing() {
        record_routing(10, 2);

        let output = get_metrics().map(|m| m.gather()).unwrap_or_default();
        assert!(output.contains("moe_tokens_dispatched_total"));
    }
}
