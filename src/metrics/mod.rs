//! Metrics collection for observability

use prometheus::{
    register_counter_vec_with_registry, register_counter_with_registry,
    register_histogram_vec_with_registry, register_histogram_with_registry, Counter, CounterVec,
    Histogram, HistogramVec, Opts, Registry,
};
use once_cell::sync::Lazy;
use std::sync::Arc;

/// Global metrics registry
pub static METRICS: Lazy<Arc<Metrics>> =
    Lazy::new(|| Arc::new(Metrics::new().expect("Failed to initialize metrics")));

/// Metrics collector
pub struct Metrics {
    registry: Registry,

    // Context compression
    pub context_compressions: Counter,
    pub context_tokens_before: Histogram,
    pub context_tokens_after: Histogram,
    pub block_summaries: CounterVec,

    // Research workflow
    pub stage_transitions: CounterVec,
    pub research_steps: CounterVec,
    pub step_duration: Histogram,
    pub sessions: CounterVec,

    // Model client
    pub llm_requests: CounterVec,
    pub llm_request_duration: HistogramVec,
    pub llm_circuit_open: CounterVec,

    // Search client
    pub search_requests: CounterVec,
    pub search_cache_hits: Counter,
    pub search_cache_misses: Counter,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let context_compressions = register_counter_with_registry!(
            Opts::new("context_compressions_total", "Histories compressed to fit the token budget"),
            registry
        )?;

        let context_tokens_before = register_histogram_with_registry!(
            "context_tokens_before",
            "Estimated history cost before compression",
            vec![512.0, 2048.0, 8192.0, 16384.0, 32768.0, 65536.0, 131072.0],
            registry
        )?;

        let context_tokens_after = register_histogram_with_registry!(
            "context_tokens_after",
            "Estimated history cost after compression",
            vec![512.0, 2048.0, 8192.0, 16384.0, 32768.0, 65536.0, 131072.0],
            registry
        )?;

        let block_summaries = register_counter_vec_with_registry!(
            Opts::new("context_block_summaries_total", "Dialogue block summarizations"),
            &["status"],
            registry
        )?;

        let stage_transitions = register_counter_vec_with_registry!(
            Opts::new("research_stage_transitions_total", "Orchestrator stage entries"),
            &["stage"],
            registry
        )?;

        let research_steps = register_counter_vec_with_registry!(
            Opts::new("research_steps_total", "Executed plan steps"),
            &["status"],
            registry
        )?;

        let step_duration = register_histogram_with_registry!(
            "research_step_duration_seconds",
            "Wall time of one research step",
            vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0],
            registry
        )?;

        let sessions = register_counter_vec_with_registry!(
            Opts::new("research_sessions_total", "Research sessions by outcome"),
            &["outcome"],
            registry
        )?;

        let llm_requests = register_counter_vec_with_registry!(
            Opts::new("llm_requests_total", "Chat model requests"),
            &["operation", "status"],
            registry
        )?;

        let llm_request_duration = register_histogram_vec_with_registry!(
            "llm_request_duration_seconds",
            "Chat model request duration in seconds",
            &["operation"],
            registry
        )?;

        let llm_circuit_open = register_counter_vec_with_registry!(
            Opts::new("llm_circuit_open_total", "Model calls rejected by an open breaker"),
            &["operation"],
            registry
        )?;

        let search_requests = register_counter_vec_with_registry!(
            Opts::new("search_requests_total", "Web search requests"),
            &["status"],
            registry
        )?;

        let search_cache_hits = register_counter_with_registry!(
            Opts::new("search_cache_hits_total", "Search queries served from cache"),
            registry
        )?;

        let search_cache_misses = register_counter_with_registry!(
            Opts::new("search_cache_misses_total", "Search queries sent upstream"),
            registry
        )?;

        Ok(Self {
            registry,
            context_compressions,
            context_tokens_before,
            context_tokens_after,
            block_summaries,
            stage_transitions,
            research_steps,
            step_duration,
            sessions,
            llm_requests,
            llm_request_duration,
            llm_circuit_open,
            search_requests,
            search_cache_hits,
            search_cache_misses,
        })
    }

    /// Get the metrics registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record one compression pass
    pub fn record_compression(&self, before: usize, after: usize) {
        self.context_compressions.inc();
        self.context_tokens_before.observe(before as f64);
        self.context_tokens_after.observe(after as f64);
    }

    pub fn record_block_summary(&self, success: bool) {
        let status = if success { "success" } else { "placeholder" };
        self.block_summaries.with_label_values(&[status]).inc();
    }

    pub fn record_stage(&self, stage: &str) {
        self.stage_transitions.with_label_values(&[stage]).inc();
    }

    pub fn record_step(&self, success: bool, seconds: f64) {
        let status = if success { "completed" } else { "error" };
        self.research_steps.with_label_values(&[status]).inc();
        self.step_duration.observe(seconds);
    }

    pub fn record_session(&self, outcome: &str) {
        self.sessions.with_label_values(&[outcome]).inc();
    }

    /// Record a model request outcome and its duration
    pub fn record_llm_request(&self, operation: &str, success: bool, seconds: f64) {
        let status = if success { "success" } else { "error" };
        self.llm_requests.with_label_values(&[operation, status]).inc();
        self.llm_request_duration
            .with_label_values(&[operation])
            .observe(seconds);
    }

    pub fn record_search(&self, success: bool) {
        let status = if success { "success" } else { "error" };
        self.search_requests.with_label_values(&[status]).inc();
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }

        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        let metrics = Metrics::new();
        assert!(metrics.is_ok());
    }

    #[test]
    fn test_record_compression() {
        let metrics = Metrics::new().unwrap();
        metrics.record_compression(40000, 12000);
        metrics.record_block_summary(true);
        metrics.record_block_summary(false);

        let text = metrics.export_prometheus();
        assert!(text.contains("context_compressions_total 1"));
        assert!(text.contains("context_block_summaries_total{status=\"placeholder\"} 1"));
    }

    #[test]
    fn test_export_includes_llm_labels() {
        let metrics = Metrics::new().unwrap();
        metrics.record_llm_request("plan", true, 0.4);
        metrics.record_llm_request("plan", false, 1.2);

        let text = metrics.export_prometheus();
        assert!(text.contains("llm_requests_total{operation=\"plan\",status=\"success\"} 1"));
        assert!(text.contains("llm_request_duration_seconds"));
    }
}
