//! Prometheus metrics for routing observability.
//!
//! Mirrors the per-pass `RoutingMetadata` into process-wide counters so an
//! external scraper can watch load balance and drop rates.

use prometheus::{
    Counter, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;
#[cfg(feature = "metrics-server")]
use tracing::info;

/// Global metrics registry
static REGISTRY: OnceLock<RoutingMetrics> = OnceLock::new();

/// Collection of all routing metrics
pub struct RoutingMetrics {
    pub registry: Registry,

    // Token accounting
    pub tokens_routed: Counter,
    pub tokens_dropped: Counter,
    pub fallback_tokens: Counter,

    // Load balance
    pub expert_tokens: GaugeVec,
    pub last_capacity: Gauge,
    pub aux_loss: Histogram,

    // Communication
    pub exchange_time: Histogram,
}

impl RoutingMetrics {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        let tokens_routed = Counter::with_opts(
            Opts::new("moe_tokens_routed_total", "Token-expert assignments that found a capacity slot")
        ).expect("valid metric");
        registry.register(Box::new(tokens_routed.clone())).expect("unique metric");

        let tokens_dropped = Counter::with_opts(
            Opts::new("moe_tokens_dropped_total", "Token-expert assignments dropped by capacity")
        ).expect("valid metric");
        registry.register(Box::new(tokens_dropped.clone())).expect("unique metric");

        let fallback_tokens = Counter::with_opts(
            Opts::new("moe_fallback_tokens_total", "Tokens recomputed by the post-routing fallback")
        ).expect("valid metric");
        registry.register(Box::new(fallback_tokens.clone())).expect("unique metric");

        let expert_tokens = GaugeVec::new(
            Opts::new("moe_expert_tokens", "Tokens selecting each expert in the last pass"),
            &["expert"],
        ).expect("valid metric");
        registry.register(Box::new(expert_tokens.clone())).expect("unique metric");

        let last_capacity = Gauge::with_opts(
            Opts::new("moe_expert_capacity", "Per-expert capacity used by the last gate pass")
        ).expect("valid metric");
        registry.register(Box::new(last_capacity.clone())).expect("unique metric");

        let aux_loss = Histogram::with_opts(
            HistogramOpts::new("moe_aux_loss", "Combined auxiliary routing loss")
                .buckets(vec![0.5, 0.9, 1.0, 1.1, 1.25, 1.5, 2.0, 4.0, 8.0])
        ).expect("valid metric");
        registry.register(Box::new(aux_loss.clone())).expect("unique metric");

        let exchange_time = Histogram::with_opts(
            HistogramOpts::new("moe_exchange_seconds", "Time spent in all-to-all exchanges")
                .buckets(vec![0.0001, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0])
        ).expect("valid metric");
        registry.register(Box::new(exchange_time.clone())).expect("unique metric");

        Self {
            registry,
            tokens_routed,
            tokens_dropped,
            fallback_tokens,
            expert_tokens,
            last_capacity,
            aux_loss,
            exchange_time,
        }
    }

    /// Gather all metrics as Prometheus text format.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for RoutingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Get the global metrics registry.
pub fn get_metrics() -> &'static RoutingMetrics {
    REGISTRY.get_or_init(RoutingMetrics::new)
}

/// Record the outcome of one capacity-constrained gate pass.
pub fn record_gate_pass(exp_counts: &[usize], routed: usize, dropped: usize, capacity: usize) {
    let m = get_metrics();
    m.tokens_routed.inc_by(routed as f64);
    m.tokens_dropped.inc_by(dropped as f64);
    m.last_capacity.set(capacity as f64);
    for (expert, &count) in exp_counts.iter().enumerate() {
        m.expert_tokens
            .with_label_values(&[&expert.to_string()])
            .set(count as f64);
    }
}

/// Record the combined auxiliary loss of a pass.
pub fn record_aux_loss(value: f64) {
    if value.is_finite() {
        get_metrics().aux_loss.observe(value);
    }
}

/// Record tokens handled by the overflow fallback.
pub fn record_fallback_tokens(count: usize) {
    get_metrics().fallback_tokens.inc_by(count as f64);
}

/// Record all-to-all time.
pub fn record_exchange_time(duration_secs: f64) {
    get_metrics().exchange_time.observe(duration_secs);
}

/// Start a simple HTTP server to expose metrics on the given port.
#[cfg(feature = "metrics-server")]
pub async fn start_metrics_server(port: u16) -> std::io::Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!(port = port, "Metrics server started");

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            let _ = socket.read(&mut buf).await;

            let metrics = get_metrics().gather();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                metrics.len(),
                metrics
            );

            let _ = socket.write_all(response.as_bytes()).await;
        });
    }
}
