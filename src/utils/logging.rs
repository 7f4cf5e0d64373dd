//! Subscriber setup for routing diagnostics.
//!
//! Layers log construction at `info`. Every forward pass logs capacity, drops
//! and fallback counts at `debug` under `hier_moe::model`, and every all-to-all
//! logs its sizes at `trace` under `hier_moe::distributed::exchange`. In-process
//! ranks run on their own threads, so the pretty format prints thread ids to
//! tell them apart.

use tracing_subscriber::{fmt, EnvFilter};

/// Logging format options
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogFormat {
    /// Human-readable, one block per event, thread ids shown
    Pretty,
    /// One JSON object per event, span fields flattened
    Json,
    /// Single line per event
    Compact,
}

/// Directive enabling per-pass routing events on top of `info`.
const ROUTING_DIRECTIVES: &str = "info,hier_moe::model=debug,hier_moe::distributed::exchange=trace";

/// Filter from `RUST_LOG`, falling back to `info`, or to the routing
/// directives when `routing_detail` is set.
pub fn routing_filter(routing_detail: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if routing_detail {
            EnvFilter::new(ROUTING_DIRECTIVES)
        } else {
            EnvFilter::new("info")
        }
    })
}

/// Pretty output at `info`.
pub fn init_logging() {
    init_logging_with_format(LogFormat::Pretty);
}

/// Install a global subscriber in `format`, level from `RUST_LOG`.
///
/// Later calls keep the first subscriber.
pub fn init_logging_with_format(format: LogFormat) {
    install(format, routing_filter(false));
}

fn install(format: LogFormat, filter: EnvFilter) {
    let _ = match format {
        LogFormat::Pretty => fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .try_init(),
        LogFormat::Json => fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(true)
            .flatten_event(true)
            .try_init(),
        LogFormat::Compact => fmt()
            .with_env_filter(filter)
            .compact()
            .with_target(false)
            .try_init(),
    };
}

/// Parse a format name as accepted by `MOE_LOG_FORMAT`.
pub fn parse_log_format(value: &str) -> LogFormat {
    match value.to_lowercase().as_str() {
        "json" => LogFormat::Json,
        "compact" => LogFormat::Compact,
        _ => LogFormat::Pretty,
    }
}

/// Configure from the environment.
///
/// `MOE_LOG_FORMAT` picks `json`, `compact` or pretty. `MOE_LOG_ROUTING=1`
/// turns on the per-pass routing events when `RUST_LOG` is unset.
pub fn init_logging_from_env() {
    let format = std::env::var("MOE_LOG_FORMAT")
        .map(|s| parse_log_format(&s))
        .unwrap_or(LogFormat::Pretty);
    let routing_detail = std::env::var("MOE_LOG_ROUTING")
        .map(|v| matches!(v.as_str(), "1" | "true"))
        .unwrap_or(false);

    install(format, routing_filter(routing_detail));
}
