//! Logging setup for the sandbox engine.
//!
//! # Noise Filtering
//!
//! Transport modules used by the Docker client (hyper, h2, bollard,
//! tokio_util) are set to `warn` so sandbox lifecycle logs stay readable.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Modules filtered to warn level by default.
pub const NOISY_MODULES: &[&str] = &["hyper", "hyper_util", "bollard", "h2", "tokio_util"];

/// Filter directives for a base level, without consulting `RUST_LOG`.
fn directives(log_level: &str) -> String {
    let mut directives = String::from(log_level);
    for module in NOISY_MODULES {
        directives.push_str(&format!(",{module}=warn"));
    }
    directives
}

/// Build the EnvFilter. `RUST_LOG` wins when set.
fn build_filter(log_level: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    EnvFilter::new(directives(log_level))
}

/// Initialize logging.
///
/// * `log_level` - Base log level (trace, debug, info, warn, error)
/// * `log_format` - `"json"` for structured output, anything else for pretty
///
/// Calling this again after a subscriber is installed is a no-op.
pub fn init_logging(log_level: &str, log_format: &str) {
    let subscriber = tracing_subscriber::registry().with(build_filter(log_level));

    let installed = if log_format == "json" {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(std::io::stderr);
        subscriber.with(fmt_layer).try_init().is_ok()
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
            .with_writer(std::io::stderr);
        subscriber.with(fmt_layer).try_init().is_ok()
    };

    if installed {
        tracing::debug!(
            log_level = %log_level,
            log_format = %log_format,
            noise_filtered = NOISY_MODULES.len(),
            "Logging initialized"
        );
    }
}
