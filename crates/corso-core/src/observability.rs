//! Observability infrastructure for Corso.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors shared by every Corso
//! component so that logs correlate across the worker fleet.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `corso_flow=debug`)
///
/// # Example
///
/// ```rust
/// use corso_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for pipeline operations with standard fields.
///
/// # Example
///
/// ```rust
/// use corso_core::observability::pipeline_span;
///
/// let span = pipeline_span("initialize", "01ARZ3NDEKTSV4RRFFQ69G5FAV", "acme-academy");
/// let _guard = span.enter();
/// // ... do pipeline operation
/// ```
#[must_use]
pub fn pipeline_span(operation: &str, course_id: &str, organization: &str) -> Span {
    tracing::info_span!(
        "pipeline",
        op = operation,
        course_id = course_id,
        organization = organization,
    )
}

/// Creates a span for worker operations.
#[must_use]
pub fn worker_span(operation: &str, queue: &str, claimant: &str) -> Span {
    tracing::info_span!(
        "worker",
        op = operation,
        queue = queue,
        claimant = claimant,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        // Should not panic (uses Once internally)
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty);
    }

    #[test]
    fn pipeline_span_records_fields() {
        let span = pipeline_span("initialize", "course-1", "acme");
        let _guard = span.enter();
        tracing::info!("test message in span");
    }
}
