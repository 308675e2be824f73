//! Logging initialization and metrics export.

use prometheus::{Encoder, TextEncoder};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

/// Filter used when neither an explicit filter nor `RUST_LOG` is set.
pub const DEFAULT_LOG_FILTER: &str = "info,pbft=debug";

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("Invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("Failed to encode metrics: {0}")]
    Encode(#[from] prometheus::Error),

    #[error("Metrics are not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Install the global `tracing` subscriber.
///
/// `filter` takes precedence over `RUST_LOG`; without either the
/// [`DEFAULT_LOG_FILTER`] applies. Fails if a global subscriber is already set.
pub fn init_logging(filter: Option<&str>) -> Result<(), TelemetryError> {
    let env_filter = match filter {
        Some(directives) => EnvFilter::try_new(directives)?,
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    let subscriber = Registry::default().with(env_filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Render every registered metric in the Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics;

    #[test]
    fn test_encode_includes_pbft_metrics() {
        metrics::record_message_rejected("old_message");
        let text = encode_metrics().unwrap();
        assert!(text.contains("pbft_messages_rejected_total"));
        assert!(text.contains("reason=\"old_message\""));
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let result = init_logging(Some("pbft=notalevel"));
        assert!(matches!(result, Err(TelemetryError::Filter(_))));
    }
}
