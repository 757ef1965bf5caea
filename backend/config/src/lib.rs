//! `pagecast-config`: runtime configuration for the page streamer.
//!
//! Provides:
//! - `StreamerConfig` loaded from environment variables
//! - Default values
//! - Load-time validation report
//! - Redacted summary for safe logging
//! - Mapping onto pipeline and browser settings

pub mod defaults;
pub mod env;
pub mod redact;
pub mod settings;
pub mod validation;

pub use env::{parse_bitrate, EnvValueError, StreamerConfig};
pub use redact::{redacted_summary, HIDDEN, NOT_SET};
pub use validation::{validate, ConfigValidationError, ValidationReport};

/// Load from the process environment and log the redacted summary and any
/// validation findings.
pub fn load_and_report() -> Result<(StreamerConfig, ValidationReport), EnvValueError> {
    let config = StreamerConfig::from_env()?;
    tracing::info!(config = %redacted_summary(&config), "Streamer configuration loaded");
    let report = validate(&config);
    report.log();
    Ok((config, report))
}
