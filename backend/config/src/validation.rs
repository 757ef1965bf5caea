//! Load-time validation with user-friendly messages.
//!
//! Errors block `serve`; warnings describe settings that will make `start()`
//! refuse or that leave the control surface disabled.

use thiserror::Error;
use url::Url;

use crate::env::StreamerConfig;

/// A config validation error with variable name and message.
#[derive(Debug, Error)]
#[error("Config validation error at '{path}': {message}")]
pub struct ConfigValidationError {
    pub path: String,
    pub message: String,
}

/// A collection of validation errors found in one pass.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }

    fn warn(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }

    /// Emit every entry through `tracing`.
    pub fn log(&self) {
        for warning in &self.warnings {
            tracing::warn!(path = %warning.path, message = %warning.message, "Config warning");
        }
        for error in &self.errors {
            tracing::error!(path = %error.path, message = %error.message, "Config error");
        }
    }
}

pub fn validate(config: &StreamerConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    validate_target(config, &mut report);
    validate_ingest(config, &mut report);
    validate_stream(config, &mut report);
    validate_control(config, &mut report);
    report
}

fn validate_target(config: &StreamerConfig, report: &mut ValidationReport) {
    let Some(target) = &config.target_url else {
        report.error("TARGET_URL", "Target page URL is required");
        return;
    };
    match Url::parse(target) {
        Ok(url) if matches!(url.scheme(), "http" | "https" | "file") => {}
        Ok(url) => report.warn(
            "TARGET_URL",
            format!("Unusual scheme '{}' for a capture target", url.scheme()),
        ),
        Err(e) => report.error("TARGET_URL", format!("Not a valid URL: {e}")),
    }
}

fn validate_ingest(config: &StreamerConfig, report: &mut ValidationReport) {
    match &config.rtmp_url {
        None => report.error("YOUTUBE_RTMP_URL", "RTMP ingest URL is required"),
        Some(rtmp) => {
            if !(rtmp.starts_with("rtmp://") || rtmp.starts_with("rtmps://")) {
                report.error(
                    "YOUTUBE_RTMP_URL",
                    "Ingest URL must start with rtmp:// or rtmps://",
                );
            }
        }
    }
    if config.stream_key.is_none() {
        report.warn(
            "YOUTUBE_STREAM_KEY",
            "Stream key is not set; starting a stream will be refused",
        );
    }
}

fn validate_stream(config: &StreamerConfig, report: &mut ValidationReport) {
    if config.width == 0 || config.height == 0 {
        report.warn("STREAM_WIDTH", "Stream dimensions must be positive; start() will refuse");
    }
    if config.fps == 0 {
        report.warn("STREAM_FPS", "Frame rate must be positive; start() will refuse");
    }
    if !config.screenshot_interval_secs.is_finite() || config.screenshot_interval_secs <= 0.0 {
        report.warn(
            "SCREENSHOT_INTERVAL",
            "Capture interval must be a positive number of seconds; start() will refuse",
        );
    }
    if config.max_consecutive_errors == 0 {
        report.warn(
            "MAX_CONSECUTIVE_ERRORS",
            "A zero threshold reloads the page after every failed capture",
        );
    }
}

fn validate_control(config: &StreamerConfig, report: &mut ValidationReport) {
    if config.access_keyword.is_empty() {
        report.warn(
            "ACCESS_KEYWORD",
            "No access keyword configured; remote start/stop/status are disabled",
        );
    }
    if config.port < 1024 && config.port != 80 && config.port != 443 {
        report.warn(
            "PORT",
            format!(
                "Port {} requires elevated privileges; consider using a port >= 1024",
                config.port
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> StreamerConfig {
        StreamerConfig {
            target_url: Some("https://example.com".into()),
            rtmp_url: Some("rtmp://a.rtmp.youtube.com/live2".into()),
            stream_key: Some("key".into()),
            access_keyword: "kw".into(),
            ..Default::default()
        }
    }

    #[test]
    fn complete_config_is_clean() {
        let report = validate(&complete());
        assert!(report.is_valid());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn missing_urls_are_errors() {
        let report = validate(&StreamerConfig::default());
        let paths: Vec<_> = report.errors.iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"TARGET_URL"));
        assert!(paths.contains(&"YOUTUBE_RTMP_URL"));
    }

    #[test]
    fn malformed_ingest_scheme_is_error() {
        let config = StreamerConfig {
            rtmp_url: Some("https://ingest.example.com/live".into()),
            ..complete()
        };
        let report = validate(&config);
        assert!(!report.is_valid());
        assert_eq!(report.errors[0].path, "YOUTUBE_RTMP_URL");
    }

    #[test]
    fn missing_key_and_keyword_are_warnings() {
        let config = StreamerConfig {
            stream_key: None,
            access_keyword: String::new(),
            ..complete()
        };
        let report = validate(&config);
        assert!(report.is_valid());
        let paths: Vec<_> = report.warnings.iter().map(|w| w.path.as_str()).collect();
        assert_eq!(paths, vec!["YOUTUBE_STREAM_KEY", "ACCESS_KEYWORD"]);
    }

    #[test]
    fn degenerate_values_warn() {
        let config = StreamerConfig {
            fps: 0,
            screenshot_interval_secs: 0.0,
            ..complete()
        };
        let report = validate(&config);
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 2);
    }
}
