use std::time::Duration;

use pagecast_core::{StreamConfig, StreamError};
use pagecast_scheduler::{CaptureSettings, MonitorSettings};
use pagecast_supervisor::EncoderSettings;

/// Everything a `Coordinator` needs, snapshotted per session at `start()`.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub stream: StreamConfig,
    pub target_url: String,
    /// `interval` is replaced by the stream's capture interval at start.
    pub capture: CaptureSettings,
    pub encoder: EncoderSettings,
    pub monitor: MonitorSettings,
    pub launch_timeout: Duration,
    pub navigate_timeout: Duration,
    pub warmup_timeout: Duration,
    pub renderer_close_timeout: Duration,
    /// How long a cancelled capture loop may take to wind down before it is
    /// abandoned.
    pub drain_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            target_url: String::new(),
            capture: CaptureSettings::default(),
            encoder: EncoderSettings::default(),
            monitor: MonitorSettings::default(),
            launch_timeout: Duration::from_secs(30),
            navigate_timeout: Duration::from_secs(15),
            warmup_timeout: Duration::from_secs(10),
            renderer_close_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl PipelineSettings {
    /// Checks run before any resource is provisioned.
    pub fn validate(&self) -> Result<(), StreamError> {
        self.stream.validate()?;
        if self.target_url.trim().is_empty() {
            return Err(StreamError::Config("target URL is not configured".into()));
        }
        if self.encoder.ingest_url.trim().is_empty() {
            return Err(StreamError::Config("ingest URL is not configured".into()));
        }
        if self.encoder.stream_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
            return Err(StreamError::Config("stream key is not configured".into()));
        }
        Ok(())
    }

    pub fn capture_for_session(&self) -> CaptureSettings {
        CaptureSettings {
            interval: self.stream.capture_interval(),
            ..self.capture.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_target_url_is_config_error() {
        let settings = PipelineSettings::default();
        assert!(matches!(settings.validate(), Err(StreamError::Config(_))));
    }

    #[test]
    fn blank_stream_key_is_config_error() {
        let mut settings = PipelineSettings {
            target_url: "https://example.com".into(),
            ..Default::default()
        };
        settings.encoder.ingest_url = "rtmp://ingest.example/live2".into();
        settings.encoder.stream_key = Some("  ".into());
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("stream key"), "{err}");
    }

    #[test]
    fn capture_interval_follows_stream() {
        let mut settings = PipelineSettings {
            target_url: "https://example.com".into(),
            stream: StreamConfig {
                capture_interval_secs: 2.5,
                ..Default::default()
            },
            ..Default::default()
        };
        settings.encoder.ingest_url = "rtmp://ingest.example/live2".into();
        settings.encoder.stream_key = Some("k".into());
        assert!(settings.validate().is_ok());
        assert_eq!(settings.capture_for_session().interval, Duration::from_millis(2500));
    }
}
