use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StreamError;

/// Lifecycle of the single stream session owned by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Starting,
    Active,
    Stopping,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Stopping => "stopping",
            SessionState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Output geometry shared by the renderer viewport and the encoder scaler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Immutable stream parameters snapshotted at session start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub width: u32,
    pub height: u32,
    /// Output frame rate pushed to the ingest endpoint.
    pub fps: u32,
    /// Requested video bitrate in kbps, before the resolution floor applies.
    pub bitrate_kbps: u32,
    /// Seconds between two page snapshots.
    pub capture_interval_secs: f64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            bitrate_kbps: 8000,
            capture_interval_secs: 10.0,
        }
    }
}

impl StreamConfig {
    /// Reject degenerate values before anything is provisioned.
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.width == 0 || self.height == 0 {
            return Err(StreamError::Config(format!(
                "stream dimensions must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        if self.fps == 0 {
            return Err(StreamError::Config("fps must be positive".into()));
        }
        if !self.capture_interval_secs.is_finite() || self.capture_interval_secs <= 0.0 {
            return Err(StreamError::Config(format!(
                "capture interval must be a positive number of seconds, got {}",
                self.capture_interval_secs
            )));
        }
        Ok(())
    }

    pub fn viewport(&self) -> Viewport {
        Viewport {
            width: self.width,
            height: self.height,
        }
    }

    /// Only meaningful after `validate` succeeded.
    pub fn capture_interval(&self) -> Duration {
        Duration::from_secs_f64(self.capture_interval_secs)
    }

    /// Rate at which frames enter the encoder: one per capture interval.
    pub fn input_frame_rate(&self) -> f64 {
        1.0 / self.capture_interval_secs
    }
}

/// One captured snapshot on its way to the encoder.
#[derive(Debug)]
pub struct Frame {
    pub seq: u64,
    pub captured_at: DateTime<Utc>,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(seq: u64, data: Vec<u8>) -> Self {
        Self {
            seq,
            captured_at: Utc::now(),
            data,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Result of handing a frame to the encoder input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Every byte reached the encoder pipe.
    Written,
    /// The pipe stayed saturated for the whole stall budget; the frame was
    /// discarded without a single byte written.
    Dropped,
    /// The handle is closed; nothing was written.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clip {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScreenshotOptions {
    /// Restrict the capture to a region of the viewport.
    pub clip: Option<Clip>,
    pub optimize_for_speed: bool,
}

impl ScreenshotOptions {
    pub fn full_viewport() -> Self {
        Self {
            clip: None,
            optimize_for_speed: true,
        }
    }

    /// Small throwaway capture used to warm up the screenshot path.
    pub fn warmup() -> Self {
        Self {
            clip: Some(Clip {
                x: 0,
                y: 0,
                width: 100,
                height: 100,
            }),
            optimize_for_speed: true,
        }
    }
}

/// Progress fields parsed from the encoder status stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EncoderTelemetry {
    pub fps: Option<f64>,
    pub bitrate: Option<String>,
    pub time: Option<String>,
    pub speed: Option<String>,
    pub observed_at: Option<DateTime<Utc>>,
}

/// Messages flowing from the encoder's reader/reaper tasks to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum EncoderEvent {
    Telemetry(EncoderTelemetry),
    /// The subprocess is gone. `code` is `None` when it died from a signal.
    Exited { code: Option<i32> },
}

/// Timestamped memory measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceSample {
    pub at: DateTime<Utc>,
    pub rss_bytes: u64,
}

impl ResourceSample {
    pub fn rss_mb(&self) -> u64 {
        self.rss_bytes / (1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(StreamConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_dimensions_rejected() {
        let config = StreamConfig {
            width: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(StreamError::Config(_))));
        let config = StreamConfig {
            height: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn degenerate_intervals_rejected() {
        for interval in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let config = StreamConfig {
                capture_interval_secs: interval,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "interval {interval} accepted");
        }
    }

    #[test]
    fn input_rate_is_inverse_of_interval() {
        let config = StreamConfig {
            capture_interval_secs: 0.5,
            fps: 30,
            ..Default::default()
        };
        assert!((config.input_frame_rate() - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.capture_interval(), Duration::from_millis(500));
        assert_eq!(config.fps, 30);
    }

    #[test]
    fn state_displays_lowercase() {
        assert_eq!(SessionState::Stopping.to_string(), "stopping");
        assert_eq!(SessionState::default(), SessionState::Idle);
    }
}
