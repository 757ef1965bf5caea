//! Maps `StreamerConfig` onto the runtime settings of each component.

use pagecast_browser::BrowserSettings;
use pagecast_core::StreamConfig;
use pagecast_pipeline::PipelineSettings;
use pagecast_scheduler::{CaptureSettings, MonitorSettings, RetryPolicy};
use pagecast_supervisor::EncoderSettings;

use crate::env::StreamerConfig;

impl StreamerConfig {
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            width: self.width,
            height: self.height,
            fps: self.fps,
            bitrate_kbps: self.bitrate_kbps,
            capture_interval_secs: self.screenshot_interval_secs,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        let base = PipelineSettings::default();
        PipelineSettings {
            stream: self.stream_config(),
            target_url: self.target_url.clone().unwrap_or_default(),
            capture: CaptureSettings {
                refresh_every: self.refresh_every_frames,
                retry: RetryPolicy {
                    max_consecutive_errors: self.max_consecutive_errors,
                    ..RetryPolicy::default()
                },
                ..CaptureSettings::default()
            },
            encoder: EncoderSettings {
                program: self.ffmpeg_path.clone(),
                ingest_url: self.rtmp_url.clone().unwrap_or_default(),
                stream_key: self.stream_key.clone(),
                ..EncoderSettings::default()
            },
            monitor: MonitorSettings {
                warn_threshold_mb: self.memory_warn_mb,
                ..MonitorSettings::default()
            },
            ..base
        }
    }

    pub fn browser_settings(&self) -> BrowserSettings {
        let base = BrowserSettings::default();
        BrowserSettings {
            executable: self.chromium_path.clone(),
            headless: self.headless,
            blocked_urls: self.block_url_patterns.clone(),
            user_agent: self.user_agent.clone().unwrap_or(base.user_agent.clone()),
            ..base
        }
    }
}
