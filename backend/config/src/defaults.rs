//! Config defaults applied when a variable is unset or empty.

pub const DEFAULT_WIDTH: u32 = 1920;
pub const DEFAULT_HEIGHT: u32 = 1080;
pub const DEFAULT_FPS: u32 = 30;
pub const DEFAULT_BITRATE_KBPS: u32 = 8000;
pub const DEFAULT_SCREENSHOT_INTERVAL_SECS: f64 = 10.0;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

pub const DEFAULT_CHROMIUM_PATH: &str = "chromium";
pub const DEFAULT_FFMPEG_PATH: &str = "ffmpeg";

/// Consecutive capture failures before a recovery reload.
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Maintenance reload period in written frames.
pub const DEFAULT_REFRESH_EVERY_FRAMES: u64 = 100;

pub const DEFAULT_MEMORY_WARN_MB: u64 = 1000;

pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Delay between boot and the automatic session start.
pub const AUTO_START_DELAY_SECS: u64 = 10;
