//! Loads `StreamerConfig` from process environment variables.
//!
//! Unset or empty variables take their defaults; a set but unparsable value
//! is a load error rather than a silent fallback.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Serialize;

use crate::defaults::*;

/// Error returned for a variable that is present but malformed.
#[derive(Debug, thiserror::Error)]
#[error("Invalid value {value:?} for {var}: {reason}")]
pub struct EnvValueError {
    pub var: String,
    pub value: String,
    pub reason: String,
}

/// Process-wide configuration, read once at startup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamerConfig {
    pub target_url: Option<String>,
    pub rtmp_url: Option<String>,
    #[serde(skip)]
    pub stream_key: Option<String>,
    #[serde(skip)]
    pub access_keyword: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub screenshot_interval_secs: f64,
    pub port: u16,
    pub bind_address: String,
    pub headless: bool,
    pub auto_start: bool,
    pub chromium_path: String,
    pub ffmpeg_path: String,
    pub max_consecutive_errors: u32,
    pub refresh_every_frames: u64,
    pub memory_warn_mb: u64,
    pub block_url_patterns: Vec<String>,
    pub user_agent: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub log_level: String,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            target_url: None,
            rtmp_url: None,
            stream_key: None,
            access_keyword: String::new(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: DEFAULT_FPS,
            bitrate_kbps: DEFAULT_BITRATE_KBPS,
            screenshot_interval_secs: DEFAULT_SCREENSHOT_INTERVAL_SECS,
            port: DEFAULT_PORT,
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            headless: true,
            auto_start: false,
            chromium_path: DEFAULT_CHROMIUM_PATH.to_string(),
            ffmpeg_path: DEFAULT_FFMPEG_PATH.to_string(),
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
            refresh_every_frames: DEFAULT_REFRESH_EVERY_FRAMES,
            memory_warn_mb: DEFAULT_MEMORY_WARN_MB,
            block_url_patterns: Vec::new(),
            user_agent: None,
            log_dir: None,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl StreamerConfig {
    pub fn from_env() -> Result<Self, EnvValueError> {
        Self::from_env_with(&std::env::vars().collect())
    }

    /// Load from a provided map (useful for testing).
    pub fn from_env_with(env: &HashMap<String, String>) -> Result<Self, EnvValueError> {
        let vars = Vars(env);
        let d = Self::default();
        Ok(Self {
            target_url: vars.text("TARGET_URL"),
            rtmp_url: vars.text("YOUTUBE_RTMP_URL"),
            stream_key: vars.text("YOUTUBE_STREAM_KEY"),
            access_keyword: vars.text("ACCESS_KEYWORD").unwrap_or_default(),
            width: vars.number("STREAM_WIDTH", d.width)?,
            height: vars.number("STREAM_HEIGHT", d.height)?,
            fps: vars.number("STREAM_FPS", d.fps)?,
            bitrate_kbps: match vars.text("STREAM_BITRATE") {
                Some(raw) => parse_bitrate(&raw).map_err(|reason| EnvValueError {
                    var: "STREAM_BITRATE".into(),
                    value: raw.clone(),
                    reason,
                })?,
                None => d.bitrate_kbps,
            },
            screenshot_interval_secs: vars.number("SCREENSHOT_INTERVAL", d.screenshot_interval_secs)?,
            port: vars.number("PORT", d.port)?,
            bind_address: vars.text("BIND_ADDRESS").unwrap_or(d.bind_address),
            // Only an explicit "false" turns headless mode off.
            headless: vars.text("HEADLESS").as_deref() != Some("false"),
            auto_start: vars.text("AUTO_START").as_deref() == Some("true"),
            chromium_path: vars.text("CHROMIUM_PATH").unwrap_or(d.chromium_path),
            ffmpeg_path: vars.text("FFMPEG_PATH").unwrap_or(d.ffmpeg_path),
            max_consecutive_errors: vars.number("MAX_CONSECUTIVE_ERRORS", d.max_consecutive_errors)?,
            refresh_every_frames: vars.number("REFRESH_EVERY_FRAMES", d.refresh_every_frames)?,
            memory_warn_mb: vars.number("MEMORY_WARN_MB", d.memory_warn_mb)?,
            block_url_patterns: vars
                .text("BLOCK_URL_PATTERNS")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
            user_agent: vars.text("USER_AGENT"),
            log_dir: vars.text("LOG_DIR").map(PathBuf::from),
            log_level: vars.text("RUST_LOG").unwrap_or(d.log_level),
        })
    }

    /// `trim_end('/')` + `/` + key, when both halves are configured.
    pub fn ingest_endpoint(&self) -> Option<String> {
        let base = self.rtmp_url.as_deref()?;
        let key = self.stream_key.as_deref()?;
        Some(format!("{}/{}", base.trim_end_matches('/'), key))
    }
}

struct Vars<'a>(&'a HashMap<String, String>);

impl Vars<'_> {
    /// Trimmed value; empty counts as unset.
    fn text(&self, name: &str) -> Option<String> {
        self.0
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    fn number<T>(&self, name: &str, default: T) -> Result<T, EnvValueError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.text(name) {
            None => Ok(default),
            Some(raw) => raw.parse::<T>().map_err(|e| EnvValueError {
                var: name.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

/// `8000k`, `8000` → 8000 kbps; `6M` / `2.5m` → megabits × 1000.
pub fn parse_bitrate(raw: &str) -> Result<u32, String> {
    let raw = raw.trim();
    let (digits, multiplier) = match raw.char_indices().last() {
        Some((i, 'k' | 'K')) => (&raw[..i], 1.0),
        Some((i, 'm' | 'M')) => (&raw[..i], 1000.0),
        _ => (raw, 1.0),
    };
    let value: f64 = digits
        .trim()
        .parse()
        .map_err(|_| "expected a number with an optional k or M suffix".to_string())?;
    if !value.is_finite() || value <= 0.0 {
        return Err("bitrate must be positive".into());
    }
    let kbps = (value * multiplier).round();
    if kbps > f64::from(u32::MAX) {
        return Err("bitrate is out of range".into());
    }
    Ok(kbps as u32)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}
