//! Encoder Status Reader
//!
//! Drains the encoder's stderr, keeps a bounded tail of it, extracts progress
//! telemetry and forwards it at a throttled rate.

use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;
use pagecast_core::{EncoderEvent, EncoderTelemetry};
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

static FPS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"fps=\s*(\d+(?:\.\d+)?)").unwrap());
static BITRATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)bitrate=\s*([0-9.]+[kmg]?bits/s)").unwrap());
static TIME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"time=\s*([0-9:.]+)").unwrap());
static SPEED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"speed=\s*([0-9.]+x)").unwrap());

/// Bounded stderr tail. Complete lines are handed out as they arrive; when
/// the pending text outgrows the cap, the older half is discarded.
#[derive(Debug)]
pub struct StatusBuffer {
    pending: String,
    cap: usize,
}

impl StatusBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            pending: String::new(),
            cap: cap.max(2),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Append a chunk and return every line it completed. ffmpeg ends
    /// progress updates with `\r`, so both terminators split.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);

        let mut lines = Vec::new();
        while let Some(end) = self.pending.find(&['\r', '\n'][..]) {
            let line: String = self.pending.drain(..=end).collect();
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }

        if self.pending.len() > self.cap {
            let mut cut = self.pending.len() - self.cap / 2;
            while !self.pending.is_char_boundary(cut) {
                cut += 1;
            }
            self.pending.drain(..cut);
        }
        lines
    }

    /// Whatever is left when the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }
}

/// Pull progress fields out of one status line. `None` unless the line is a
/// progress update carrying at least fps, bitrate or time.
pub fn parse_telemetry(line: &str) -> Option<EncoderTelemetry> {
    if !line.contains("fps=") {
        return None;
    }
    let fps = first_group(&FPS_RE, line).and_then(|v| v.parse::<f64>().ok());
    let bitrate = first_group(&BITRATE_RE, line);
    let time = first_group(&TIME_RE, line);
    if fps.is_none() && bitrate.is_none() && time.is_none() {
        return None;
    }
    Some(EncoderTelemetry {
        fps,
        bitrate,
        time,
        speed: first_group(&SPEED_RE, line),
        observed_at: Some(Utc::now()),
    })
}

fn first_group(re: &Regex, line: &str) -> Option<String> {
    re.captures(line).map(|c| c[1].to_string())
}

/// Rough classification used to pick a log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    Error,
    Progress,
    Endpoint,
    Info,
    Noise,
}

pub fn classify(line: &str) -> LineClass {
    if line.contains("error") || line.contains("Error") {
        LineClass::Error
    } else if line.contains("fps=") {
        LineClass::Progress
    } else if line.contains("rtmp://") || line.contains("rtmps://") {
        LineClass::Endpoint
    } else if line.contains("Connection to") || line.contains("Stream mapping:") {
        LineClass::Info
    } else {
        LineClass::Noise
    }
}

/// Lets one event through per interval.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Split off the longest prefix of `bytes` that does not end inside a
/// multi-byte character and decode it. Up to three trailing bytes of an
/// unfinished character stay behind for the next read; genuinely invalid
/// bytes still decode to U+FFFD.
pub fn take_complete_utf8(bytes: &mut Vec<u8>) -> String {
    let split = bytes.len() - incomplete_tail(bytes);
    let text = String::from_utf8_lossy(&bytes[..split]).into_owned();
    bytes.drain(..split);
    text
}

fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

pub struct StatusReader {
    buffer: StatusBuffer,
    undecoded: Vec<u8>,
    throttle: Throttle,
    stream_key: Option<String>,
    events: mpsc::Sender<EncoderEvent>,
}

impl StatusReader {
    pub fn new(
        buffer_cap: usize,
        log_interval: Duration,
        stream_key: Option<String>,
        events: mpsc::Sender<EncoderEvent>,
    ) -> Self {
        Self {
            buffer: StatusBuffer::new(buffer_cap),
            undecoded: Vec::new(),
            throttle: Throttle::new(log_interval),
            stream_key,
            events,
        }
    }

    /// Read until EOF. The stream is always drained to the end so the encoder
    /// never blocks on a full stderr pipe.
    pub async fn run<R>(mut self, mut stderr: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = [0u8; 4096];
        loop {
            match stderr.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    self.undecoded.extend_from_slice(&chunk[..n]);
                    let text = take_complete_utf8(&mut self.undecoded);
                    for line in self.buffer.push(&text) {
                        self.handle_line(&line);
                    }
                }
                Err(e) => {
                    debug!("Encoder stderr read failed: {}", e);
                    break;
                }
            }
        }
        if !self.undecoded.is_empty() {
            let rest = String::from_utf8_lossy(&self.undecoded).into_owned();
            self.undecoded.clear();
            for line in self.buffer.push(&rest) {
                self.handle_line(&line);
            }
        }
        if let Some(line) = self.buffer.finish() {
            self.handle_line(&line);
        }
        debug!("Encoder status stream closed");
    }

    fn handle_line(&mut self, line: &str) {
        match classify(line) {
            LineClass::Error => warn!("Encoder: {}", self.scrub(line)),
            LineClass::Progress => {
                if !self.throttle.ready(Instant::now()) {
                    return;
                }
                if let Some(t) = parse_telemetry(line) {
                    info!(
                        fps = ?t.fps,
                        bitrate = t.bitrate.as_deref().unwrap_or("N/A"),
                        time = t.time.as_deref().unwrap_or("N/A"),
                        speed = t.speed.as_deref().unwrap_or("N/A"),
                        "Stream status"
                    );
                    // Telemetry is lossy; never stall stderr draining on it.
                    let _ = self.events.try_send(EncoderEvent::Telemetry(t));
                }
            }
            LineClass::Endpoint => info!("Encoder endpoint: {}", self.scrub(line)),
            LineClass::Info => info!("Encoder: {}", self.scrub(line)),
            LineClass::Noise => debug!("Encoder: {}", self.scrub(line)),
        }
    }

    fn scrub(&self, line: &str) -> String {
        pagecast_logging::redact_secret(line, self.stream_key.as_deref())
    }
}
