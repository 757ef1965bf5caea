//! Resource Monitor
//!
//! Samples process memory on a timer, tracks the peak and the frame count,
//! and logs a summary at a coarser interval. Purely observational: crossing
//! the warning threshold only produces a log line.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use pagecast_core::ResourceSample;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const MB: u64 = 1024 * 1024;

/// Source of resident-set-size measurements.
pub trait MemorySampler: Send + Sync {
    /// Current RSS in bytes, `None` where the platform offers no reading.
    fn rss_bytes(&self) -> Option<u64>;
}

/// Reads `VmRSS` from `/proc/self/status`. Always `None` off Linux.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcMemorySampler;

impl MemorySampler for ProcMemorySampler {
    fn rss_bytes(&self) -> Option<u64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss(&status)
    }
}

/// `VmRSS:   123456 kB` → bytes.
pub fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line
        .trim_start_matches("VmRSS:")
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kb * 1024)
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub sample_every: Duration,
    pub log_every: Duration,
    pub warn_threshold_mb: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            sample_every: Duration::from_secs(30),
            log_every: Duration::from_secs(300),
            warn_threshold_mb: 1000,
        }
    }
}

/// Serializable view for status reporting.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub current_mb: Option<u64>,
    pub peak_mb: u64,
    pub frames: u64,
}

pub struct ResourceMonitor {
    settings: MonitorSettings,
    sampler: Box<dyn MemorySampler>,
    peak_bytes: AtomicU64,
    latest: Mutex<Option<ResourceSample>>,
    frames: AtomicU64,
    above_threshold: AtomicBool,
}

impl ResourceMonitor {
    pub fn new(settings: MonitorSettings, sampler: Box<dyn MemorySampler>) -> Self {
        Self {
            settings,
            sampler,
            peak_bytes: AtomicU64::new(0),
            latest: Mutex::new(None),
            frames: AtomicU64::new(0),
            above_threshold: AtomicBool::new(false),
        }
    }

    pub fn record_frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn peak_bytes(&self) -> u64 {
        self.peak_bytes.load(Ordering::Relaxed)
    }

    pub fn latest(&self) -> Option<ResourceSample> {
        *self.latest.lock()
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            current_mb: self.latest().map(|s| s.rss_mb()),
            peak_mb: self.peak_bytes() / MB,
            frames: self.frames(),
        }
    }

    /// Take one measurement, update the peak and warn on an upward crossing
    /// of the threshold.
    pub fn sample_now(&self) -> Option<ResourceSample> {
        let rss_bytes = self.sampler.rss_bytes()?;
        let sample = ResourceSample {
            at: Utc::now(),
            rss_bytes,
        };
        self.peak_bytes.fetch_max(rss_bytes, Ordering::Relaxed);
        *self.latest.lock() = Some(sample);

        let above = sample.rss_mb() >= self.settings.warn_threshold_mb;
        let was_above = self.above_threshold.swap(above, Ordering::Relaxed);
        if above && !was_above {
            warn!(
                rss_mb = sample.rss_mb(),
                threshold_mb = self.settings.warn_threshold_mb,
                "High memory usage detected"
            );
        }
        debug!(rss_mb = sample.rss_mb(), "Memory sample");
        Some(sample)
    }

    /// Sample until `cancel` flips to true (or its sender goes away).
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.settings.sample_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_log = Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sample_now();
                    if last_log.elapsed() >= self.settings.log_every {
                        last_log = Instant::now();
                        let snap = self.snapshot();
                        info!(
                            current_mb = ?snap.current_mb,
                            peak_mb = snap.peak_mb,
                            frames = snap.frames,
                            "Resource summary"
                        );
                    }
                }
                _ = cancel.wait_for(|stop| *stop) => break,
            }
        }
        debug!("Resource monitor stopped");
    }
}
