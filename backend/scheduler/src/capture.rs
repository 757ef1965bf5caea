//! Capture Scheduler
//!
//! Drives snapshot capture on a fixed cadence and hands each frame to a
//! `FrameSink`. Owns the retry/reload policy for a flaky renderer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pagecast_core::{
    Frame, FrameSink, Renderer, ScreenshotOptions, StreamConfig, StreamError, WriteOutcome,
};
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::resource_monitor::ResourceMonitor;
use crate::retry::{RetryDecision, RetryPolicy, RetryState};

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub interval: Duration,
    /// Maintenance reload every N written frames; 0 disables.
    pub refresh_every: u64,
    pub retry: RetryPolicy,
    pub capture_timeout: Duration,
    pub reload_timeout: Duration,
    /// Captures slower than this are logged as slow.
    pub slow_capture: Duration,
    /// Log every Nth written frame.
    pub log_every: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            refresh_every: 100,
            retry: RetryPolicy::default(),
            capture_timeout: Duration::from_secs(10),
            reload_timeout: Duration::from_secs(10),
            slow_capture: Duration::from_millis(500),
            log_every: 10,
        }
    }
}

impl CaptureSettings {
    /// Defaults with the cadence taken from the session config.
    pub fn for_stream(config: &StreamConfig) -> Self {
        Self {
            interval: config.capture_interval(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct CaptureStats {
    frames_written: AtomicU64,
    frames_dropped: AtomicU64,
    capture_failures: AtomicU64,
    consecutive_errors: AtomicU64,
    maintenance_reloads: AtomicU64,
    recovery_reloads: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct CaptureCounters {
    pub frames_written: u64,
    pub frames_dropped: u64,
    pub capture_failures: u64,
    pub consecutive_errors: u64,
    pub maintenance_reloads: u64,
    pub recovery_reloads: u64,
}

impl CaptureStats {
    pub fn snapshot(&self) -> CaptureCounters {
        CaptureCounters {
            frames_written: self.frames_written.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
            consecutive_errors: self.consecutive_errors.load(Ordering::Relaxed),
            maintenance_reloads: self.maintenance_reloads.load(Ordering::Relaxed),
            recovery_reloads: self.recovery_reloads.load(Ordering::Relaxed),
        }
    }
}

/// Why the loop ended.
#[derive(Debug)]
pub enum LoopExit {
    Cancelled,
    Failed(StreamError),
}

/// Next capture deadline: one interval after the previous one, or right now
/// if that moment has already passed. Missed deadlines are never replayed.
pub fn next_deadline(previous: Instant, interval: Duration, now: Instant) -> Instant {
    (previous + interval).max(now)
}

fn signal_first(first_iteration: &mut Option<oneshot::Sender<()>>) {
    if let Some(tx) = first_iteration.take() {
        let _ = tx.send(());
    }
}

pub struct CaptureScheduler {
    settings: CaptureSettings,
    stats: Arc<CaptureStats>,
    monitor: Option<Arc<ResourceMonitor>>,
}

impl CaptureScheduler {
    pub fn new(settings: CaptureSettings) -> Self {
        Self {
            settings,
            stats: Arc::new(CaptureStats::default()),
            monitor: None,
        }
    }

    /// Report written frames to a resource monitor as well.
    pub fn with_monitor(mut self, monitor: Arc<ResourceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        Arc::clone(&self.stats)
    }

    /// Capture until cancelled or a fatal error. `first_iteration` fires once
    /// the first iteration has completed without ending the loop; it is
    /// dropped unsent if the loop ends first. Only one renderer call is
    /// ever outstanding: `renderer` is borrowed mutably for the whole loop.
    pub async fn run(
        &self,
        renderer: &mut dyn Renderer,
        sink: &dyn FrameSink,
        mut cancel: watch::Receiver<bool>,
        mut first_iteration: Option<oneshot::Sender<()>>,
    ) -> LoopExit {
        let interval = self.settings.interval;
        let opts = ScreenshotOptions::full_viewport();
        let mut retry = RetryState::default();
        let mut seq = 0u64;
        let mut since_refresh = 0u64;
        let mut deadline = Instant::now();

        info!(interval = ?interval, refresh_every = self.settings.refresh_every, "Capture loop started");

        loop {
            let stop_requested = *cancel.borrow();
            if stop_requested {
                break;
            }
            tokio::select! {
                _ = sleep_until(deadline) => {}
                _ = cancel.wait_for(|stop| *stop) => break,
            }

            let started = Instant::now();
            let captured = match timeout(self.settings.capture_timeout, renderer.screenshot(&opts)).await {
                Ok(result) => result,
                Err(_) => Err(StreamError::CaptureTimeout(self.settings.capture_timeout)),
            };

            let bytes = match captured {
                Ok(bytes) => bytes,
                Err(e) if e.is_retryable() => {
                    self.stats.capture_failures.fetch_add(1, Ordering::Relaxed);
                    let decision = retry.record_failure(&self.settings.retry, &e.to_string());
                    self.stats
                        .consecutive_errors
                        .store(u64::from(retry.consecutive), Ordering::Relaxed);
                    match decision {
                        RetryDecision::Retry(backoff) => {
                            deadline = Instant::now() + backoff;
                        }
                        RetryDecision::Reload => {
                            if let Err(e) = self.recovery_reload(renderer, &mut retry).await {
                                return LoopExit::Failed(e);
                            }
                            since_refresh = 0;
                            deadline = next_deadline(deadline, interval, Instant::now());
                        }
                    }
                    signal_first(&mut first_iteration);
                    continue;
                }
                Err(e) => {
                    error!("Renderer failed during capture: {}", e);
                    return LoopExit::Failed(e);
                }
            };
            let latency = started.elapsed();

            // Stop arrived while the capture was in flight.
            if *cancel.borrow() {
                break;
            }

            retry.reset();
            self.stats.consecutive_errors.store(0, Ordering::Relaxed);
            seq += 1;
            let size = bytes.len();

            // A write stuck on a saturated pipe must not hold up a stop.
            let delivered = tokio::select! {
                outcome = sink.deliver(Frame::new(seq, bytes)) => outcome,
                _ = cancel.wait_for(|stop| *stop) => {
                    debug!(frame = seq, "Stop requested mid-write, abandoning frame");
                    break;
                }
            };
            match delivered {
                Ok(WriteOutcome::Written) => {
                    let written = self.stats.frames_written.fetch_add(1, Ordering::Relaxed) + 1;
                    if let Some(monitor) = &self.monitor {
                        monitor.record_frame();
                    }
                    since_refresh += 1;
                    if self.settings.log_every > 0 && written % self.settings.log_every == 0 {
                        info!(frame = seq, written, size, latency_ms = latency.as_millis() as u64, "Frame streamed");
                    }
                }
                Ok(WriteOutcome::Dropped) => {
                    self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(frame = seq, "Frame dropped by encoder backpressure");
                }
                Ok(WriteOutcome::Rejected) => {
                    warn!(frame = seq, "Encoder input closed, stopping capture");
                    return LoopExit::Failed(StreamError::EncoderClosed);
                }
                Err(e) => {
                    error!(frame = seq, "Frame delivery failed: {}", e);
                    return LoopExit::Failed(e);
                }
            }

            signal_first(&mut first_iteration);

            if latency > self.settings.slow_capture {
                warn!(frame = seq, latency_ms = latency.as_millis() as u64, "Slow capture");
            }

            if self.settings.refresh_every > 0 && since_refresh >= self.settings.refresh_every {
                since_refresh = 0;
                self.maintenance_reload(renderer).await;
            }

            deadline = next_deadline(deadline, interval, Instant::now());
        }

        info!(frames = seq, "Capture loop cancelled");
        LoopExit::Cancelled
    }

    async fn reload(&self, renderer: &mut dyn Renderer) -> Result<(), StreamError> {
        let limit = self.settings.reload_timeout;
        match timeout(limit, renderer.reload(limit)).await {
            Ok(result) => result,
            Err(_) => Err(StreamError::Reload(format!("timed out after {limit:?}"))),
        }
    }

    /// Periodic reload to reclaim renderer memory. Never fatal.
    async fn maintenance_reload(&self, renderer: &mut dyn Renderer) {
        info!("Refreshing page to reclaim memory");
        match self.reload(renderer).await {
            Ok(()) => {
                self.stats.maintenance_reloads.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!("Maintenance reload failed, continuing: {}", e),
        }
    }

    async fn recovery_reload(
        &self,
        renderer: &mut dyn Renderer,
        retry: &mut RetryState,
    ) -> Result<(), StreamError> {
        match self.reload(renderer).await {
            Ok(()) => {
                info!("Renderer reloaded after repeated capture failures");
                self.stats.recovery_reloads.fetch_add(1, Ordering::Relaxed);
                retry.reset();
                self.stats.consecutive_errors.store(0, Ordering::Relaxed);
                Ok(())
            }
            Err(e) if self.settings.retry.reload_failure_fatal => {
                error!("Recovery reload failed: {}", e);
                Err(e)
            }
            Err(e) => {
                warn!("Recovery reload failed, starting a new retry round: {}", e);
                retry.reset();
                self.stats.consecutive_errors.store(0, Ordering::Relaxed);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pagecast_core::mock::MockRenderer;
    use parking_lot::Mutex;

    /// Records frames; answers with a fixed outcome.
    struct RecordingSink {
        frames: Mutex<Vec<(u64, Instant, usize)>>,
        outcome: WriteOutcome,
    }

    impl RecordingSink {
        fn new(outcome: WriteOutcome) -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(Vec::new()),
                outcome,
            })
        }

        fn times(&self) -> Vec<Instant> {
            self.frames.lock().iter().map(|(_, t, _)| *t).collect()
        }

        fn count(&self) -> usize {
            self.frames.lock().len()
        }
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn deliver(&self, frame: Frame) -> Result<WriteOutcome, StreamError> {
            self.frames.lock().push((frame.seq, Instant::now(), frame.len()));
            Ok(self.outcome)
        }
    }

    fn settings() -> CaptureSettings {
        CaptureSettings {
            interval: Duration::from_secs(10),
            refresh_every: 0,
            ..Default::default()
        }
    }

    struct Run {
        cancel: watch::Sender<bool>,
        task: tokio::task::JoinHandle<LoopExit>,
        stats: Arc<CaptureStats>,
    }

    fn spawn_loop(settings: CaptureSettings, renderer: &MockRenderer, sink: Arc<RecordingSink>) -> Run {
        let scheduler = CaptureScheduler::new(settings);
        let stats = scheduler.stats();
        let (cancel, cancel_rx) = watch::channel(false);
        let mut renderer = renderer.clone();
        let task = tokio::spawn(async move {
            scheduler.run(&mut renderer, sink.as_ref(), cancel_rx, None).await
        });
        Run { cancel, task, stats }
    }

    impl Run {
        async fn stop(self) -> (LoopExit, CaptureCounters) {
            self.cancel.send_replace(true);
            let exit = self.task.await.unwrap();
            (exit, self.stats.snapshot())
        }
    }

    #[test]
    fn deadline_never_in_the_past() {
        let base = Instant::now();
        let interval = Duration::from_secs(10);
        // early finish: wait for the scheduled slot
        assert_eq!(next_deadline(base, interval, base + Duration::from_secs(2)), base + interval);
        // overrun: go immediately, no catch-up burst
        let late = base + Duration::from_secs(25);
        assert_eq!(next_deadline(base, interval, late), late);
    }

    #[tokio::test(start_paused = true)]
    async fn captures_on_fixed_cadence() {
        let renderer = MockRenderer::new();
        let sink = RecordingSink::new(WriteOutcome::Written);
        let run = spawn_loop(settings(), &renderer, sink.clone());

        tokio::time::sleep(Duration::from_secs(35)).await;
        let (exit, counters) = run.stop().await;

        assert!(matches!(exit, LoopExit::Cancelled));
        assert_eq!(sink.count(), 4);
        assert_eq!(counters.frames_written, 4);
        let times = sink.times();
        for pair in times.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_secs(10));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_capture_does_not_burst() {
        let renderer = MockRenderer::new();
        renderer.set_screenshot_delay(Duration::from_secs(15));
        let sink = RecordingSink::new(WriteOutcome::Written);
        let run = spawn_loop(
            CaptureSettings {
                capture_timeout: Duration::from_secs(20),
                ..settings()
            },
            &renderer,
            sink.clone(),
        );

        tokio::time::sleep(Duration::from_secs(50)).await;
        run.stop().await;

        // frames land at 15s, 30s and 45s: back to back, never overlapping
        let times = sink.times();
        assert_eq!(times.len(), 3);
        for pair in times.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_secs(15));
        }
        assert_eq!(renderer.max_concurrent_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_consecutive_errors() {
        let renderer = MockRenderer::new();
        renderer.fail_screenshots(3, "blank page");
        let sink = RecordingSink::new(WriteOutcome::Written);
        let run = spawn_loop(settings(), &renderer, sink.clone());

        // three failures 1s apart, then a success at 3s
        tokio::time::sleep(Duration::from_millis(3500)).await;
        let snapshot = run.stats.snapshot();
        assert_eq!(snapshot.capture_failures, 3);
        assert_eq!(snapshot.consecutive_errors, 0);
        assert_eq!(snapshot.frames_written, 1);

        run.stop().await;
        assert_eq!(renderer.reload_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn five_failures_trigger_exactly_one_reload() {
        let renderer = MockRenderer::new();
        renderer.fail_screenshots(5, "target crashed");
        let sink = RecordingSink::new(WriteOutcome::Written);
        let run = spawn_loop(settings(), &renderer, sink.clone());

        tokio::time::sleep(Duration::from_secs(30)).await;
        let (exit, counters) = run.stop().await;

        assert!(matches!(exit, LoopExit::Cancelled));
        assert_eq!(renderer.reload_calls(), 1);
        assert_eq!(counters.recovery_reloads, 1);
        assert_eq!(counters.consecutive_errors, 0);
        assert!(counters.frames_written >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_recovery_reload_is_fatal() {
        let renderer = MockRenderer::new();
        renderer.fail_screenshots(5, "target crashed");
        renderer.fail_next_reload("browser gone");
        let sink = RecordingSink::new(WriteOutcome::Written);
        let run = spawn_loop(settings(), &renderer, sink.clone());

        let exit = run.task.await.unwrap();
        assert!(matches!(exit, LoopExit::Failed(StreamError::Reload(_))));
        assert_eq!(sink.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_recovery_reload_can_be_tolerated() {
        let renderer = MockRenderer::new();
        renderer.fail_screenshots(5, "target crashed");
        renderer.fail_next_reload("browser gone");
        let sink = RecordingSink::new(WriteOutcome::Written);
        let mut settings = settings();
        settings.retry.reload_failure_fatal = false;
        let run = spawn_loop(settings, &renderer, sink.clone());

        tokio::time::sleep(Duration::from_secs(20)).await;
        let (exit, counters) = run.stop().await;
        assert!(matches!(exit, LoopExit::Cancelled));
        assert_eq!(counters.recovery_reloads, 0);
        assert!(counters.frames_written >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn capture_timeout_counts_as_failure() {
        let renderer = MockRenderer::new();
        renderer.set_screenshot_delay(Duration::from_secs(60));
        let sink = RecordingSink::new(WriteOutcome::Written);
        let run = spawn_loop(
            CaptureSettings {
                capture_timeout: Duration::from_secs(2),
                ..settings()
            },
            &renderer,
            sink.clone(),
        );

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let (_, counters) = run.stop().await;
        assert_eq!(counters.capture_failures, 1);
        assert_eq!(sink.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_reload_every_n_frames() {
        let renderer = MockRenderer::new();
        // a failing maintenance reload must not end the loop
        renderer.fail_next_reload("flaky");
        let sink = RecordingSink::new(WriteOutcome::Written);
        let run = spawn_loop(
            CaptureSettings {
                refresh_every: 3,
                ..settings()
            },
            &renderer,
            sink.clone(),
        );

        // 7 frames at 0..=60s
        tokio::time::sleep(Duration::from_secs(65)).await;
        let (exit, counters) = run.stop().await;
        assert!(matches!(exit, LoopExit::Cancelled));
        assert_eq!(counters.frames_written, 7);
        assert_eq!(renderer.reload_calls(), 2);
        assert_eq!(counters.maintenance_reloads, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_frames_are_counted_not_fatal() {
        let renderer = MockRenderer::new();
        let sink = RecordingSink::new(WriteOutcome::Dropped);
        let run = spawn_loop(settings(), &renderer, sink.clone());

        tokio::time::sleep(Duration::from_secs(15)).await;
        let (exit, counters) = run.stop().await;
        assert!(matches!(exit, LoopExit::Cancelled));
        assert_eq!(counters.frames_dropped, 2);
        assert_eq!(counters.frames_written, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_write_ends_loop() {
        let renderer = MockRenderer::new();
        let sink = RecordingSink::new(WriteOutcome::Rejected);
        let run = spawn_loop(settings(), &renderer, sink.clone());
        let exit = run.task.await.unwrap();
        assert!(matches!(exit, LoopExit::Failed(StreamError::EncoderClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn first_iteration_is_signalled() {
        let renderer = MockRenderer::new();
        let mut mock = renderer.clone();
        let sink = RecordingSink::new(WriteOutcome::Written);
        let scheduler = CaptureScheduler::new(settings());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (first_tx, first_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            scheduler.run(&mut mock, sink.as_ref(), cancel_rx, Some(first_tx)).await
        });
        first_rx.await.unwrap();
        // signalled after the first capture, not before it
        assert_eq!(renderer.screenshot_calls(), 1);
        cancel_tx.send_replace(true);
        assert!(matches!(task.await.unwrap(), LoopExit::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn first_iteration_not_signalled_when_loop_dies() {
        let renderer = MockRenderer::new();
        renderer.crash_at_screenshot(1, "target crashed");
        let mut mock = renderer.clone();
        let sink = RecordingSink::new(WriteOutcome::Written);
        let scheduler = CaptureScheduler::new(settings());
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (first_tx, first_rx) = oneshot::channel();

        let exit = scheduler.run(&mut mock, sink.as_ref(), cancel_rx, Some(first_tx)).await;
        assert!(matches!(exit, LoopExit::Failed(StreamError::Renderer(_))));
        assert!(first_rx.await.is_err());
        assert_eq!(sink.count(), 0);
    }

    /// Never finishes a write.
    struct WedgedSink;

    #[async_trait]
    impl FrameSink for WedgedSink {
        async fn deliver(&self, _frame: Frame) -> Result<WriteOutcome, StreamError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_stuck_write() {
        let mut renderer = MockRenderer::new();
        let scheduler = CaptureScheduler::new(settings());
        let stats = scheduler.stats();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            scheduler.run(&mut renderer, &WedgedSink, cancel_rx, None).await
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        let begin = Instant::now();
        cancel_tx.send_replace(true);
        let exit = task.await.unwrap();

        assert!(matches!(exit, LoopExit::Cancelled));
        assert!(begin.elapsed() < Duration::from_millis(10));
        assert_eq!(stats.snapshot().frames_written, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn written_frames_reach_monitor() {
        use crate::resource_monitor::{MonitorSettings, ProcMemorySampler};

        let renderer = MockRenderer::new();
        let mut mock = renderer.clone();
        let sink = RecordingSink::new(WriteOutcome::Written);
        let monitor = Arc::new(ResourceMonitor::new(
            MonitorSettings::default(),
            Box::new(ProcMemorySampler),
        ));
        let scheduler = CaptureScheduler::new(settings()).with_monitor(monitor.clone());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            scheduler.run(&mut mock, sink.as_ref(), cancel_rx, None).await
        });

        tokio::time::sleep(Duration::from_secs(25)).await;
        cancel_tx.send_replace(true);
        task.await.unwrap();
        assert_eq!(monitor.frames(), 3);
    }
}
