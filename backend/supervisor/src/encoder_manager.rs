//! Encoder Process Manager
//!
//! Owns one encoder subprocess per session. A reaper task holds the process
//! and answers signal requests; a status task drains stderr. Both report to
//! the coordinator over a single `EncoderEvent` channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pagecast_core::{
    EncoderEvent, EncoderProcess, EncoderSpawner, Frame, FrameSink, StreamConfig, StreamError,
    WriteOutcome,
};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::encoder_args::EncoderPlan;
use crate::status_reader::StatusReader;
use crate::timeout_kill::{ExitWatch, ShutdownOutcome, Signal, TimeoutKill};

#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub program: String,
    pub ingest_url: String,
    pub stream_key: Option<String>,
    /// How long one write may sit on a saturated pipe before it counts as a stall.
    pub write_stall_wait: Duration,
    /// Stalls tolerated before an untouched frame is dropped.
    pub max_write_stalls: u32,
    pub status_log_interval: Duration,
    pub status_buffer_cap: usize,
    pub shutdown: TimeoutKill,
    pub event_capacity: usize,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            ingest_url: String::new(),
            stream_key: None,
            write_stall_wait: Duration::from_millis(100),
            max_write_stalls: 50,
            status_log_interval: Duration::from_secs(2),
            status_buffer_cap: 10_000,
            shutdown: TimeoutKill::default(),
            event_capacity: 64,
        }
    }
}

pub struct EncoderManager {
    settings: EncoderSettings,
    spawner: Arc<dyn EncoderSpawner>,
}

impl EncoderManager {
    pub fn new(settings: EncoderSettings, spawner: Arc<dyn EncoderSpawner>) -> Self {
        Self { settings, spawner }
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    /// Spawn the encoder for one session. The returned receiver carries
    /// throttled telemetry and exactly one `Exited` event.
    pub fn launch(
        &self,
        config: &StreamConfig,
    ) -> Result<(EncoderHandle, mpsc::Receiver<EncoderEvent>), StreamError> {
        let stream_key = match self.settings.stream_key.as_deref() {
            Some(key) if !key.is_empty() => key,
            _ => return Err(StreamError::Config("stream key is not configured".into())),
        };
        if self.settings.ingest_url.trim().is_empty() {
            return Err(StreamError::Config("ingest URL is not configured".into()));
        }

        let plan = EncoderPlan::new(config, &self.settings.ingest_url, stream_key);
        info!(
            url = %plan.redacted_url(),
            input_fps = %plan.input_rate,
            output_fps = plan.output_fps,
            target_kbps = plan.bitrate.target,
            max_kbps = plan.bitrate.max,
            buffer_kbps = plan.bitrate.buffer,
            preset = plan.preset,
            "Starting encoder"
        );

        let child = self.spawner.spawn(&self.settings.program, &plan.args())?;
        let pid = child.process.id();

        let (events_tx, events_rx) = mpsc::channel(self.settings.event_capacity.max(1));
        let (exit_tx, exit_rx) = watch::channel(None);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let reader = StatusReader::new(
            self.settings.status_buffer_cap,
            self.settings.status_log_interval,
            Some(plan.stream_key().to_string()),
            events_tx.clone(),
        );
        tokio::spawn(reader.run(child.stderr));
        tokio::spawn(reap(child.process, signal_rx, exit_tx, events_tx));

        let handle = EncoderHandle {
            inner: Arc::new(HandleInner {
                pid,
                stdin: Mutex::new(Some(child.stdin)),
                closing: AtomicBool::new(false),
                exit: exit_rx,
                signals: signal_tx,
                shutdown_done: Mutex::new(false),
                write_stall_wait: self.settings.write_stall_wait,
                max_write_stalls: self.settings.max_write_stalls.max(1),
                shutdown: self.settings.shutdown,
                frames_written: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
                bytes_written: AtomicU64::new(0),
            }),
        };
        Ok((handle, events_rx))
    }
}

/// Reaper: sole owner of the process. Publishes the exit code on the watch
/// and as an event, then ends.
async fn reap(
    mut process: Box<dyn EncoderProcess>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    exit_tx: watch::Sender<Option<Option<i32>>>,
    events: mpsc::Sender<EncoderEvent>,
) {
    let code = loop {
        tokio::select! {
            status = process.wait() => {
                break match status {
                    Ok(code) => code,
                    Err(e) => {
                        error!("Failed to wait on encoder: {}", e);
                        None
                    }
                };
            }
            Some(signal) = signals.recv() => {
                let sent = match signal {
                    Signal::Terminate => process.terminate(),
                    Signal::Kill => process.kill(),
                };
                if let Err(e) = sent {
                    warn!(?signal, "Failed to signal encoder: {}", e);
                }
            }
        }
    };

    match code {
        Some(0) => info!("Encoder exited with code 0"),
        Some(code) => warn!(code, "Encoder exited with non-zero code"),
        None => warn!("Encoder terminated by signal"),
    }
    exit_tx.send_replace(Some(code));
    let _ = events.send(EncoderEvent::Exited { code }).await;
}

struct HandleInner {
    pid: Option<u32>,
    stdin: Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
    closing: AtomicBool,
    exit: ExitWatch,
    signals: mpsc::UnboundedSender<Signal>,
    shutdown_done: Mutex<bool>,
    write_stall_wait: Duration,
    max_write_stalls: u32,
    shutdown: TimeoutKill,
    frames_written: AtomicU64,
    frames_dropped: AtomicU64,
    bytes_written: AtomicU64,
}

/// Write side and lifecycle control of a running encoder. Once the handle is
/// closing or the process has exited, every write is rejected.
#[derive(Clone)]
pub struct EncoderHandle {
    inner: Arc<HandleInner>,
}

impl EncoderHandle {
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    /// `Some(code)` once the process is gone.
    pub fn exit_status(&self) -> Option<Option<i32>> {
        *self.inner.exit.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_status().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst) || self.has_exited()
    }

    pub fn frames_written(&self) -> u64 {
        self.inner.frames_written.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.inner.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.inner.bytes_written.load(Ordering::Relaxed)
    }

    /// Write one frame to the encoder's stdin, pausing while the pipe is
    /// saturated instead of buffering. A frame that never got a single byte
    /// through is dropped after `max_write_stalls` waits; a partial frame is
    /// always finished.
    pub async fn write_frame(&self, frame: &Frame) -> Result<WriteOutcome, StreamError> {
        if self.is_closed() {
            return Ok(WriteOutcome::Rejected);
        }
        let mut stdin = self.inner.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            return Ok(WriteOutcome::Rejected);
        };

        let data = &frame.data;
        let mut written = 0usize;
        let mut stalls = 0u32;
        while written < data.len() {
            match timeout(self.inner.write_stall_wait, pipe.write(&data[written..])).await {
                Ok(Ok(0)) => return Err(self.write_failure()),
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) => {
                    debug!(frame = frame.seq, "Encoder stdin write failed: {}", e);
                    return Err(self.write_failure());
                }
                Err(_) => {
                    if let Some(code) = self.exit_status() {
                        return Err(StreamError::EncoderCrash { code });
                    }
                    if self.inner.closing.load(Ordering::SeqCst) {
                        debug!(frame = frame.seq, written, "Encoder closing, abandoning frame");
                        return Ok(WriteOutcome::Rejected);
                    }
                    stalls += 1;
                    if stalls % self.inner.max_write_stalls != 0 {
                        continue;
                    }
                    if written == 0 {
                        self.inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(frame = frame.seq, stalls, "Encoder input saturated, dropping frame");
                        return Ok(WriteOutcome::Dropped);
                    }
                    warn!(
                        frame = frame.seq,
                        written,
                        total = data.len(),
                        "Encoder input saturated mid-frame, still waiting"
                    );
                }
            }
        }

        self.inner.frames_written.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(WriteOutcome::Written)
    }

    fn write_failure(&self) -> StreamError {
        match self.exit_status() {
            Some(code) => StreamError::EncoderCrash { code },
            None => StreamError::EncoderClosed,
        }
    }

    /// Three-tier shutdown. Idempotent: concurrent and repeated calls wait for
    /// the first one and then return `AlreadyStopped`.
    pub async fn shutdown(&self) -> ShutdownOutcome {
        let mut done = self.inner.shutdown_done.lock().await;
        if *done {
            return ShutdownOutcome::AlreadyStopped;
        }
        self.inner.closing.store(true, Ordering::SeqCst);
        info!(pid = ?self.inner.pid, "Stopping encoder");

        let grace = self.inner.shutdown;
        let close_input = async {
            // An in-flight write holds the pipe; don't wait on it past the
            // first grace period, the signals will break it.
            match timeout(grace.close_grace, self.inner.stdin.lock()).await {
                Ok(mut stdin) => {
                    if let Some(mut pipe) = stdin.take() {
                        let _ = pipe.shutdown().await;
                    }
                }
                Err(_) => warn!("Encoder stdin busy, skipping graceful close"),
            }
        };
        let signals = self.inner.signals.clone();
        let mut exit = self.inner.exit.clone();
        let outcome = grace
            .escalate(&mut exit, close_input, |signal| signals.send(signal).is_ok())
            .await;

        // Guarantee the pipe is released even if the close tier was skipped.
        if let Ok(mut stdin) = self.inner.stdin.try_lock() {
            stdin.take();
        }
        *done = true;
        info!(?outcome, "Encoder stopped");
        outcome
    }
}

#[async_trait]
impl FrameSink for EncoderHandle {
    async fn deliver(&self, frame: Frame) -> Result<WriteOutcome, StreamError> {
        self.write_frame(&frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagecast_core::mock::{MockEncoderBehavior, MockEncoderControl, MockEncoderSpawner};
    use tokio::time::Instant;

    fn settings() -> EncoderSettings {
        EncoderSettings {
            ingest_url: "rtmp://ingest.example/live2".into(),
            stream_key: Some("test-key".into()),
            ..Default::default()
        }
    }

    fn launch(
        behavior: MockEncoderBehavior,
    ) -> (EncoderHandle, mpsc::Receiver<EncoderEvent>, MockEncoderControl, Arc<MockEncoderSpawner>) {
        let spawner = Arc::new(MockEncoderSpawner::new(behavior));
        let manager = EncoderManager::new(settings(), spawner.clone());
        let (handle, events) = manager.launch(&StreamConfig::default()).unwrap();
        let control = spawner.last().unwrap();
        (handle, events, control, spawner)
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn next_exit(events: &mut mpsc::Receiver<EncoderEvent>) -> Option<i32> {
        loop {
            match events.recv().await {
                Some(EncoderEvent::Exited { code }) => return code,
                Some(_) => continue,
                None => panic!("event channel closed without exit"),
            }
        }
    }

    #[tokio::test]
    async fn launch_passes_plan_to_spawner() {
        let (_handle, _events, _control, spawner) = launch(MockEncoderBehavior::default());
        let args = spawner.last_args();
        assert_eq!(args.last().unwrap(), "rtmp://ingest.example/live2/test-key");
        assert!(args.iter().any(|a| a == "6000k" || a == "8000k"));
    }

    #[tokio::test]
    async fn launch_without_stream_key_is_config_error() {
        let spawner = Arc::new(MockEncoderSpawner::default());
        let manager = EncoderManager::new(
            EncoderSettings {
                stream_key: None,
                ..settings()
            },
            spawner.clone(),
        );
        let err = manager.launch(&StreamConfig::default()).err().unwrap();
        assert!(matches!(err, StreamError::Config(_)));
        assert_eq!(spawner.spawn_count(), 0);
    }

    #[tokio::test]
    async fn spawn_failure_surfaces() {
        let spawner = Arc::new(MockEncoderSpawner::default());
        spawner.fail_with("no such file");
        let manager = EncoderManager::new(settings(), spawner);
        let err = manager.launch(&StreamConfig::default()).err().unwrap();
        assert!(matches!(err, StreamError::EncoderSpawn(_)));
    }

    #[tokio::test]
    async fn frame_bytes_reach_encoder() {
        let (handle, _events, control, _) = launch(MockEncoderBehavior::default());
        let outcome = handle.deliver(Frame::new(1, b"png-bytes".to_vec())).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
        wait_until(|| control.received_len() == 9).await;
        assert_eq!(control.received(), b"png-bytes".to_vec());
        assert_eq!(handle.frames_written(), 1);
    }

    #[tokio::test]
    async fn crash_is_reported_and_later_writes_rejected() {
        let (handle, mut events, control, _) = launch(MockEncoderBehavior::default());
        control.crash(1);
        assert_eq!(next_exit(&mut events).await, Some(1));
        assert!(handle.has_exited());

        let outcome = handle.write_frame(&Frame::new(2, vec![1, 2, 3])).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_pipe_drops_untouched_frame() {
        let behavior = MockEncoderBehavior {
            read_stdin: false,
            pipe_capacity: 16,
            ..Default::default()
        };
        let (handle, _events, control, _) = launch(behavior);

        let fill = handle.write_frame(&Frame::new(1, vec![0u8; 16])).await.unwrap();
        assert_eq!(fill, WriteOutcome::Written);

        let start = Instant::now();
        let outcome = handle.write_frame(&Frame::new(2, vec![1u8; 8])).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Dropped);
        assert!(start.elapsed() >= Duration::from_millis(100) * 50);
        assert_eq!(handle.frames_dropped(), 1);

        control.resume_reading();
        let outcome = handle.write_frame(&Frame::new(3, vec![2u8; 8])).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_frame_is_completed() {
        let behavior = MockEncoderBehavior {
            read_stdin: false,
            pipe_capacity: 16,
            ..Default::default()
        };
        let (handle, _events, control, _) = launch(behavior);

        let resume = control.clone();
        tokio::spawn(async move {
            // well past the drop threshold
            tokio::time::sleep(Duration::from_secs(8)).await;
            resume.resume_reading();
        });

        let outcome = handle.write_frame(&Frame::new(1, vec![7u8; 40])).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
        wait_until(|| control.received_len() == 40).await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_releases_stalled_write() {
        let behavior = MockEncoderBehavior {
            read_stdin: false,
            pipe_capacity: 16,
            ..MockEncoderBehavior::stubborn()
        };
        let (handle, _events, control, _) = launch(behavior);

        let writer = handle.clone();
        let write = tokio::spawn(async move { writer.write_frame(&Frame::new(1, vec![3u8; 64])).await });
        tokio::time::sleep(Duration::from_secs(1)).await;

        let start = Instant::now();
        handle.shutdown().await;
        // one stall wait to free the pipe, then both grace periods
        assert!(start.elapsed() <= Duration::from_millis(3200), "{:?}", start.elapsed());
        assert_eq!(write.await.unwrap().unwrap(), WriteOutcome::Rejected);
        assert_eq!(control.kill_calls(), 1);
        assert_eq!(handle.frames_written(), 0);
    }

    #[tokio::test]
    async fn status_lines_become_telemetry() {
        let (_handle, mut events, control, _) = launch(MockEncoderBehavior::default());
        control
            .emit_status("frame=  10 fps= 30 q=23.0 size=  100kB time=00:00:01.00 bitrate=8000.0kbits/s speed=1.0x\r")
            .await;
        match events.recv().await.unwrap() {
            EncoderEvent::Telemetry(t) => {
                assert_eq!(t.fps, Some(30.0));
                assert_eq!(t.time.as_deref(), Some("00:00:01.00"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn graceful_shutdown_closes_input_only() {
        let (handle, mut events, control, _) = launch(MockEncoderBehavior::default());
        let outcome = handle.shutdown().await;
        assert_eq!(outcome, ShutdownOutcome::ExitedAfterClose { code: Some(0) });
        assert!(control.stdin_closed());
        assert_eq!(control.terminate_calls(), 0);
        assert_eq!(control.kill_calls(), 0);
        assert_eq!(next_exit(&mut events).await, Some(0));

        assert_eq!(handle.shutdown().await, ShutdownOutcome::AlreadyStopped);
        let outcome = handle.write_frame(&Frame::new(9, vec![1])).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn stubborn_encoder_gets_exactly_one_kill() {
        let (handle, _events, control, _) = launch(MockEncoderBehavior::stubborn());
        let start = Instant::now();
        let outcome = handle.shutdown().await;
        let elapsed = start.elapsed();

        assert_eq!(outcome, ShutdownOutcome::Killed);
        assert_eq!(control.terminate_calls(), 1);
        assert_eq!(control.kill_calls(), 1);
        assert!(elapsed <= Duration::from_secs(3) + Duration::from_millis(50), "{elapsed:?}");
    }

    #[tokio::test]
    async fn shutdown_after_crash_is_immediate() {
        let (handle, mut events, control, _) = launch(MockEncoderBehavior::default());
        control.crash(137);
        next_exit(&mut events).await;
        assert_eq!(
            handle.shutdown().await,
            ShutdownOutcome::AlreadyExited { code: Some(137) }
        );
        assert_eq!(control.kill_calls(), 0);
    }
}
