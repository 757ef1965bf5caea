//! In-memory renderer and encoder doubles.
//!
//! Shared by the unit tests of every pipeline crate; nothing here touches a
//! real browser or a real subprocess.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;

use crate::error::StreamError;
use crate::traits::{EncoderChild, EncoderProcess, EncoderSpawner, Renderer, RendererLauncher};
use crate::types::{ScreenshotOptions, Viewport};

/// PNG signature, returned by default from mock screenshots.
pub const PNG_MAGIC: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

// ---------------------------------------------------------------------------
// Renderer
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RendererScript {
    screenshots: VecDeque<Result<Vec<u8>, String>>,
    reloads: VecDeque<Result<(), String>>,
    navigate_error: Option<String>,
    screenshot_delay: Duration,
    /// Screenshot call number (1-based) that fails as a dead renderer.
    crash_at: Option<(usize, String)>,
    last_url: Option<String>,
}

#[derive(Default)]
struct RendererCounters {
    screenshots: AtomicUsize,
    reloads: AtomicUsize,
    navigations: AtomicUsize,
    closes: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Scripted renderer. Clones share the same script and counters.
#[derive(Clone, Default)]
pub struct MockRenderer {
    script: Arc<Mutex<RendererScript>>,
    counters: Arc<RendererCounters>,
}

impl MockRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `count` failing screenshots ahead of the default successes.
    pub fn fail_screenshots(&self, count: usize, message: &str) {
        let mut script = self.script.lock().unwrap();
        for _ in 0..count {
            script.screenshots.push_back(Err(message.to_string()));
        }
    }

    pub fn push_screenshot(&self, result: Result<Vec<u8>, String>) {
        self.script.lock().unwrap().screenshots.push_back(result);
    }

    /// Make the `call`-th screenshot fail with a non-retryable renderer error.
    pub fn crash_at_screenshot(&self, call: usize, message: &str) {
        self.script.lock().unwrap().crash_at = Some((call, message.to_string()));
    }

    pub fn fail_next_reload(&self, message: &str) {
        self.script
            .lock()
            .unwrap()
            .reloads
            .push_back(Err(message.to_string()));
    }

    pub fn fail_navigation(&self, message: &str) {
        self.script.lock().unwrap().navigate_error = Some(message.to_string());
    }

    pub fn set_screenshot_delay(&self, delay: Duration) {
        self.script.lock().unwrap().screenshot_delay = delay;
    }

    pub fn screenshot_calls(&self) -> usize {
        self.counters.screenshots.load(Ordering::SeqCst)
    }

    pub fn reload_calls(&self) -> usize {
        self.counters.reloads.load(Ordering::SeqCst)
    }

    pub fn navigate_calls(&self) -> usize {
        self.counters.navigations.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }

    /// Highest number of renderer calls ever observed in flight at once.
    pub fn max_concurrent_calls(&self) -> usize {
        self.counters.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn last_url(&self) -> Option<String> {
        self.script.lock().unwrap().last_url.clone()
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(&self.counters)
    }
}

struct InFlight<'a>(&'a RendererCounters);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Renderer for MockRenderer {
    async fn navigate(&mut self, url: &str, _timeout: Duration) -> Result<(), StreamError> {
        let _guard = self.enter();
        self.counters.navigations.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        script.last_url = Some(url.to_string());
        match &script.navigate_error {
            Some(message) => Err(StreamError::Renderer(message.clone())),
            None => Ok(()),
        }
    }

    async fn screenshot(&mut self, _opts: &ScreenshotOptions) -> Result<Vec<u8>, StreamError> {
        let _guard = self.enter();
        let call = self.counters.screenshots.fetch_add(1, Ordering::SeqCst) + 1;
        let (delay, crash, next) = {
            let mut script = self.script.lock().unwrap();
            let crash = match &script.crash_at {
                Some((at, message)) if *at == call => Some(message.clone()),
                _ => None,
            };
            (script.screenshot_delay, crash, script.screenshots.pop_front())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = crash {
            return Err(StreamError::Renderer(message));
        }
        match next {
            Some(Ok(bytes)) => Ok(bytes),
            Some(Err(message)) => Err(StreamError::Capture(message)),
            None => Ok(PNG_MAGIC.to_vec()),
        }
    }

    async fn reload(&mut self, _timeout: Duration) -> Result<(), StreamError> {
        let _guard = self.enter();
        self.counters.reloads.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().reloads.pop_front();
        match next {
            Some(Err(message)) => Err(StreamError::Reload(message)),
            _ => Ok(()),
        }
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        let _guard = self.enter();
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out clones of one `MockRenderer`.
#[derive(Default)]
pub struct MockLauncher {
    renderer: MockRenderer,
    failure: Mutex<Option<String>>,
    launches: AtomicUsize,
}

impl MockLauncher {
    pub fn new(renderer: MockRenderer) -> Self {
        Self {
            renderer,
            ..Default::default()
        }
    }

    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn renderer(&self) -> &MockRenderer {
        &self.renderer
    }
}

#[async_trait]
impl RendererLauncher for MockLauncher {
    async fn launch(&self, _viewport: Viewport) -> Result<Box<dyn Renderer>, StreamError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(StreamError::Renderer(message));
        }
        Ok(Box::new(self.renderer.clone()))
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// How a mock encoder reacts to the shutdown escalation.
#[derive(Debug, Clone)]
pub struct MockEncoderBehavior {
    /// Exit with code 0 once stdin reaches EOF.
    pub exit_on_stdin_close: bool,
    /// Exit when SIGTERM arrives.
    pub honor_terminate: bool,
    /// Drain stdin from the start. When false the pipe fills up until
    /// `resume_reading` is called.
    pub read_stdin: bool,
    pub pipe_capacity: usize,
}

impl Default for MockEncoderBehavior {
    fn default() -> Self {
        Self {
            exit_on_stdin_close: true,
            honor_terminate: true,
            read_stdin: true,
            pipe_capacity: 64 * 1024,
        }
    }
}

impl MockEncoderBehavior {
    /// Ignores both the closed input and SIGTERM; only SIGKILL ends it.
    pub fn stubborn() -> Self {
        Self {
            exit_on_stdin_close: false,
            honor_terminate: false,
            ..Default::default()
        }
    }
}

struct MockEncoderShared {
    behavior: MockEncoderBehavior,
    received: Mutex<Vec<u8>>,
    stdin_closed: AtomicBool,
    terminate_calls: AtomicUsize,
    kill_calls: AtomicUsize,
    exit_tx: watch::Sender<Option<Option<i32>>>,
    reading_tx: watch::Sender<bool>,
    stderr: tokio::sync::Mutex<Option<DuplexStream>>,
}

impl MockEncoderShared {
    fn exit(&self, code: Option<i32>) {
        self.exit_tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(code);
                true
            } else {
                false
            }
        });
    }
}

/// Test-side handle on one spawned mock encoder.
#[derive(Clone)]
pub struct MockEncoderControl {
    shared: Arc<MockEncoderShared>,
}

impl MockEncoderControl {
    pub fn received(&self) -> Vec<u8> {
        self.shared.received.lock().unwrap().clone()
    }

    pub fn received_len(&self) -> usize {
        self.shared.received.lock().unwrap().len()
    }

    pub fn stdin_closed(&self) -> bool {
        self.shared.stdin_closed.load(Ordering::SeqCst)
    }

    pub fn terminate_calls(&self) -> usize {
        self.shared.terminate_calls.load(Ordering::SeqCst)
    }

    pub fn kill_calls(&self) -> usize {
        self.shared.kill_calls.load(Ordering::SeqCst)
    }

    pub fn has_exited(&self) -> bool {
        self.shared.exit_tx.borrow().is_some()
    }

    /// Simulate the process dying on its own.
    pub fn crash(&self, code: i32) {
        self.shared.exit(Some(code));
    }

    pub fn resume_reading(&self) {
        self.shared.reading_tx.send_replace(true);
    }

    /// Write raw text to the mock's stderr, as the encoder would.
    pub async fn emit_status(&self, text: &str) {
        let mut stderr = self.shared.stderr.lock().await;
        if let Some(writer) = stderr.as_mut() {
            let _ = writer.write_all(text.as_bytes()).await;
        }
    }
}

struct MockProcess {
    shared: Arc<MockEncoderShared>,
    exit_rx: watch::Receiver<Option<Option<i32>>>,
}

#[async_trait]
impl EncoderProcess for MockProcess {
    fn id(&self) -> Option<u32> {
        Some(4242)
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let exit = self
            .exit_rx
            .wait_for(|slot| slot.is_some())
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
        Ok((*exit).flatten())
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.shared.terminate_calls.fetch_add(1, Ordering::SeqCst);
        if self.shared.behavior.honor_terminate {
            self.shared.exit(None);
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.shared.kill_calls.fetch_add(1, Ordering::SeqCst);
        self.shared.exit(None);
        Ok(())
    }
}

/// Spawns in-memory encoders wired through duplex pipes.
#[derive(Default)]
pub struct MockEncoderSpawner {
    behavior: MockEncoderBehavior,
    failure: Mutex<Option<String>>,
    spawned: Mutex<Vec<MockEncoderControl>>,
    last_args: Mutex<Vec<String>>,
}

impl MockEncoderSpawner {
    pub fn new(behavior: MockEncoderBehavior) -> Self {
        Self {
            behavior,
            ..Default::default()
        }
    }

    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<MockEncoderControl> {
        self.spawned.lock().unwrap().last().cloned()
    }

    pub fn last_args(&self) -> Vec<String> {
        self.last_args.lock().unwrap().clone()
    }
}

impl EncoderSpawner for MockEncoderSpawner {
    fn spawn(&self, _program: &str, args: &[String]) -> Result<EncoderChild, StreamError> {
        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(StreamError::EncoderSpawn(message));
        }
        *self.last_args.lock().unwrap() = args.to_vec();

        let capacity = self.behavior.pipe_capacity;
        let (stdin_ours, mut stdin_theirs) = tokio::io::duplex(capacity);
        let (stderr_ours, stderr_theirs) = tokio::io::duplex(capacity);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (reading_tx, mut reading_rx) = watch::channel(self.behavior.read_stdin);

        let shared = Arc::new(MockEncoderShared {
            behavior: self.behavior.clone(),
            received: Mutex::new(Vec::new()),
            stdin_closed: AtomicBool::new(false),
            terminate_calls: AtomicUsize::new(0),
            kill_calls: AtomicUsize::new(0),
            exit_tx,
            reading_tx,
            stderr: tokio::sync::Mutex::new(Some(stderr_theirs)),
        });

        let reader = Arc::clone(&shared);
        tokio::spawn(async move {
            if reading_rx.wait_for(|reading| *reading).await.is_err() {
                return;
            }
            let mut buf = [0u8; 8192];
            loop {
                match stdin_theirs.read(&mut buf).await {
                    Ok(0) | Err(_) => {
                        reader.stdin_closed.store(true, Ordering::SeqCst);
                        if reader.behavior.exit_on_stdin_close {
                            reader.exit(Some(0));
                        }
                        break;
                    }
                    Ok(n) => {
                        reader.received.lock().unwrap().extend_from_slice(&buf[..n]);
                    }
                }
            }
        });

        // A dead process closes its stderr.
        let closer = Arc::clone(&shared);
        let mut closer_rx = exit_rx.clone();
        tokio::spawn(async move {
            let _ = closer_rx.wait_for(|slot| slot.is_some()).await;
            closer.stderr.lock().await.take();
        });

        self.spawned.lock().unwrap().push(MockEncoderControl {
            shared: Arc::clone(&shared),
        });

        Ok(EncoderChild {
            stdin: Box::new(stdin_ours),
            stderr: Box::new(stderr_ours),
            process: Box::new(MockProcess { shared, exit_rx }),
        })
    }
}
