use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pagecast_core::{
    EncoderEvent, EncoderSpawner, EncoderTelemetry, FailureReason, Renderer, RendererLauncher,
    ScreenshotOptions, SessionState, StreamConfig, StreamError,
};
use pagecast_scheduler::{
    CaptureScheduler, CaptureStats, LoopExit, MemorySnapshot, ProcMemorySampler, ResourceMonitor,
};
use pagecast_supervisor::{EncoderHandle, EncoderManager};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::settings::PipelineSettings;
use crate::status::{EncoderSnapshot, StatusSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// A running or starting session was torn down.
    Stopped,
    /// Nothing was running.
    AlreadyIdle,
    /// Another stop (or a failure teardown) was already underway; this call
    /// waited for it to finish.
    AlreadyStopping,
}

/// The session currently occupying the slot.
struct LiveSession {
    id: Uuid,
    generation: u64,
    started_at: DateTime<Utc>,
    started: Instant,
    config: StreamConfig,
    cancel: watch::Sender<bool>,
    stats: Option<Arc<CaptureStats>>,
    monitor: Option<Arc<ResourceMonitor>>,
    encoder: Option<EncoderHandle>,
    telemetry: Arc<Mutex<Option<EncoderTelemetry>>>,
}

#[derive(Default)]
struct Slot {
    state: SessionState,
    generation: u64,
    session: Option<LiveSession>,
    last_failure: Option<FailureReason>,
}

struct Inner {
    settings: PipelineSettings,
    launcher: Arc<dyn RendererLauncher>,
    encoders: EncoderManager,
    slot: Mutex<Slot>,
    state_tx: watch::Sender<SessionState>,
}

impl Inner {
    /// Caller holds the slot lock.
    fn set_state(&self, slot: &mut Slot, state: SessionState) {
        if slot.state != state {
            info!(from = %slot.state, to = %state, "Session state changed");
        }
        slot.state = state;
        self.state_tx.send_replace(state);
    }

    /// Back to `Idle` if the slot still belongs to `generation`.
    fn settle_idle(&self, generation: u64) {
        let mut slot = self.slot.lock();
        if slot.generation == generation {
            slot.session = None;
            self.set_state(&mut slot, SessionState::Idle);
        }
    }

    fn record_failure(&self, generation: u64, err: &StreamError) {
        let mut slot = self.slot.lock();
        if slot.generation != generation {
            return;
        }
        slot.last_failure = Some(FailureReason::from(err));
        if matches!(slot.state, SessionState::Starting | SessionState::Active) {
            self.set_state(&mut slot, SessionState::Failed);
        }
    }

    /// Launch, navigate, warm up, spawn. Every step races the cancel flag;
    /// on any error the renderer opened so far is closed before returning.
    async fn provision(
        &self,
        config: &StreamConfig,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Provisioned, StreamError> {
        let settings = &self.settings;

        let launch = async {
            timeout(settings.launch_timeout, self.launcher.launch(config.viewport()))
                .await
                .unwrap_or_else(|_| {
                    Err(StreamError::Renderer(format!(
                        "browser launch timed out after {:?}",
                        settings.launch_timeout
                    )))
                })
        };
        let mut renderer = or_cancelled(cancel, launch).await?;

        match self.prepare(renderer.as_mut(), config, cancel).await {
            Ok((encoder, events)) => Ok(Provisioned {
                renderer,
                encoder,
                events,
            }),
            Err(e) => {
                self.close_renderer(renderer.as_mut()).await;
                Err(e)
            }
        }
    }

    async fn prepare(
        &self,
        renderer: &mut dyn Renderer,
        config: &StreamConfig,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(EncoderHandle, mpsc::Receiver<EncoderEvent>), StreamError> {
        let settings = &self.settings;

        let navigate = async {
            timeout(
                settings.navigate_timeout,
                renderer.navigate(&settings.target_url, settings.navigate_timeout),
            )
            .await
            .unwrap_or_else(|_| {
                Err(StreamError::Renderer(format!(
                    "navigation timed out after {:?}",
                    settings.navigate_timeout
                )))
            })
        };
        or_cancelled(cancel, navigate).await?;

        let warmup = async {
            timeout(settings.warmup_timeout, renderer.screenshot(&ScreenshotOptions::warmup()))
                .await
                .unwrap_or_else(|_| Err(StreamError::CaptureTimeout(settings.warmup_timeout)))
        };
        // Only exercises the capture path; the bytes are discarded.
        let warm = or_cancelled(cancel, warmup).await?;
        drop(warm);

        if *cancel.borrow() {
            return Err(StreamError::Cancelled);
        }
        self.encoders.launch(config)
    }

    async fn close_renderer(&self, renderer: &mut dyn Renderer) {
        close_with_timeout(renderer, self.settings.renderer_close_timeout).await;
    }

    /// `Starting` → `Active` if the slot still belongs to `generation`.
    fn activate(&self, generation: u64) -> bool {
        let mut slot = self.slot.lock();
        if slot.generation != generation || slot.state != SessionState::Starting {
            return false;
        }
        slot.last_failure = None;
        self.set_state(&mut slot, SessionState::Active);
        true
    }

    /// Expose the session's counters, monitor and encoder to `status()`.
    fn attach(
        &self,
        generation: u64,
        stats: Arc<CaptureStats>,
        monitor: Arc<ResourceMonitor>,
        encoder: EncoderHandle,
    ) {
        let mut slot = self.slot.lock();
        if let Some(session) = slot.session.as_mut().filter(|s| s.generation == generation) {
            session.stats = Some(stats);
            session.monitor = Some(monitor);
            session.encoder = Some(encoder);
        }
    }
}

/// Owns the single stream session. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Provisioned {
    renderer: Box<dyn Renderer>,
    encoder: EncoderHandle,
    events: mpsc::Receiver<EncoderEvent>,
}

impl Coordinator {
    pub fn new(
        settings: PipelineSettings,
        launcher: Arc<dyn RendererLauncher>,
        spawner: Arc<dyn EncoderSpawner>,
    ) -> Self {
        let encoders = EncoderManager::new(settings.encoder.clone(), spawner);
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            inner: Arc::new(Inner {
                settings,
                launcher,
                encoders,
                slot: Mutex::new(Slot::default()),
                state_tx,
            }),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.inner.settings
    }

    pub fn state(&self) -> SessionState {
        self.inner.slot.lock().state
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Provision a renderer and an encoder and start capturing. Only allowed
    /// from `Idle`; any other state is rejected, never queued. Resolves once
    /// the session is `Active`.
    ///
    /// The session runs on its own task from the moment it is admitted, so
    /// dropping this future never strands the slot: the session carries on
    /// and `stop()` can still tear it down.
    pub async fn start(&self) -> Result<Uuid, StreamError> {
        let inner = &self.inner;
        let config = inner.settings.stream.clone();

        let (id, generation, cancel_rx, telemetry) = {
            let mut slot = inner.slot.lock();
            if slot.state != SessionState::Idle {
                return Err(StreamError::InvalidState {
                    action: "start",
                    state: slot.state,
                });
            }
            inner.settings.validate()?;

            slot.generation += 1;
            let generation = slot.generation;
            let id = Uuid::new_v4();
            let (cancel_tx, cancel_rx) = watch::channel(false);
            let telemetry = Arc::new(Mutex::new(None));
            slot.session = Some(LiveSession {
                id,
                generation,
                started_at: Utc::now(),
                started: Instant::now(),
                config: config.clone(),
                cancel: cancel_tx,
                stats: None,
                monitor: None,
                encoder: None,
                telemetry: telemetry.clone(),
            });
            inner.set_state(&mut slot, SessionState::Starting);
            (id, generation, cancel_rx, telemetry)
        };
        info!(session = %id, url = %inner.settings.target_url, "Starting stream session");

        let (started_tx, started_rx) = oneshot::channel();
        tokio::spawn(run_session(SessionRun {
            inner: Arc::clone(inner),
            id,
            generation,
            config,
            telemetry,
            cancel: cancel_rx,
            started: started_tx,
        }));

        started_rx.await.unwrap_or_else(|_| {
            Err(StreamError::Other(anyhow::anyhow!(
                "session task ended without reporting"
            )))
        })
    }

    /// Tear the session down. From `Starting`/`Active` this cancels the
    /// session and waits for `Idle`; from `Idle` it does nothing.
    pub async fn stop(&self) -> Result<StopOutcome, StreamError> {
        let mut state_rx = self.inner.state_tx.subscribe();
        let outcome = {
            let mut slot = self.inner.slot.lock();
            match slot.state {
                SessionState::Idle => return Ok(StopOutcome::AlreadyIdle),
                SessionState::Stopping | SessionState::Failed => StopOutcome::AlreadyStopping,
                SessionState::Starting | SessionState::Active => {
                    self.inner.set_state(&mut slot, SessionState::Stopping);
                    if let Some(session) = &slot.session {
                        info!(session = %session.id, "Stopping stream session");
                        session.cancel.send_replace(true);
                    }
                    StopOutcome::Stopped
                }
            }
        };

        state_rx
            .wait_for(|state| *state == SessionState::Idle)
            .await
            .map_err(|e| StreamError::Other(anyhow::anyhow!("state channel closed: {e}")))?;
        Ok(outcome)
    }

    pub fn status(&self) -> StatusSnapshot {
        let slot = self.inner.slot.lock();
        let session = slot.session.as_ref();

        let counters = session
            .and_then(|s| s.stats.as_ref())
            .map(|stats| stats.snapshot())
            .unwrap_or_default();
        let memory = session
            .and_then(|s| s.monitor.as_ref())
            .map(|m| m.snapshot())
            .unwrap_or_else(MemorySnapshot::default);
        let encoder = session.and_then(|s| {
            s.encoder.as_ref().map(|handle| EncoderSnapshot {
                pid: handle.pid(),
                frames_written: handle.frames_written(),
                frames_dropped: handle.frames_dropped(),
                bytes_written: handle.bytes_written(),
                telemetry: s.telemetry.lock().clone(),
            })
        });

        StatusSnapshot {
            state: slot.state,
            session_id: session.map(|s| s.id),
            started_at: session.map(|s| s.started_at),
            uptime_secs: session.map(|s| s.started.elapsed().as_secs()),
            target_url: self.inner.settings.target_url.clone(),
            config: session
                .map(|s| s.config.clone())
                .unwrap_or_else(|| self.inner.settings.stream.clone()),
            counters,
            encoder,
            memory,
            last_failure: slot.last_failure.clone(),
        }
    }
}

async fn or_cancelled<T, F>(cancel: &mut watch::Receiver<bool>, fut: F) -> Result<T, StreamError>
where
    F: Future<Output = Result<T, StreamError>>,
{
    tokio::select! {
        result = fut => result,
        _ = cancel.wait_for(|stop| *stop) => Err(StreamError::Cancelled),
    }
}

async fn close_with_timeout(renderer: &mut dyn Renderer, limit: std::time::Duration) {
    match timeout(limit, renderer.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Renderer close failed: {}", e),
        Err(_) => warn!(limit = ?limit, "Renderer close timed out"),
    }
}

struct SessionRun {
    inner: Arc<Inner>,
    id: Uuid,
    generation: u64,
    config: StreamConfig,
    telemetry: Arc<Mutex<Option<EncoderTelemetry>>>,
    cancel: watch::Receiver<bool>,
    started: oneshot::Sender<Result<Uuid, StreamError>>,
}

/// Session runner: provisions, captures and tears down. The only place
/// teardown happens, so it runs exactly once per session whatever ended it.
/// Until the first capture the outcome goes back to the `start()` caller.
async fn run_session(run: SessionRun) {
    let SessionRun {
        inner,
        id,
        generation,
        config,
        telemetry,
        mut cancel,
        started,
    } = run;

    let Provisioned {
        mut renderer,
        encoder,
        mut events,
    } = match inner.provision(&config, &mut cancel).await {
        Ok(p) => p,
        Err(e) => {
            if matches!(e, StreamError::Cancelled) {
                info!(session = %id, "Session start cancelled");
            } else {
                error!(session = %id, "Session start failed: {}", e);
                inner.record_failure(generation, &e);
            }
            inner.settle_idle(generation);
            let _ = started.send(Err(e));
            return;
        }
    };

    let monitor = Arc::new(ResourceMonitor::new(
        inner.settings.monitor.clone(),
        Box::new(ProcMemorySampler),
    ));
    let scheduler = CaptureScheduler::new(inner.settings.capture_for_session())
        .with_monitor(monitor.clone());
    inner.attach(generation, scheduler.stats(), monitor.clone(), encoder.clone());

    let (monitor_stop_tx, monitor_stop_rx) = watch::channel(false);
    let monitor_task = tokio::spawn({
        let monitor = monitor.clone();
        async move { monitor.run(monitor_stop_rx).await }
    });

    let mut started = Some(started);
    let exit = {
        let (first_tx, first_rx) = oneshot::channel();
        let activated = async {
            if first_rx.await.is_ok() && inner.activate(generation) {
                info!(session = %id, "Stream session active");
                if let Some(tx) = started.take() {
                    let _ = tx.send(Ok(id));
                }
            }
        };
        let capture = async {
            let (exit, ()) = tokio::join!(
                scheduler.run(renderer.as_mut(), &encoder, cancel.clone(), Some(first_tx)),
                activated,
            );
            exit
        };
        let crashed = watch_encoder(&mut events, &telemetry);
        let drained = drain_deadline(cancel.clone(), inner.settings.drain_timeout);
        tokio::select! {
            exit = capture => exit,
            err = crashed => LoopExit::Failed(err),
            _ = drained => {
                warn!("Capture loop did not stop in time, abandoning it");
                LoopExit::Cancelled
            }
        }
    };

    let failure = match exit {
        LoopExit::Failed(err) => {
            // A closed input usually means the encoder died; report the exit code.
            let err = match (err, encoder.exit_status()) {
                (StreamError::EncoderClosed, Some(code)) => StreamError::EncoderCrash { code },
                (err, _) => err,
            };
            error!("Stream session failed: {}", err);
            inner.record_failure(generation, &err);
            Some(err)
        }
        LoopExit::Cancelled => None,
    };

    drop(events);
    monitor_stop_tx.send_replace(true);
    if let Err(e) = monitor_task.await {
        warn!("Resource monitor task ended abnormally: {}", e);
    }
    let outcome = encoder.shutdown().await;
    info!(?outcome, "Encoder shutdown complete");
    close_with_timeout(renderer.as_mut(), inner.settings.renderer_close_timeout).await;

    inner.settle_idle(generation);
    info!(frames = monitor.frames(), peak_mb = monitor.snapshot().peak_mb, "Stream session ended");

    // Never became active: the caller gets the error that ended it.
    if let Some(tx) = started {
        let _ = tx.send(Err(failure.unwrap_or(StreamError::Cancelled)));
    }
}

/// Stores telemetry; resolves with a crash error when the encoder exits.
async fn watch_encoder(
    events: &mut mpsc::Receiver<EncoderEvent>,
    telemetry: &Mutex<Option<EncoderTelemetry>>,
) -> StreamError {
    while let Some(event) = events.recv().await {
        match event {
            EncoderEvent::Telemetry(t) => *telemetry.lock() = Some(t),
            EncoderEvent::Exited { code } => return StreamError::EncoderCrash { code },
        }
    }
    // The reaper always reports before hanging up.
    std::future::pending().await
}

async fn drain_deadline(mut cancel: watch::Receiver<bool>, limit: std::time::Duration) {
    if cancel.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
    tokio::time::sleep(limit).await;
}
