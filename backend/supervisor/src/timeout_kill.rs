//! Timeout Killer
//!
//! Escalates shutdown of the encoder until it is gone:
//! close stdin -> wait -> SIGTERM -> wait -> SIGKILL.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{info, warn};

/// Exit slot published by the reaper: `None` while running, then
/// `Some(code)` where `code` is `None` for a signal death.
pub type ExitWatch = watch::Receiver<Option<Option<i32>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Shutdown already ran on this handle.
    AlreadyStopped,
    /// The process was gone before shutdown started.
    AlreadyExited { code: Option<i32> },
    ExitedAfterClose { code: Option<i32> },
    Terminated { code: Option<i32> },
    Killed,
    /// Even SIGKILL went unanswered within the kill wait.
    Unresponsive,
}

#[derive(Debug, Clone, Copy)]
pub struct TimeoutKill {
    pub close_grace: Duration,
    pub terminate_grace: Duration,
    pub kill_wait: Duration,
}

impl Default for TimeoutKill {
    fn default() -> Self {
        Self {
            close_grace: Duration::from_secs(1),
            terminate_grace: Duration::from_secs(2),
            kill_wait: Duration::from_secs(1),
        }
    }
}

impl TimeoutKill {
    /// Run every tier that is still needed. `close_input` drops the encoder's
    /// stdin; `signal` delivers a signal and reports whether it was sent.
    pub async fn escalate<C, F>(&self, exit: &mut ExitWatch, close_input: C, signal: F) -> ShutdownOutcome
    where
        C: Future<Output = ()>,
        F: Fn(Signal) -> bool,
    {
        let exited = *exit.borrow();
        if let Some(code) = exited {
            close_input.await;
            return ShutdownOutcome::AlreadyExited { code };
        }

        close_input.await;
        if let Some(code) = wait_exit(exit, self.close_grace).await {
            info!(?code, "Encoder exited after input closed");
            return ShutdownOutcome::ExitedAfterClose { code };
        }

        warn!(grace = ?self.close_grace, "Encoder still running after input closed. Sending SIGTERM...");
        if signal(Signal::Terminate) {
            if let Some(code) = wait_exit(exit, self.terminate_grace).await {
                info!(?code, "Encoder exited after SIGTERM");
                return ShutdownOutcome::Terminated { code };
            }
        }

        warn!(grace = ?self.terminate_grace, "Encoder ignored SIGTERM. Escalating to SIGKILL.");
        signal(Signal::Kill);
        match wait_exit(exit, self.kill_wait).await {
            Some(_) => ShutdownOutcome::Killed,
            None => {
                warn!("Encoder did not exit after SIGKILL");
                ShutdownOutcome::Unresponsive
            }
        }
    }
}

async fn wait_exit(exit: &mut ExitWatch, limit: Duration) -> Option<Option<i32>> {
    match timeout(limit, exit.wait_for(|slot| slot.is_some())).await {
        Ok(Ok(slot)) => *slot,
        // Reaper gone without publishing: nothing left to wait on.
        Ok(Err(_)) => Some(None),
        Err(_) => None,
    }
}
