use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::types::SessionState;

/// Top-level error type for the capture→encode pipeline.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("renderer error: {0}")]
    Renderer(String),

    #[error("capture failed: {0}")]
    Capture(String),

    #[error("capture timed out after {0:?}")]
    CaptureTimeout(Duration),

    #[error("renderer reload failed: {0}")]
    Reload(String),

    #[error("failed to spawn encoder: {0}")]
    EncoderSpawn(String),

    #[error("encoder exited unexpectedly ({})", exit_label(.code))]
    EncoderCrash { code: Option<i32> },

    #[error("encoder input is closed")]
    EncoderClosed,

    #[error("cannot {action} while session is {state}")]
    InvalidState {
        action: &'static str,
        state: SessionState,
    },

    #[error("session start cancelled by stop request")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

/// Coarse classification used in status reports and API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Renderer,
    Capture,
    Reload,
    EncoderSpawn,
    EncoderCrash,
    EncoderClosed,
    InvalidState,
    Cancelled,
    Internal,
}

impl StreamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StreamError::Config(_) => ErrorKind::Config,
            StreamError::Renderer(_) => ErrorKind::Renderer,
            StreamError::Capture(_) | StreamError::CaptureTimeout(_) => ErrorKind::Capture,
            StreamError::Reload(_) => ErrorKind::Reload,
            StreamError::EncoderSpawn(_) => ErrorKind::EncoderSpawn,
            StreamError::EncoderCrash { .. } => ErrorKind::EncoderCrash,
            StreamError::EncoderClosed => ErrorKind::EncoderClosed,
            StreamError::InvalidState { .. } => ErrorKind::InvalidState,
            StreamError::Cancelled => ErrorKind::Cancelled,
            StreamError::Other(_) => ErrorKind::Internal,
        }
    }

    /// Capture failures feed the scheduler's retry/reload policy; everything
    /// else ends the session.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Capture)
    }
}

/// Failure reason retained by the coordinator and returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct FailureReason {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl From<&StreamError> for FailureReason {
    fn from(err: &StreamError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            at: Utc::now(),
        }
    }
}
