use chrono::{DateTime, Utc};
use pagecast_core::{EncoderTelemetry, FailureReason, SessionState, StreamConfig};
use pagecast_scheduler::{CaptureCounters, MemorySnapshot};
use serde::Serialize;
use uuid::Uuid;

/// Point-in-time view of the coordinator, serialized as-is by the control API.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: SessionState,
    pub session_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: Option<u64>,
    pub target_url: String,
    pub config: StreamConfig,
    pub counters: CaptureCounters,
    pub encoder: Option<EncoderSnapshot>,
    pub memory: MemorySnapshot,
    pub last_failure: Option<FailureReason>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EncoderSnapshot {
    pub pid: Option<u32>,
    pub frames_written: u64,
    pub frames_dropped: u64,
    pub bytes_written: u64,
    pub telemetry: Option<EncoderTelemetry>,
}
