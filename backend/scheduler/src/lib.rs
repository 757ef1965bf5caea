pub mod capture;
pub mod resource_monitor;
pub mod retry;

pub use capture::{CaptureCounters, CaptureScheduler, CaptureSettings, CaptureStats, LoopExit};
pub use resource_monitor::{
    MemorySampler, MemorySnapshot, MonitorSettings, ProcMemorySampler, ResourceMonitor,
};
pub use retry::{RetryDecision, RetryPolicy, RetryState};
