//! Pipeline Coordinator: owns the single stream session and drives it through
//! `Idle → Starting → Active → Stopping → Idle`.

pub mod coordinator;
pub mod settings;
pub mod status;

pub use coordinator::{Coordinator, StopOutcome};
pub use settings::PipelineSettings;
pub use status::{EncoderSnapshot, StatusSnapshot};
