pub mod encoder_args;
pub mod encoder_manager;
pub mod process;
pub mod status_reader;
pub mod timeout_kill;

pub use encoder_args::{resolution_floor, BitratePlan, EncoderPlan};
pub use encoder_manager::{EncoderHandle, EncoderManager, EncoderSettings};
pub use process::ProcessSpawner;
pub use timeout_kill::{ShutdownOutcome, TimeoutKill};
