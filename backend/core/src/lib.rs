pub mod error;
pub mod mock;
pub mod traits;
pub mod types;

pub use error::{ErrorKind, FailureReason, StreamError};
pub use traits::{EncoderChild, EncoderProcess, EncoderSpawner, FrameSink, Renderer, RendererLauncher};
pub use types::{
    Clip, EncoderEvent, EncoderTelemetry, Frame, ResourceSample, ScreenshotOptions, SessionState,
    StreamConfig, Viewport, WriteOutcome,
};
