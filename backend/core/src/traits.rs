use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::StreamError;
use crate::types::{Frame, ScreenshotOptions, Viewport, WriteOutcome};

/// Headless page renderer.
///
/// Every method takes `&mut self`: the renderer is non-reentrant, so a
/// screenshot can never overlap a reload or a navigation.
#[async_trait]
pub trait Renderer: Send {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<(), StreamError>;

    async fn screenshot(&mut self, opts: &ScreenshotOptions) -> Result<Vec<u8>, StreamError>;

    async fn reload(&mut self, timeout: Duration) -> Result<(), StreamError>;

    /// Release the page and the browser behind it. Must be safe to call once
    /// after any failure.
    async fn close(&mut self) -> Result<(), StreamError>;
}

/// Provisions a fresh renderer for each session.
#[async_trait]
pub trait RendererLauncher: Send + Sync {
    async fn launch(&self, viewport: Viewport) -> Result<Box<dyn Renderer>, StreamError>;
}

/// Control over a spawned encoder process, owned by a single reaper task.
#[async_trait]
pub trait EncoderProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Resolve once the process has exited. `None` means it died from a signal.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Ask the process to terminate (SIGTERM on unix).
    fn terminate(&mut self) -> io::Result<()>;

    /// Kill the process unconditionally (SIGKILL on unix).
    fn kill(&mut self) -> io::Result<()>;
}

/// The three standard-stream-shaped pieces of a running encoder.
pub struct EncoderChild {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
    pub process: Box<dyn EncoderProcess>,
}

/// Launches the external encoder from a program name and argv.
pub trait EncoderSpawner: Send + Sync {
    fn spawn(&self, program: &str, args: &[String]) -> Result<EncoderChild, StreamError>;
}

/// Destination for captured frames.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Consumes the frame; it is dropped as soon as the write settles.
    async fn deliver(&self, frame: Frame) -> Result<WriteOutcome, StreamError>;
}
