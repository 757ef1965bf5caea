pub mod cdp_client;
pub mod launcher;
pub mod page_control;
pub mod renderer;
pub mod screenshot;

pub use cdp_client::{CdpClient, CdpEvent};
pub use launcher::{BrowserSettings, ChromiumLauncher};
pub use page_control::PageControl;
pub use renderer::CdpRenderer;
pub use screenshot::ScreenshotCapturer;
