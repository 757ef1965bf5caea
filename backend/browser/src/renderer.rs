//! `Renderer` implementation over a live Chromium process.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use pagecast_core::{Renderer, ScreenshotOptions, StreamError};
use serde_json::json;
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::launcher::remove_profile;
use crate::page_control::PageControl;
use crate::screenshot::ScreenshotCapturer;

pub struct CdpRenderer {
    page: PageControl,
    capturer: ScreenshotCapturer,
    process: Child,
    user_data_dir: PathBuf,
    close_grace: Duration,
    closed: bool,
}

impl CdpRenderer {
    pub fn new(page: PageControl, process: Child, user_data_dir: PathBuf, close_grace: Duration) -> Self {
        let capturer = ScreenshotCapturer::new(page.client().clone(), page.session_id());
        Self {
            page,
            capturer,
            process,
            user_data_dir,
            close_grace,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<(), StreamError> {
        if self.closed || self.page.client().is_closed() {
            return Err(StreamError::Renderer("browser connection is closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Renderer for CdpRenderer {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<(), StreamError> {
        self.ensure_open()?;
        self.page
            .navigate(url, timeout)
            .await
            .map_err(|e| StreamError::Renderer(format!("{e:#}")))
    }

    async fn screenshot(&mut self, opts: &ScreenshotOptions) -> Result<Vec<u8>, StreamError> {
        if self.closed {
            return Err(StreamError::Capture("renderer is closed".into()));
        }
        self.capturer
            .capture(opts)
            .await
            .map_err(|e| StreamError::Capture(format!("{e:#}")))
    }

    async fn reload(&mut self, timeout: Duration) -> Result<(), StreamError> {
        if self.closed {
            return Err(StreamError::Reload("renderer is closed".into()));
        }
        self.page
            .reload(timeout)
            .await
            .map_err(|e| StreamError::Reload(format!("{e:#}")))
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        info!(pid = self.process.id(), "Closing browser");

        let client = self.page.client();
        if !client.is_closed() {
            if let Err(e) = self.page.close_target().await {
                debug!("Closing page target failed: {:#}", e);
            }
            if let Err(e) = client
                .send_command_with_timeout("Browser.close", json!({}), None, self.close_grace)
                .await
            {
                // The socket usually drops before the reply arrives.
                debug!("Browser.close: {:#}", e);
            }
        }

        match tokio::time::timeout(self.close_grace, self.process.wait()).await {
            Ok(Ok(status)) => debug!(?status, "Browser exited"),
            Ok(Err(e)) => warn!("Waiting for browser exit failed: {}", e),
            Err(_) => {
                warn!("Browser did not exit within {:?}, killing", self.close_grace);
                if let Err(e) = self.process.kill().await {
                    warn!("Killing browser failed: {}", e);
                }
            }
        }

        remove_profile(&self.user_data_dir).await;
        Ok(())
    }
}
