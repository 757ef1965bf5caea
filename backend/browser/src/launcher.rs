//! Chromium Launcher
//!
//! Spawns a headless Chromium per session, discovers its DevTools endpoint
//! from stderr and hands back a ready `CdpRenderer`.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use pagecast_core::{Renderer, RendererLauncher, StreamError, Viewport};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cdp_client::CdpClient;
use crate::page_control::{PageControl, PageOptions};
use crate::renderer::CdpRenderer;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const DEVTOOLS_PREFIX: &str = "DevTools listening on ";

/// Low-overhead flags for an unattended capture browser.
const BASE_FLAGS: &[&str] = &[
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-dev-shm-usage",
    "--disable-gpu",
    "--disable-software-rasterizer",
    "--disable-background-networking",
    "--disable-background-timer-throttling",
    "--disable-backgrounding-occluded-windows",
    "--disable-renderer-backgrounding",
    "--disable-extensions",
    "--disable-default-apps",
    "--disable-sync",
    "--disable-translate",
    "--disable-notifications",
    "--metrics-recording-only",
    "--mute-audio",
    "--no-first-run",
    "--no-default-browser-check",
    "--hide-scrollbars",
];

#[derive(Debug, Clone)]
pub struct BrowserSettings {
    pub executable: String,
    pub headless: bool,
    pub launch_timeout: Duration,
    pub command_timeout: Duration,
    pub settle_delay: Duration,
    pub close_grace: Duration,
    pub blocked_urls: Vec<String>,
    pub user_agent: String,
    pub extra_args: Vec<String>,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            executable: "chromium".into(),
            headless: true,
            launch_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(30),
            settle_delay: Duration::from_secs(1),
            close_grace: Duration::from_secs(2),
            blocked_urls: Vec::new(),
            user_agent: DEFAULT_USER_AGENT.into(),
            extra_args: Vec::new(),
        }
    }
}

/// Full Chromium argv for one session.
pub fn chromium_args(settings: &BrowserSettings, viewport: Viewport, user_data_dir: &Path) -> Vec<String> {
    let mut args = Vec::with_capacity(BASE_FLAGS.len() + 6 + settings.extra_args.len());
    if settings.headless {
        args.push("--headless=new".to_string());
    }
    args.push("--remote-debugging-port=0".to_string());
    args.push(format!("--user-data-dir={}", user_data_dir.display()));
    args.push(format!("--window-size={},{}", viewport.width, viewport.height));
    args.extend(BASE_FLAGS.iter().map(|f| f.to_string()));
    args.extend(settings.extra_args.iter().cloned());
    args.push("about:blank".to_string());
    args
}

/// `DevTools listening on ws://127.0.0.1:PORT/devtools/browser/ID` → the URL.
pub fn parse_devtools_line(line: &str) -> Option<&str> {
    let rest = line.trim().strip_prefix(DEVTOOLS_PREFIX)?;
    rest.starts_with("ws://").then_some(rest)
}

pub struct ChromiumLauncher {
    settings: BrowserSettings,
}

impl ChromiumLauncher {
    pub fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &BrowserSettings {
        &self.settings
    }

    async fn launch_inner(
        &self,
        viewport: Viewport,
        child: &mut Child,
    ) -> Result<PageControl> {
        let stderr = child
            .stderr
            .take()
            .context("browser stderr was not captured")?;
        let mut lines = BufReader::new(stderr).lines();

        let endpoint = tokio::time::timeout(
            self.settings.launch_timeout,
            wait_for_endpoint(&mut lines),
        )
        .await
        .map_err(|_| anyhow!("browser did not report a DevTools endpoint within {:?}", self.settings.launch_timeout))??;
        info!(pid = child.id(), "Browser DevTools endpoint at {}", endpoint);

        tokio::spawn(drain_stderr(lines));

        let client = CdpClient::connect(&endpoint, self.settings.command_timeout).await?;
        let opts = PageOptions {
            viewport,
            user_agent: self.settings.user_agent.clone(),
            blocked_urls: self.settings.blocked_urls.clone(),
            settle_delay: self.settings.settle_delay,
        };
        let page = PageControl::open(client, &opts).await?;
        debug!(session = page.session_id(), "Page ready");

        Ok(page)
    }
}

async fn wait_for_endpoint<R>(lines: &mut Lines<BufReader<R>>) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    while let Some(line) = lines.next_line().await? {
        if let Some(url) = parse_devtools_line(&line) {
            return Ok(url.to_string());
        }
        debug!(target: "browser", "{}", line);
    }
    Err(anyhow!("browser exited before reporting a DevTools endpoint"))
}

async fn drain_stderr<R>(mut lines: Lines<BufReader<R>>)
where
    R: AsyncRead + Unpin,
{
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "browser", "{}", line);
    }
}

#[async_trait]
impl RendererLauncher for ChromiumLauncher {
    async fn launch(&self, viewport: Viewport) -> Result<Box<dyn Renderer>, StreamError> {
        let user_data_dir = std::env::temp_dir().join(format!("pagecast-chromium-{}", Uuid::new_v4()));
        let args = chromium_args(&self.settings, viewport, &user_data_dir);
        info!(
            executable = %self.settings.executable,
            headless = self.settings.headless,
            width = viewport.width,
            height = viewport.height,
            "Launching browser"
        );

        let mut child = Command::new(&self.settings.executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                StreamError::Renderer(format!(
                    "failed to spawn {}: {e}",
                    self.settings.executable
                ))
            })?;

        match self.launch_inner(viewport, &mut child).await {
            Ok(page) => Ok(Box::new(CdpRenderer::new(
                page,
                child,
                user_data_dir,
                self.settings.close_grace,
            ))),
            Err(e) => {
                warn!("Browser launch failed: {:#}", e);
                let _ = child.kill().await;
                remove_profile(&user_data_dir).await;
                Err(StreamError::Renderer(format!("{e:#}")))
            }
        }
    }
}

pub(crate) async fn remove_profile(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!("Could not remove browser profile {}: {}", dir.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn viewport() -> Viewport {
        Viewport {
            width: 1280,
            height: 720,
        }
    }

    #[test]
    fn headless_args_include_port_profile_and_size() {
        let args = chromium_args(&BrowserSettings::default(), viewport(), Path::new("/tmp/p"));
        assert_eq!(args[0], "--headless=new");
        assert!(args.contains(&"--remote-debugging-port=0".to_string()));
        assert!(args.contains(&"--user-data-dir=/tmp/p".to_string()));
        assert!(args.contains(&"--window-size=1280,720".to_string()));
        assert!(args.contains(&"--mute-audio".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("about:blank"));
    }

    #[test]
    fn headful_and_extra_args() {
        let settings = BrowserSettings {
            headless: false,
            extra_args: vec!["--lang=en-US".into()],
            ..Default::default()
        };
        let args = chromium_args(&settings, viewport(), Path::new("/tmp/p"));
        assert!(!args.iter().any(|a| a.starts_with("--headless")));
        assert!(args.contains(&"--lang=en-US".to_string()));
    }

    #[test]
    fn parses_devtools_banner() {
        let line = "DevTools listening on ws://127.0.0.1:40123/devtools/browser/abc-123\n";
        assert_eq!(
            parse_devtools_line(line),
            Some("ws://127.0.0.1:40123/devtools/browser/abc-123")
        );
        assert_eq!(parse_devtools_line("[0101/000000.000:ERROR] something"), None);
        assert_eq!(parse_devtools_line("DevTools listening on nowhere"), None);
    }

    #[tokio::test]
    async fn endpoint_wait_skips_noise_and_reports_eof() {
        let input: &[u8] = b"noise\nDevTools listening on ws://h:1/devtools/browser/x\n";
        let mut lines = BufReader::new(input).lines();
        assert_eq!(
            wait_for_endpoint(&mut lines).await.unwrap(),
            "ws://h:1/devtools/browser/x"
        );

        let empty: &[u8] = b"only noise\n";
        let mut lines = BufReader::new(empty).lines();
        assert!(wait_for_endpoint(&mut lines).await.is_err());
    }

    #[tokio::test]
    async fn missing_executable_is_renderer_error() {
        let launcher = ChromiumLauncher::new(BrowserSettings {
            executable: "/nonexistent/pagecast-chromium".into(),
            ..Default::default()
        });
        let err = launcher.launch(viewport()).await.err().unwrap();
        assert!(matches!(err, StreamError::Renderer(_)), "{err:?}");
    }
}
