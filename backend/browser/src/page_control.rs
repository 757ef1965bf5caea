//! Page Control
//!
//! Owns one page target: creation, emulation setup, navigation and reload.
//! Load completion is signalled by `Page.domContentEventFired` followed by a
//! short settle delay for late layout.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use pagecast_core::Viewport;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::cdp_client::{CdpClient, CdpEvent};

/// Zeroes CSS animation and transition timings so every frame is stable.
pub const FREEZE_ANIMATIONS_SCRIPT: &str = r#"(() => {
  const install = () => {
    const style = document.createElement('style');
    style.textContent = '*, *::before, *::after { animation-duration: 0s !important; animation-delay: 0s !important; transition-duration: 0s !important; transition-delay: 0s !important; }';
    (document.head || document.documentElement).appendChild(style);
  };
  if (document.readyState === 'loading') {
    document.addEventListener('DOMContentLoaded', install);
  } else {
    install();
  }
})();"#;

const DOM_CONTENT_EVENT: &str = "Page.domContentEventFired";

#[derive(Debug, Clone)]
pub struct PageOptions {
    pub viewport: Viewport,
    pub user_agent: String,
    pub blocked_urls: Vec<String>,
    pub settle_delay: Duration,
}

pub struct PageControl {
    client: CdpClient,
    target_id: String,
    session_id: String,
    settle_delay: Duration,
}

impl PageControl {
    /// Creates a blank page, attaches to it and applies emulation settings.
    pub async fn open(client: CdpClient, opts: &PageOptions) -> Result<Self> {
        let created = client
            .send_command("Target.createTarget", json!({ "url": "about:blank" }), None)
            .await?;
        let target_id = string_field(&created, "targetId")?;

        let attached = client
            .send_command(
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
                None,
            )
            .await?;
        let session_id = string_field(&attached, "sessionId")?;
        debug!(%target_id, %session_id, "Attached to page target");

        let page = Self {
            client,
            target_id,
            session_id,
            settle_delay: opts.settle_delay,
        };
        page.configure(opts).await?;
        Ok(page)
    }

    async fn configure(&self, opts: &PageOptions) -> Result<()> {
        self.call("Page.enable", json!({})).await?;
        self.call(
            "Emulation.setDeviceMetricsOverride",
            json!({
                "width": opts.viewport.width,
                "height": opts.viewport.height,
                "deviceScaleFactor": 1,
                "mobile": false,
            }),
        )
        .await?;
        self.call(
            "Page.addScriptToEvaluateOnNewDocument",
            json!({ "source": FREEZE_ANIMATIONS_SCRIPT }),
        )
        .await?;
        self.call(
            "Network.setUserAgentOverride",
            json!({ "userAgent": opts.user_agent }),
        )
        .await?;

        if !opts.blocked_urls.is_empty() {
            self.call("Network.enable", json!({})).await?;
            self.call("Network.setBlockedURLs", json!({ "urls": opts.blocked_urls }))
                .await?;
            debug!(patterns = opts.blocked_urls.len(), "Resource blocking enabled");
        }
        Ok(())
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn client(&self) -> &CdpClient {
        &self.client
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.client
            .send_command(method, params, Some(&self.session_id))
            .await
    }

    /// Navigates and waits for DOMContentLoaded within `timeout`.
    pub async fn navigate(&self, url: &str, timeout: Duration) -> Result<()> {
        info!("Navigating page to {}", url);
        // Subscribe before issuing the command so the event cannot be missed.
        let events = self.client.subscribe();
        let result = self.call("Page.navigate", json!({ "url": url })).await?;
        if let Some(error) = result.get("errorText").and_then(Value::as_str) {
            bail!("navigation to {url} failed: {error}");
        }
        self.await_dom_content(events, timeout).await
    }

    pub async fn reload(&self, timeout: Duration) -> Result<()> {
        let events = self.client.subscribe();
        self.call("Page.reload", json!({ "ignoreCache": true })).await?;
        self.await_dom_content(events, timeout).await
    }

    async fn await_dom_content(
        &self,
        mut events: broadcast::Receiver<CdpEvent>,
        timeout: Duration,
    ) -> Result<()> {
        let session = self.session_id.as_str();
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(event)
                        if event.method == DOM_CONTENT_EVENT
                            && event.session_id.as_deref() == Some(session) =>
                    {
                        return Ok(());
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Page event receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        bail!("DevTools connection closed during page load")
                    }
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .with_context(|| format!("page load timed out after {timeout:?}"))??;

        tokio::time::sleep(self.settle_delay).await;
        Ok(())
    }

    pub async fn close_target(&self) -> Result<()> {
        self.client
            .send_command(
                "Target.closeTarget",
                json!({ "targetId": self.target_id }),
                None,
            )
            .await?;
        Ok(())
    }
}

fn string_field(value: &Value, field: &str) -> Result<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .with_context(|| format!("response is missing {field}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_string_fields() {
        let v = json!({ "targetId": "T1", "n": 3 });
        assert_eq!(string_field(&v, "targetId").unwrap(), "T1");
        assert!(string_field(&v, "n").is_err());
        assert!(string_field(&v, "sessionId").is_err());
    }

    #[test]
    fn freeze_script_covers_pseudo_elements() {
        assert!(FREEZE_ANIMATIONS_SCRIPT.contains("*::before"));
        assert!(FREEZE_ANIMATIONS_SCRIPT.contains("transition-duration: 0s"));
        assert!(FREEZE_ANIMATIONS_SCRIPT.contains("DOMContentLoaded"));
    }
}
