//! Viewport Screenshot
//!
//! Builds `Page.captureScreenshot` parameters and decodes the base64 PNG the
//! compositor returns.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use pagecast_core::ScreenshotOptions;
use serde_json::{json, Value};

use crate::cdp_client::CdpClient;

pub fn screenshot_params(opts: &ScreenshotOptions) -> Value {
    let mut params = json!({
        "format": "png",
        "optimizeForSpeed": opts.optimize_for_speed,
        "captureBeyondViewport": false,
    });
    if let Some(clip) = opts.clip {
        params["clip"] = json!({
            "x": clip.x,
            "y": clip.y,
            "width": clip.width,
            "height": clip.height,
            "scale": 1,
        });
    }
    params
}

/// Extracts the image bytes from a captureScreenshot result.
pub fn decode_screenshot(result: &Value) -> Result<Vec<u8>> {
    let data = result
        .get("data")
        .and_then(Value::as_str)
        .context("screenshot response has no data")?;
    let bytes = STANDARD.decode(data).context("screenshot data is not base64")?;
    if bytes.is_empty() {
        bail!("screenshot is empty");
    }
    Ok(bytes)
}

/// Captures from one attached page session.
pub struct ScreenshotCapturer {
    client: CdpClient,
    session_id: String,
}

impl ScreenshotCapturer {
    pub fn new(client: CdpClient, session_id: impl Into<String>) -> Self {
        Self {
            client,
            session_id: session_id.into(),
        }
    }

    pub async fn capture(&self, opts: &ScreenshotOptions) -> Result<Vec<u8>> {
        let result = self
            .client
            .send_command(
                "Page.captureScreenshot",
                screenshot_params(opts),
                Some(&self.session_id),
            )
            .await?;
        decode_screenshot(&result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagecast_core::Clip;

    #[test]
    fn full_viewport_has_no_clip() {
        let params = screenshot_params(&ScreenshotOptions::full_viewport());
        assert_eq!(params["format"], "png");
        assert_eq!(params["optimizeForSpeed"], true);
        assert!(params.get("clip").is_none());
    }

    #[test]
    fn clip_is_unscaled() {
        let opts = ScreenshotOptions {
            clip: Some(Clip {
                x: 10,
                y: 20,
                width: 100,
                height: 50,
            }),
            optimize_for_speed: false,
        };
        let params = screenshot_params(&opts);
        assert_eq!(params["clip"]["width"], 100);
        assert_eq!(params["clip"]["y"], 20);
        assert_eq!(params["clip"]["scale"], 1);
        assert_eq!(params["optimizeForSpeed"], false);
    }

    #[test]
    fn decodes_base64_payload() {
        let png = [0x89u8, b'P', b'N', b'G'];
        let result = json!({ "data": STANDARD.encode(png) });
        assert_eq!(decode_screenshot(&result).unwrap(), png);
    }

    #[test]
    fn rejects_missing_or_empty_data() {
        assert!(decode_screenshot(&json!({})).is_err());
        assert!(decode_screenshot(&json!({ "data": "" })).is_err());
        assert!(decode_screenshot(&json!({ "data": "***" })).is_err());
    }
}
