//! Log Redaction Layer
//!
//! Scrubs stream keys from encoder output and URLs before they reach a log line.

use regex::Regex;
use std::sync::LazyLock;

/// `rtmp://host/app/<key>`: everything after the last slash is the key.
static STREAM_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(rtmps?://\S*/)([^\s/]+)").unwrap());

pub const STREAM_KEY_PLACEHOLDER: &str = "[STREAM_KEY_HIDDEN]";

/// Replaces the last path segment of every RTMP(S) URL in `input`.
pub fn redact_stream_urls(input: &str) -> String {
    STREAM_URL_RE
        .replace_all(input, format!("${{1}}{STREAM_KEY_PLACEHOLDER}"))
        .to_string()
}

/// Replaces every literal occurrence of `secret`, then any RTMP URL tail.
pub fn redact_secret(input: &str, secret: Option<&str>) -> String {
    let scrubbed = match secret {
        Some(secret) if !secret.is_empty() => input.replace(secret, STREAM_KEY_PLACEHOLDER),
        _ => input.to_string(),
    };
    redact_stream_urls(&scrubbed)
}
