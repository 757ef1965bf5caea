//! Config redaction: a safe-to-log summary of the loaded configuration.
//!
//! Secrets are never printed; only their presence is.

use serde_json::{json, Value};

use crate::env::StreamerConfig;

pub const HIDDEN: &str = "[HIDDEN]";
pub const NOT_SET: &str = "NOT_SET";

fn presence(secret: Option<&str>) -> &'static str {
    match secret {
        Some(s) if !s.is_empty() => HIDDEN,
        _ => NOT_SET,
    }
}

/// Summary suitable for the startup log and `check-config`.
pub fn redacted_summary(config: &StreamerConfig) -> Value {
    let mut summary = serde_json::to_value(config).unwrap_or_else(|_| json!({}));
    if let Value::Object(map) = &mut summary {
        map.insert(
            "stream_key".into(),
            Value::from(presence(config.stream_key.as_deref())),
        );
        map.insert(
            "access_keyword".into(),
            Value::from(presence(Some(config.access_keyword.as_str()))),
        );
        // A key pasted into the base URL would otherwise leak here.
        if let Some(rtmp) = &config.rtmp_url {
            let mut shown = rtmp.clone();
            if let Some(key) = config.stream_key.as_deref().filter(|k| !k.is_empty()) {
                shown = shown.replace(key, HIDDEN);
            }
            map.insert("rtmp_url".into(), Value::from(shown));
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_masked() {
        let config = StreamerConfig {
            rtmp_url: Some("rtmp://ingest/live2".into()),
            stream_key: Some("super-secret".into()),
            access_keyword: "hunter2".into(),
            ..Default::default()
        };
        let summary = redacted_summary(&config);
        assert_eq!(summary["stream_key"], HIDDEN);
        assert_eq!(summary["access_keyword"], HIDDEN);
        let text = summary.to_string();
        assert!(!text.contains("super-secret"));
        assert!(!text.contains("hunter2"));
        assert_eq!(summary["width"], 1920);
    }

    #[test]
    fn missing_secrets_show_not_set() {
        let summary = redacted_summary(&StreamerConfig::default());
        assert_eq!(summary["stream_key"], NOT_SET);
        assert_eq!(summary["access_keyword"], NOT_SET);
    }

    #[test]
    fn key_embedded_in_base_url_is_hidden() {
        let config = StreamerConfig {
            rtmp_url: Some("rtmp://ingest/live2/super-secret".into()),
            stream_key: Some("super-secret".into()),
            ..Default::default()
        };
        let summary = redacted_summary(&config);
        assert_eq!(summary["rtmp_url"], "rtmp://ingest/live2/[HIDDEN]");
    }
}
