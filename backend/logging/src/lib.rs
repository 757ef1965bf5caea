//! Structured logging setup and secret scrubbing for pagecast.
//!
//! Handles console and rotating JSON file output, plus redaction of stream
//! keys embedded in ingest URLs.

pub mod logger;
pub mod redact;

pub use logger::init_logger;
pub use redact::{redact_secret, redact_stream_urls};
