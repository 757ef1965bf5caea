//! CLI Check-Config Command
//!
//! Prints the redacted configuration followed by every validation finding.

use pagecast_config::{redacted_summary, validate, StreamerConfig};

/// Returns whether the configuration is usable for `serve`.
pub fn run(config: &StreamerConfig) -> bool {
    println!("\n🔍 pagecast configuration\n");
    match serde_json::to_string_pretty(&redacted_summary(config)) {
        Ok(text) => println!("{text}\n"),
        Err(e) => println!("(could not render summary: {e})\n"),
    }

    let report = validate(config);
    for warning in &report.warnings {
        println!("  ⚠️  {}: {}", warning.path, warning.message);
    }
    for error in &report.errors {
        println!("  ❌ {}: {}", error.path, error.message);
    }

    println!();
    if report.is_valid() {
        println!("✅ Configuration is valid.");
    } else {
        println!("❌ Configuration has errors. Please fix the entries above.");
    }
    report.is_valid()
}
