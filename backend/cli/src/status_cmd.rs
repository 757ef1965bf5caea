//! CLI Status Command
//!
//! Asks a running instance for its `/status` snapshot.

use anyhow::Result;
use pagecast_gateway::auth::KEYWORD_HEADER;

pub async fn run(base_url: &str, keyword: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let url = format!("{}/status", base_url.trim_end_matches('/'));
    match client.get(&url).header(KEYWORD_HEADER, keyword).send().await {
        Ok(resp) => {
            let status = resp.status();
            let body: serde_json::Value = resp.json().await?;
            if !status.is_success() {
                println!("pagecast answered {status}");
            }
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Err(_) => {
            println!("pagecast is not running at {base_url}");
        }
    }
    Ok(())
}
