mod check_cmd;
mod serve;
mod status_cmd;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use pagecast_config::StreamerConfig;

#[derive(Parser)]
#[command(name = "pagecast")]
#[command(about = "pagecast: stream a live web page to an RTMP ingest")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the control server (and the stream, when AUTO_START=true)
    Serve {
        /// Port to bind the HTTP server to
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Print the redacted configuration and its validation report
    CheckConfig,
    /// Query a running instance for its stream status
    Status {
        /// Access keyword; defaults to ACCESS_KEYWORD
        #[arg(short, long)]
        keyword: Option<String>,
        /// Base URL of the running instance
        #[arg(long)]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = StreamerConfig::from_env().context("Failed to load configuration")?;

    pagecast_logging::init_logger(config.log_dir.as_deref(), &config.log_level);

    match cli.command {
        Commands::Serve { port } => {
            let config = StreamerConfig {
                port: port.unwrap_or(config.port),
                ..config
            };
            serve::run_server(config).await?;
        }
        Commands::CheckConfig => {
            let valid = check_cmd::run(&config);
            if !valid {
                std::process::exit(1);
            }
        }
        Commands::Status { keyword, url } => {
            let keyword = keyword.unwrap_or_else(|| config.access_keyword.clone());
            let url = url.unwrap_or_else(|| format!("http://localhost:{}", config.port));
            status_cmd::run(&url, &keyword).await?;
        }
    }

    Ok(())
}
