//! vPLC Orchestrator Agent
//!
//! Long-running edge daemon: maintains the authenticated control channel to
//! the cloud controller and manages vPLC runtime containers on this host.

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;

use vplc_agent::{config::Config, logging, supervisor};

#[derive(Debug, Parser)]
#[command(name = "vplc-agent", about = "Orchestrator agent for vPLC runtime containers")]
struct Cli {
    /// Set the logging level.
    #[arg(short = 'l', long = "log-level", value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    #[value(name = "DEBUG")]
    Debug,
    #[value(name = "INFO")]
    Info,
    #[value(name = "WARNING")]
    Warning,
    #[value(name = "ERROR")]
    Error,
    #[value(name = "CRITICAL")]
    Critical,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error | LogLevel::Critical => LevelFilter::ERROR,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    logging::init(&config, cli.log_level.into())?;

    info!(server = %config.server_url, "Starting orchestrator agent");

    supervisor::run(config).await
}
