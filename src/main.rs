//! segment-server: answers text requests with segment lengths
//!
//! Each client sends text; every read is one request, answered with
//! `<request>: <length of each segment>\n`.
//!
//! Features:
//! - Single-threaded mio reactor serving many connections
//! - Pluggable analyzers (whitespace, dictionary maximum matching)
//! - Per-connection failure isolation
//! - Configuration via CLI arguments or TOML file

mod analysis;
mod config;
mod runtime;

use analysis::Analyzer;
use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        analyzer = ?config.analyzer,
        buffer_size = config.buffer_size,
        max_connections = config.max_connections,
        "Starting segment-server"
    );

    let analyzer = Analyzer::from_config(&config)?;
    info!(analyzer = analyzer.name(), "Analyzer ready");

    runtime::run(&config, analyzer)?;
    Ok(())
}
