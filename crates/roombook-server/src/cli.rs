//! Command-line interface of `roombookd`.

use std::path::PathBuf;

use clap::Parser;
use roombook_core::TracingOutputFormat;
use tracing::Level;

/// roombookd - room availability service
#[derive(Debug, Parser)]
#[command(name = "roombookd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "ROOMBOOK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on, overrides `listen_addr`
    #[arg(long, env = "ROOMBOOK_LISTEN")]
    pub listen: Option<String>,

    /// Log level for roombook targets when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: Level,

    /// Log format: pretty, compact or json
    #[arg(long, default_value = "json")]
    pub log_format: TracingOutputFormat,

    /// Validate the configuration and exit
    #[arg(long)]
    pub check_config: bool,
}
