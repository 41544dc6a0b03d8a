//! roombookd entry point.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use roombook_core::{TracingConfig, init_tracing};
use roombook_server::cli::Cli;
use roombook_server::{Server, ServerConfig, ServerResult, SignalHandler};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let tracing = TracingConfig::server()
        .with_level(cli.log_level)
        .with_format(cli.log_format);
    if let Err(e) = init_tracing(tracing) {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "roombookd failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> ServerResult<()> {
    let path = cli.config.unwrap_or_else(ServerConfig::default_path);
    let mut config = ServerConfig::load_from(&path)?;
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
        config.validate()?;
    }
    info!(path = %path.display(), rooms = config.rooms.len(), "configuration loaded");

    let server = Server::from_config(config)?;
    if cli.check_config {
        println!("{}: ok", path.display());
        return Ok(());
    }

    let signals = SignalHandler::new();
    signals.spawn_listener();
    server.run(signals.shutdown_handle()).await
}
