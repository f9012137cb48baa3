use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

mod cli;

use cli::args::Cli;
use cli::exit_codes;
use stomp_relay::{InMemoryBroker, Server, ServerError};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(&cli).await {
        Ok(()) => ExitCode::from(exit_codes::SUCCESS),
        Err(e) => {
            eprintln!("{}", e);
            let code = match e {
                ServerError::Io(_) => exit_codes::NETWORK_ERROR,
                ServerError::Relay(_) => exit_codes::RELAY_ERROR,
            };
            ExitCode::from(code)
        }
    }
}

async fn run(cli: &Cli) -> Result<(), ServerError> {
    let server = Server::bind(cli.config(), Arc::new(InMemoryBroker::new())).await?;
    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("interrupt received, shutting down");
        })
        .await
}
