mod cli;
mod config;
mod error;
mod repl;

use std::fs;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wasmrepl_runtime::Replicator;

use crate::cli::Cli;
use crate::error::ReplError;

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wasmrepl=info,wasmrepl_runtime=warn,console=off".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            e.exit_code()
        }
    }
}

fn run(cli: Cli) -> Result<(), ReplError> {
    let mut config = config::load(cli.config.as_deref())?;
    config::apply_overrides(&mut config, &cli);

    let bytes = fs::read(&cli.base).map_err(|source| ReplError::BaseNotReadable {
        path: cli.base.clone(),
        source,
    })?;
    let mut replicator = Replicator::new(config, &bytes)?;
    let session = replicator.spawn()?;
    if let Some(e) = session.load_error() {
        return Err(e.clone().into());
    }
    log::info!("loaded {} into session {}", cli.base.display(), session.id());

    repl::run(session, cli.quiet)
}
