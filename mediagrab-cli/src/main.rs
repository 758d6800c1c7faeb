mod cli;
mod commands;
mod config;
mod error;
mod output;

use std::process;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::{
    cli::{Args, Commands},
    commands::CommandExecutor,
    config::AppConfig,
    error::{AppError, Result},
};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("Application error: {}", e);
        if e.is_timeout() {
            eprintln!("Error: timed out: {e}");
        } else {
            eprintln!("Error: {e}");
        }
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    init_logging(args.verbose, args.quiet)?;

    let mut config = AppConfig::load(args.config.as_deref())?;
    config.apply_args(&args.download)?;
    debug!(output_dir = %config.output_dir().display(), "Configuration loaded");

    let executor = CommandExecutor::new(config, args.quiet)?;

    let token = CancellationToken::new();
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling");
            ctrl_c_token.cancel();
        }
    });

    match args.command {
        Commands::Probe { url, json } => {
            executor.probe(&url, json, &token).await?;
        }
        Commands::Fetch {
            url,
            format,
            deadline,
        } => {
            let media = executor
                .fetch(
                    &url,
                    format.as_deref(),
                    deadline.map(Duration::from_secs),
                    &token,
                )
                .await?;
            println!("{}", media.path.display());
            if let Some(thumbnail) = &media.thumbnail_path {
                debug!(thumbnail = %thumbnail.display(), "Thumbnail saved");
            }
        }
    }

    Ok(())
}

fn init_logging(verbose: bool, quiet: bool) -> Result<()> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_level(verbose)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|e| AppError::Config(format!("failed to initialise logging: {e}")))
}
