mod cli;
mod error;

use std::process;
use std::time::Duration;

use clap::Parser;
use hlsdl_engine::{DownloadSession, SessionStatus};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{Level, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::{
    cli::Args,
    error::{AppError, Result},
};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("Application error: {}", e);
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    init_logging(args.verbose, args.quiet)?;

    let config = args.session_config()?;
    let session = DownloadSession::new();
    session.start(config)?;

    let progress = (!args.quiet).then(new_progress_bar);
    let status = watch(&session, progress.as_ref()).await;

    if let Some(err) = status.error {
        return Err(if status.cancelled {
            AppError::Cancelled
        } else {
            AppError::Failed(err)
        });
    }

    if let Some(output) = status.output {
        if status.already_satisfied {
            info!("Output already downloaded");
        }
        println!("{}", output.display());
    }
    Ok(())
}

/// Poll the session until it stops, forwarding Ctrl-C as a stop request.
async fn watch(session: &DownloadSession, progress: Option<&ProgressBar>) -> SessionStatus {
    let mut interrupted = false;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                if let Err(e) = signal {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                } else {
                    info!("Interrupt received, stopping download");
                    session.stop();
                }
                interrupted = true;
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        let status = session.status();
        if let Some(pb) = progress {
            pb.set_position(status.percent.into());
            pb.set_prefix(status.title.clone());
            pb.set_message(status.speed_text.clone());
        }
        if !status.running {
            if let Some(pb) = progress {
                if status.error.is_none() {
                    pb.finish_with_message("done");
                } else {
                    pb.abandon();
                }
            }
            return status;
        }
    }
}

fn new_progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(100);
    let style = ProgressStyle::with_template(
        "{prefix:.bold} [{bar:30.cyan/white}] {pos:>3}% {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=> ");
    pb.set_style(style);
    pb
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
        .map_err(|e| AppError::Logging(e.to_string()))
}
