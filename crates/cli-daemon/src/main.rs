//! CLI entry point for the lofi streamer
//!
//! Parses command line arguments, sets up logging and signal handling, and
//! runs the stream loop until its deadline or a stop signal.

use clap::Parser;
use lofi_streamer::{
    parse_bind_addr, run_startup_checks, run_status_server, LoopOutcome, StreamConfig, StreamLoop,
};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Lofi Streamer - shuffled audio playlist over a looping background, pushed to RTMP
#[derive(Parser, Debug)]
#[command(name = "lofi-streamer")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Optional TOML configuration file; environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Skip startup checks (ffmpeg/ffprobe availability). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Seconds between liveness checks of the encoder
    #[arg(long)]
    poll_interval: Option<u64>,
}

/// Console layer plus a plain-text file layer under the logs directory.
fn init_logging(config: &StreamConfig) -> std::io::Result<()> {
    let log_path = config.log_file_path();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .init();

    tracing::info!(log_file = %log_path.display(), "Logging initialized");
    Ok(())
}

async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT, stopping stream...");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            tracing::info!("Received SIGTERM, stopping stream...");
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match StreamConfig::load(args.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(secs) = args.poll_interval {
        config.timing.poll_interval_secs = secs;
    }
    if let Err(e) = config.validate().and_then(|_| config.validate_filesystem()) {
        eprintln!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    if let Err(e) = init_logging(&config) {
        eprintln!("Failed to open log file {}: {}", config.log_file_path().display(), e);
        return ExitCode::FAILURE;
    }

    if args.skip_checks {
        tracing::warn!("Skipping startup checks (--skip-checks enabled)");
    } else if let Err(e) = run_startup_checks(&config) {
        tracing::error!(error = %e, "Startup check failed");
        return ExitCode::FAILURE;
    }

    let config = Arc::new(config);
    let cancel = CancellationToken::new();
    let mut stream = StreamLoop::from_config(config.clone(), cancel.clone());

    if let Some(bind) = config.status.bind.as_deref() {
        match parse_bind_addr(bind) {
            Ok(addr) => {
                let status = stream.status();
                let shutdown = cancel.clone();
                tokio::spawn(async move {
                    if let Err(e) = run_status_server(status, addr, shutdown).await {
                        tracing::error!(error = %e, "Status server error");
                    }
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "Invalid status bind address");
                return ExitCode::FAILURE;
            }
        }
    }

    let signal_token = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let result = stream.run().await;
    cancel.cancel();

    match result {
        Ok(LoopOutcome::DeadlineReached) => {
            tracing::info!("Maximum duration reached, exiting");
            ExitCode::SUCCESS
        }
        Ok(LoopOutcome::Cancelled) => {
            tracing::info!("Stream stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Fatal stream error");
            ExitCode::FAILURE
        }
    }
}
