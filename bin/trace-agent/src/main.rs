//! Trace agent.
//!
//! Receives traces from tracers over HTTP, normalizes them, computes statistics, samples them and forwards everything
//! to the intake. A watchdog keeps the agent within its resource budget by pre-sampling payloads, and terminates it on
//! hard limits.

#![deny(warnings)]
#![deny(missing_docs)]

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use basenji_app::prelude::*;
use basenji_common::task::spawn_fatal;
use basenji_error::{ErrorContext as _, GenericError};
use clap::Parser as _;
use tokio::{
    net::TcpListener,
    select,
    signal::unix::{signal, SignalKind},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;
use self::config::{load_configuration, AgentConfiguration, Cli};

mod pipeline;
use self::pipeline::Pipeline;

mod receiver;
use self::receiver::{build_router, serve, ReceiverState};

/// How long stages get to drain their queues on shutdown.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    let started = Instant::now();
    let cli = Cli::parse();

    let configuration = load_configuration(cli.config.as_deref())
        .unwrap_or_else(|e| fatal_and_exit(format!("failed to load configuration: {:?}", e)));
    let logging_config = LoggingConfiguration::from_configuration(&configuration)
        .unwrap_or_else(|e| fatal_and_exit(format!("failed to load logging configuration: {:?}", e)));
    let guard = initialize_logging(&logging_config)
        .unwrap_or_else(|e| fatal_and_exit(format!("failed to initialize logging: {:?}", e)));

    let result = match AgentConfiguration::from_configuration(&configuration) {
        Ok(config) => run(started, config, cli.pid_file).await,
        Err(e) => Err(e),
    };

    let failed = match result {
        Ok(()) => {
            info!("Trace agent stopped.");
            false
        }
        Err(e) => {
            error!("{:?}", e);
            true
        }
    };

    // Flush buffered log lines before exiting.
    drop(guard);
    if failed {
        std::process::exit(1);
    }
}

async fn run(started: Instant, config: AgentConfiguration, pid_file: Option<PathBuf>) -> Result<(), GenericError> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        process_id = std::process::id(),
        "Trace agent starting..."
    );

    if let Some(path) = &pid_file {
        write_pid_file(path)?;
    }

    let writer = Arc::new(
        config
            .writer()
            .build_http()
            .error_context("Failed to build intake client.")?,
    );
    let (pipeline, inputs) = Pipeline::spawn(&config, writer)?;

    let shutdown = CancellationToken::new();
    let watchdog = config
        .watchdog()
        .build(Arc::clone(&inputs.presampler), |reason: String| {
            error!(%reason, "Resource limit exceeded.");
            fatal_and_exit(reason);
        })
        .error_context("Failed to build watchdog.")?;
    spawn_fatal("watchdog", watchdog.run(shutdown.clone()), |reason: String| {
        fatal_and_exit(reason);
    });

    let listen_address = config.receiver().listen_address();
    let listener = TcpListener::bind(&listen_address)
        .await
        .with_error_context(|| format!("Failed to listen on {}.", listen_address))?;
    let router = build_router(ReceiverState::new(inputs, config.receiver().backpressure_timeout()));
    let mut server = tokio::spawn(serve(listener, router, shutdown.clone()));

    info!(init_time_ms = started.elapsed().as_millis(), "Trace agent started.");

    let mut sigterm = signal(SignalKind::terminate()).error_context("Failed to set up SIGTERM handler.")?;
    let server_result = select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down...");
            None
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
            None
        }
        result = &mut server => Some(result),
    };

    shutdown.cancel();
    let server_result = match server_result {
        Some(result) => result,
        None => server.await,
    };
    pipeline.stop(SHUTDOWN_GRACE_PERIOD).await;

    if let Some(path) = &pid_file {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(error = %e, path = %path.display(), "Failed to remove PID file.");
        }
    }

    server_result.error_context("Receiver task failed.")?
}

fn write_pid_file(path: &Path) -> Result<(), GenericError> {
    std::fs::write(path, format!("{}\n", std::process::id()))
        .with_error_context(|| format!("Failed to write PID file '{}'.", path.display()))?;
    info!(path = %path.display(), "Wrote PID file.");
    Ok(())
}
