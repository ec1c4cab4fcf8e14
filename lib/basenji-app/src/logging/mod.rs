//! Logging.

use std::path::Path;

use basenji_error::{generic_error, GenericError};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, MakeWriter},
    layer::SubscriberExt as _,
    registry::LookupSpan,
    util::SubscriberInitExt as _,
    Layer,
};

mod config;
pub use self::config::{LogLevel, LoggingConfiguration};

/// Keeps the background log writers alive.
///
/// Dropping the guard flushes any buffered log lines, so it must be held until the process is about to exit.
#[derive(Default)]
pub struct LoggingGuard {
    worker_guards: Vec<WorkerGuard>,
}

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) -> ! {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Initializes the global `tracing` subscriber.
///
/// Every configured output (console, file) receives the same events, filtered once by `log_level`.
///
/// # Errors
///
/// If the log file cannot be opened, or a global subscriber was already installed, an error is returned.
pub fn initialize_logging(config: &LoggingConfiguration) -> Result<LoggingGuard, GenericError> {
    let mut guard = LoggingGuard::default();
    let mut layers = Vec::new();

    if config.log_to_console {
        let (writer, worker_guard) = tracing_appender::non_blocking(std::io::stdout());
        guard.worker_guards.push(worker_guard);
        layers.push(build_formatting_layer(config, writer));
    }

    if !config.log_file.is_empty() {
        let path = Path::new(&config.log_file);
        let (directory, file_name) = match (path.parent(), path.file_name()) {
            (Some(directory), Some(file_name)) => (directory, file_name),
            _ => return Err(generic_error!("Invalid log file path '{}'.", config.log_file)),
        };

        let appender = tracing_appender::rolling::never(directory, file_name);
        let (writer, worker_guard) = tracing_appender::non_blocking(appender);
        guard.worker_guards.push(worker_guard);
        layers.push(build_formatting_layer(config, writer));
    }

    tracing_subscriber::registry()
        .with(layers.with_filter(config.log_level.as_env_filter()))
        .try_init()?;

    Ok(guard)
}

fn build_formatting_layer<S, W>(config: &LoggingConfiguration, writer: W) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    if config.log_format_json {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(writer)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(writer)
            .boxed()
    }
}
