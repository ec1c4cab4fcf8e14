use std::{path::PathBuf, time::Duration};

use basenji_components::{
    concentrator::ConcentratorConfiguration, normalizer::NormalizerConfiguration, presampler::PreSamplerConfiguration,
    sampler::SamplerConfiguration, watchdog::WatchdogConfiguration, writer::WriterConfiguration,
};
use basenji_config::{ConfigurationLoader, GenericConfiguration};
use basenji_error::{ErrorContext as _, GenericError};
use clap::Parser;
use serde::Deserialize;

/// Prefix of environment variables overriding the configuration file.
const ENV_PREFIX: &str = "BASENJI";

/// Receives traces from tracers, computes statistics, samples and forwards them.
#[derive(Debug, Parser)]
#[command(name = "trace-agent", version)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Path of a file to write the process ID to.
    #[arg(short, long = "pidfile")]
    pub pid_file: Option<PathBuf>,
}

/// Loads the configuration file, if any, with environment variables layered on top.
pub fn load_configuration(path: Option<&std::path::Path>) -> Result<GenericConfiguration, GenericError> {
    let mut loader = ConfigurationLoader::default();
    if let Some(path) = path {
        loader = loader
            .from_yaml(path)
            .with_error_context(|| format!("Failed to load configuration file '{}'.", path.display()))?;
    }
    let loader = loader
        .from_environment(ENV_PREFIX)
        .error_context("Failed to load configuration from environment.")?;
    Ok(loader.into_generic())
}

const fn default_receiver_port() -> u16 {
    8126
}

fn default_receiver_host() -> String {
    "localhost".to_string()
}

const fn default_queue_size() -> usize {
    5000
}

const fn default_backpressure_timeout_secs() -> f64 {
    1.0
}

/// HTTP receiver configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct ReceiverConfiguration {
    #[serde(rename = "receiver_host", default = "default_receiver_host")]
    host: String,

    #[serde(rename = "receiver_port", default = "default_receiver_port")]
    port: u16,

    /// Capacity of every queue between pipeline stages.
    #[serde(rename = "receiver_queue_size", default = "default_queue_size")]
    queue_size: usize,

    /// How long a request may wait for room in the intake queue before it is refused.
    #[serde(
        rename = "receiver_backpressure_timeout",
        default = "default_backpressure_timeout_secs"
    )]
    backpressure_timeout_secs: f64,
}

impl Default for ReceiverConfiguration {
    fn default() -> Self {
        Self {
            host: default_receiver_host(),
            port: default_receiver_port(),
            queue_size: default_queue_size(),
            backpressure_timeout_secs: default_backpressure_timeout_secs(),
        }
    }
}

impl ReceiverConfiguration {
    /// Returns the `host:port` address to listen on.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size.max(1)
    }

    pub fn backpressure_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.backpressure_timeout_secs).unwrap_or(Duration::ZERO)
    }
}

/// Configuration of the whole agent.
#[derive(Clone, Debug, Default)]
pub struct AgentConfiguration {
    receiver: ReceiverConfiguration,
    normalizer: NormalizerConfiguration,
    concentrator: ConcentratorConfiguration,
    sampler: SamplerConfiguration,
    presampler: PreSamplerConfiguration,
    watchdog: WatchdogConfiguration,
    writer: WriterConfiguration,
}

impl AgentConfiguration {
    /// Creates a new `AgentConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If any section cannot be deserialized, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(Self {
            receiver: config
                .as_typed::<ReceiverConfiguration>()
                .error_context("Failed to load receiver configuration.")?,
            normalizer: NormalizerConfiguration::from_configuration(config)
                .error_context("Failed to load normalizer configuration.")?,
            concentrator: ConcentratorConfiguration::from_configuration(config)
                .error_context("Failed to load concentrator configuration.")?,
            sampler: SamplerConfiguration::from_configuration(config)
                .error_context("Failed to load sampler configuration.")?,
            presampler: PreSamplerConfiguration::from_configuration(config)
                .error_context("Failed to load pre-sampler configuration.")?,
            watchdog: WatchdogConfiguration::from_configuration(config)
                .error_context("Failed to load watchdog configuration.")?,
            writer: WriterConfiguration::from_configuration(config)
                .error_context("Failed to load writer configuration.")?,
        })
    }

    pub fn receiver(&self) -> &ReceiverConfiguration {
        &self.receiver
    }

    pub fn normalizer(&self) -> &NormalizerConfiguration {
        &self.normalizer
    }

    pub fn concentrator(&self) -> &ConcentratorConfiguration {
        &self.concentrator
    }

    pub fn sampler(&self) -> &SamplerConfiguration {
        &self.sampler
    }

    pub fn presampler(&self) -> &PreSamplerConfiguration {
        &self.presampler
    }

    pub fn watchdog(&self) -> &WatchdogConfiguration {
        &self.watchdog
    }

    pub fn writer(&self) -> &WriterConfiguration {
        &self.writer
    }
}
