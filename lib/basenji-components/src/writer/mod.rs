//! Submission of traces, stats and service metadata to the intake.
//!
//! Each payload kind has its own writer task: traces are buffered and flushed periodically, stats are sent as soon as
//! the concentrator flushes them, and service metadata is merged and flushed periodically. All of them go through a
//! shared [`PayloadWriter`].

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use basenji_config::GenericConfiguration;
use basenji_core::{ServicesMetadata, StatsBucket, StatsPayload, Trace};
use basenji_error::GenericError;
use metrics::counter;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt as _, Snafu};
use tokio::{
    select,
    sync::mpsc,
    time::{interval_at, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

mod http;
pub use self::http::HttpPayloadWriter;

/// Number of buffered traces that triggers a flush ahead of the flush period.
const MAX_BUFFERED_TRACES: usize = 1000;

/// Shortest accepted flush period.
const MIN_FLUSH_PERIOD: Duration = Duration::from_millis(100);

fn default_api_endpoint() -> String {
    "https://trace.agent.datadoghq.com".to_string()
}

fn default_env() -> String {
    "none".to_string()
}

const fn default_timeout_secs() -> f64 {
    5.0
}

const fn default_max_retries() -> usize {
    5
}

const fn default_flush_period_secs() -> f64 {
    5.0
}

/// A payload submission error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum WriteError {
    /// The intake could not be reached, timed out, or failed with a server error. Worth retrying.
    #[snafu(display("Transient failure while submitting payload: {}", reason))]
    Transient {
        /// What went wrong.
        reason: String,
    },

    /// The intake rejected the payload. Retrying would not help.
    #[snafu(display("Intake rejected payload with status {}.", status))]
    Permanent {
        /// HTTP status returned by the intake.
        status: u16,
    },

    /// The payload could not be serialized.
    #[snafu(display("Failed to serialize payload: {}", source))]
    Encode {
        /// Underlying error.
        source: serde_json::Error,
    },
}

impl WriteError {
    /// Returns `true` if the submission may succeed when retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Kind of payload, which decides the intake endpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PayloadKind {
    /// Sampled traces.
    Traces,

    /// Flushed statistics buckets.
    Stats,

    /// Service metadata.
    Services,
}

impl PayloadKind {
    /// Returns the intake path for this kind of payload.
    pub const fn path(&self) -> &'static str {
        match self {
            Self::Traces => "/api/v0.2/traces",
            Self::Stats => "/api/v0.2/stats",
            Self::Services => "/api/v0.2/services",
        }
    }

    /// Returns a short name, used as a metric label.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Traces => "traces",
            Self::Stats => "stats",
            Self::Services => "services",
        }
    }
}

/// Sends serialized payloads to the intake.
#[async_trait]
pub trait PayloadWriter: Send + Sync {
    /// Writes a JSON `body` of the given kind.
    ///
    /// # Errors
    ///
    /// If the payload could not be delivered, an error is returned. Implementations retry transient failures
    /// themselves, so a transient error means the retry budget is exhausted.
    async fn write(&self, kind: PayloadKind, body: Vec<u8>) -> Result<(), WriteError>;
}

/// Traces payload sent to the intake.
#[derive(Debug, Serialize)]
pub struct TracePayload<'a> {
    /// Hostname of the agent.
    #[serde(rename = "hostname")]
    pub host_name: &'a str,

    /// Default environment of the agent.
    pub env: &'a str,

    /// Sampled traces.
    pub traces: &'a [Trace],
}

/// Writer configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct WriterConfiguration {
    /// Base URL of the intake.
    ///
    /// Defaults to `https://trace.agent.datadoghq.com`.
    #[serde(default = "default_api_endpoint")]
    api_endpoint: String,

    /// API key sent with every payload.
    #[serde(default)]
    api_key: String,

    /// Hostname reported in payloads.
    #[serde(default)]
    hostname: String,

    /// Environment reported in payloads.
    ///
    /// Defaults to `none`.
    #[serde(default = "default_env")]
    default_env: String,

    /// Timeout of a single submission attempt, in seconds.
    ///
    /// Defaults to 5 seconds.
    #[serde(rename = "writer_timeout", default = "default_timeout_secs")]
    timeout_secs: f64,

    /// Number of retries of a transient failure before a payload is dropped.
    ///
    /// Defaults to 5.
    #[serde(rename = "writer_max_retries", default = "default_max_retries")]
    max_retries: usize,

    /// How often buffered traces are flushed, in seconds.
    ///
    /// Defaults to 5 seconds.
    #[serde(rename = "trace_flush_period", default = "default_flush_period_secs")]
    trace_flush_period_secs: f64,

    /// How often service metadata is flushed, in seconds.
    ///
    /// Defaults to 5 seconds.
    #[serde(rename = "service_flush_period", default = "default_flush_period_secs")]
    service_flush_period_secs: f64,
}

impl Default for WriterConfiguration {
    fn default() -> Self {
        Self {
            api_endpoint: default_api_endpoint(),
            api_key: String::new(),
            hostname: String::new(),
            default_env: default_env(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            trace_flush_period_secs: default_flush_period_secs(),
            service_flush_period_secs: default_flush_period_secs(),
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl WriterConfiguration {
    /// Creates a new `WriterConfiguration` from the given configuration.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed()?)
    }

    /// Sets the intake base URL.
    pub fn with_api_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.api_endpoint = endpoint.into();
        self
    }

    /// Sets the API key.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    /// Sets the number of retries.
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Returns the hostname reported in payloads.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Returns the environment reported in payloads.
    pub fn default_env(&self) -> &str {
        &self.default_env
    }

    /// Returns the trace flush period.
    pub fn trace_flush_period(&self) -> Duration {
        secs(self.trace_flush_period_secs)
    }

    /// Returns the service metadata flush period.
    pub fn service_flush_period(&self) -> Duration {
        secs(self.service_flush_period_secs)
    }

    /// Builds an HTTP payload writer from this configuration.
    ///
    /// # Errors
    ///
    /// If the endpoint is not a valid URL, or the HTTP client cannot be built, an error is returned.
    pub fn build_http(&self) -> Result<HttpPayloadWriter, GenericError> {
        HttpPayloadWriter::new(
            &self.api_endpoint,
            &self.api_key,
            secs(self.timeout_secs),
            self.max_retries,
        )
    }
}

/// Serializes and submits a payload, accounting for the outcome.
async fn submit<T: Serialize>(writer: &dyn PayloadWriter, kind: PayloadKind, payload: &T) -> Result<(), WriteError> {
    let body = serde_json::to_vec(payload).context(Encode)?;
    let len = body.len() as u64;

    let result = writer.write(kind, body).await;
    let outcome = match &result {
        Ok(()) => {
            counter!("writer_bytes_total", "kind" => kind.as_str()).increment(len);
            "success"
        }
        Err(e) if e.is_transient() => "transient_error",
        Err(_) => "permanent_error",
    };
    counter!("writer_payloads_total", "kind" => kind.as_str(), "outcome" => outcome).increment(1);
    result
}

/// Buffers sampled traces and flushes them periodically.
pub struct TraceWriter {
    writer: Arc<dyn PayloadWriter>,
    host_name: String,
    env: String,
    flush_period: Duration,
    buffer: Vec<Trace>,
}

impl TraceWriter {
    /// Creates a new `TraceWriter`.
    pub fn new(writer: Arc<dyn PayloadWriter>, config: &WriterConfiguration) -> Self {
        Self {
            writer,
            host_name: config.hostname.clone(),
            env: config.default_env.clone(),
            flush_period: config.trace_flush_period().max(MIN_FLUSH_PERIOD),
            buffer: Vec::new(),
        }
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }

        let traces = std::mem::take(&mut self.buffer);
        let payload = TracePayload {
            host_name: &self.host_name,
            env: &self.env,
            traces: &traces,
        };
        if let Err(e) = submit(self.writer.as_ref(), PayloadKind::Traces, &payload).await {
            counter!("writer_traces_dropped_total").increment(traces.len() as u64);
            warn!(error = %e, traces = traces.len(), "Dropped traces payload.");
        } else {
            debug!(traces = traces.len(), "Flushed traces.");
        }
    }

    /// Runs the writer until `shutdown` is triggered or the input channel closes.
    ///
    /// Traces still buffered or queued on exit are flushed.
    pub async fn run(&mut self, input: &mut mpsc::Receiver<Trace>, shutdown: &CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.flush_period, self.flush_period);

        loop {
            select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.flush().await,
                maybe_trace = input.recv() => match maybe_trace {
                    Some(trace) => {
                        self.buffer.push(trace);
                        if self.buffer.len() >= MAX_BUFFERED_TRACES {
                            self.flush().await;
                        }
                    }
                    None => break,
                },
            }
        }

        while let Ok(trace) = input.try_recv() {
            self.buffer.push(trace);
        }
        self.flush().await;
        debug!("Trace writer stopped.");
    }
}

/// Sends flushed statistics buckets.
pub struct StatsWriter {
    writer: Arc<dyn PayloadWriter>,
    host_name: String,
    env: String,
}

impl StatsWriter {
    /// Creates a new `StatsWriter`.
    pub fn new(writer: Arc<dyn PayloadWriter>, config: &WriterConfiguration) -> Self {
        Self {
            writer,
            host_name: config.hostname.clone(),
            env: config.default_env.clone(),
        }
    }

    async fn write(&self, stats: Vec<StatsBucket>) {
        let buckets = stats.len();
        let payload = StatsPayload {
            host_name: self.host_name.clone(),
            env: self.env.clone(),
            stats,
        };
        if let Err(e) = submit(self.writer.as_ref(), PayloadKind::Stats, &payload).await {
            warn!(error = %e, buckets, "Dropped stats payload.");
        }
    }

    /// Runs the writer until `shutdown` is triggered or the input channel closes.
    ///
    /// Buckets already queued when shutdown is triggered are still sent.
    pub async fn run(&mut self, input: &mut mpsc::Receiver<Vec<StatsBucket>>, shutdown: &CancellationToken) {
        loop {
            select! {
                _ = shutdown.cancelled() => break,
                maybe_stats = input.recv() => match maybe_stats {
                    Some(stats) => self.write(stats).await,
                    None => break,
                },
            }
        }

        while let Ok(stats) = input.try_recv() {
            self.write(stats).await;
        }
        debug!("Stats writer stopped.");
    }
}

/// Merges service metadata and flushes it periodically.
pub struct ServiceWriter {
    writer: Arc<dyn PayloadWriter>,
    flush_period: Duration,
    pending: ServicesMetadata,
}

impl ServiceWriter {
    /// Creates a new `ServiceWriter`.
    pub fn new(writer: Arc<dyn PayloadWriter>, config: &WriterConfiguration) -> Self {
        Self {
            writer,
            flush_period: config.service_flush_period().max(MIN_FLUSH_PERIOD),
            pending: ServicesMetadata::new(),
        }
    }

    async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        let metadata = std::mem::take(&mut self.pending);
        if let Err(e) = submit(self.writer.as_ref(), PayloadKind::Services, &metadata).await {
            warn!(error = %e, services = metadata.len(), "Dropped service metadata payload.");
        }
    }

    /// Runs the writer until `shutdown` is triggered or the input channel closes, flushing what is left on exit.
    pub async fn run(&mut self, input: &mut mpsc::Receiver<ServicesMetadata>, shutdown: &CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.flush_period, self.flush_period);

        loop {
            select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.flush().await,
                maybe_metadata = input.recv() => match maybe_metadata {
                    Some(metadata) => {
                        self.pending.merge(metadata);
                    }
                    None => break,
                },
            }
        }

        while let Ok(metadata) = input.try_recv() {
            self.pending.merge(metadata);
        }
        self.flush().await;
        debug!("Service writer stopped.");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use basenji_core::{services::APP_TYPE_KEY, Span};

    use super::*;

    #[derive(Default)]
    struct RecordingWriter {
        payloads: Mutex<Vec<(PayloadKind, serde_json::Value)>>,
        fail_with: Option<u16>,
    }

    impl RecordingWriter {
        fn payloads(&self) -> Vec<(PayloadKind, serde_json::Value)> {
            self.payloads.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PayloadWriter for RecordingWriter {
        async fn write(&self, kind: PayloadKind, body: Vec<u8>) -> Result<(), WriteError> {
            if let Some(status) = self.fail_with {
                return Err(WriteError::Permanent { status });
            }
            let value = serde_json::from_slice(&body).unwrap();
            self.payloads.lock().unwrap().push((kind, value));
            Ok(())
        }
    }

    fn trace(id: u64) -> Trace {
        Trace::new(vec![Span::new("web", "request", "GET /", "web", id, id, 0, 0, 10, 0)])
    }

    #[test]
    fn configuration_from_values() {
        let config = basenji_config::ConfigurationLoader::default()
            .with_values(serde_json::json!({
                "api_key": "secret",
                "hostname": "host-a",
                "trace_flush_period": 0.5,
                "writer_max_retries": 2,
            }))
            .into_generic();
        let config = WriterConfiguration::from_configuration(&config).unwrap();
        assert_eq!(config.api_key, "secret");
        assert_eq!(config.hostname(), "host-a");
        assert_eq!(config.default_env(), "none");
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.trace_flush_period(), Duration::from_millis(500));
        assert_eq!(config.service_flush_period(), Duration::from_secs(5));
    }

    #[test]
    fn error_classification() {
        assert!(WriteError::Transient { reason: "boom".into() }.is_transient());
        assert!(!WriteError::Permanent { status: 400 }.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn traces_are_flushed_periodically() {
        let recorder = Arc::new(RecordingWriter::default());
        let config = WriterConfiguration::default();
        let mut writer = TraceWriter::new(recorder.clone(), &config);
        let (tx, mut rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { writer.run(&mut rx, &shutdown).await }
        });

        tx.send(trace(1)).await.unwrap();
        tx.send(trace(2)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(recorder.payloads().is_empty());

        tokio::time::sleep(Duration::from_secs(5)).await;
        let payloads = recorder.payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].0, PayloadKind::Traces);
        assert_eq!(payloads[0].1["env"], "none");
        assert_eq!(payloads[0].1["traces"].as_array().unwrap().len(), 2);

        tx.send(trace(3)).await.unwrap();
        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(recorder.payloads().len(), 2);
    }

    #[tokio::test]
    async fn stats_are_sent_immediately() {
        let recorder = Arc::new(RecordingWriter::default());
        let mut writer = StatsWriter::new(recorder.clone(), &WriterConfiguration::default());
        let (tx, mut rx) = mpsc::channel(8);

        tx.send(vec![StatsBucket::new(0, 10)]).await.unwrap();
        drop(tx);
        writer.run(&mut rx, &CancellationToken::new()).await;

        let payloads = recorder.payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].0, PayloadKind::Stats);
        assert_eq!(payloads[0].1["stats"][0]["duration"], 10);
    }

    #[tokio::test]
    async fn services_are_merged_before_flush() {
        let recorder = Arc::new(RecordingWriter::default());
        let mut writer = ServiceWriter::new(recorder.clone(), &WriterConfiguration::default());
        let (tx, mut rx) = mpsc::channel(8);

        for (service, app_type) in [("web", "web"), ("pg", "db"), ("web", "web")] {
            let mut metadata = ServicesMetadata::new();
            metadata.insert(service, APP_TYPE_KEY, app_type);
            tx.send(metadata).await.unwrap();
        }
        drop(tx);
        writer.run(&mut rx, &CancellationToken::new()).await;

        let payloads = recorder.payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].1["pg"][APP_TYPE_KEY], "db");
        assert_eq!(payloads[0].1.as_object().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rejected_payloads_are_dropped() {
        let recorder = Arc::new(RecordingWriter {
            fail_with: Some(403),
            ..Default::default()
        });
        let mut writer = TraceWriter::new(recorder.clone(), &WriterConfiguration::default());
        writer.buffer.push(trace(1));
        writer.flush().await;
        assert!(writer.buffer.is_empty());
        assert!(recorder.payloads().is_empty());
    }
}
