//! Resource governor.
//!
//! The watchdog periodically probes the process for CPU, memory and connection usage. Exceeding the memory or
//! connection limit is fatal. CPU usage drives the pre-sampling rate: when the agent burns more CPU than allowed, the
//! pre-sampler is told to admit proportionally fewer payloads.

use std::{
    sync::Arc,
    time::{Duration, Instant as StdInstant},
};

use arc_swap::ArcSwap;
use basenji_config::GenericConfiguration;
use basenji_error::{generic_error, GenericError};
use metrics::gauge;
use process_stats::Querier;
use serde::{Deserialize, Serialize};
use tokio::{
    select,
    time::{interval_at, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::presampler::PreSampler;

/// Relative decrease below which the pre-sampling rate is left untouched.
const RATE_DECREASE_DEADBAND: f64 = 0.3;

const fn default_watchdog_interval_secs() -> f64 {
    10.0
}

const fn default_max_cpu() -> f64 {
    0.5
}

const fn default_max_rate() -> f64 {
    1.0
}

const fn default_min_rate() -> f64 {
    0.05
}

/// Watchdog configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct WatchdogConfiguration {
    /// How often resources are probed, in seconds.
    ///
    /// Defaults to 10 seconds.
    #[serde(rename = "watchdog_interval", default = "default_watchdog_interval_secs")]
    interval_secs: f64,

    /// Maximum resident memory, in bytes, before the process is terminated.
    ///
    /// Defaults to 0, which disables the limit.
    #[serde(default)]
    max_memory: u64,

    /// Maximum number of open connections before the process is terminated.
    ///
    /// Defaults to 0, which disables the limit.
    #[serde(default)]
    max_connections: u64,

    /// Target CPU usage, as a fraction of one core.
    ///
    /// Defaults to `0.5`.
    #[serde(default = "default_max_cpu")]
    max_cpu: f64,

    /// Highest pre-sampling rate the watchdog will set.
    ///
    /// Defaults to `1.0`.
    #[serde(rename = "pre_sample_rate", default = "default_max_rate")]
    max_rate: f64,

    /// Lowest pre-sampling rate the watchdog will set.
    ///
    /// Defaults to `0.05`.
    #[serde(rename = "pre_sample_min_rate", default = "default_min_rate")]
    min_rate: f64,
}

impl Default for WatchdogConfiguration {
    fn default() -> Self {
        Self {
            interval_secs: default_watchdog_interval_secs(),
            max_memory: 0,
            max_connections: 0,
            max_cpu: default_max_cpu(),
            max_rate: default_max_rate(),
            min_rate: default_min_rate(),
        }
    }
}

impl WatchdogConfiguration {
    /// Creates a new `WatchdogConfiguration` from the given configuration.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed()?)
    }

    /// Sets the target CPU usage.
    pub fn with_max_cpu(mut self, max_cpu: f64) -> Self {
        self.max_cpu = max_cpu;
        self
    }

    /// Sets the memory limit, in bytes.
    pub fn with_max_memory(mut self, max_memory: u64) -> Self {
        self.max_memory = max_memory;
        self
    }

    /// Sets the connection limit.
    pub fn with_max_connections(mut self, max_connections: u64) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Sets the probing interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_secs = interval.as_secs_f64();
        self
    }

    /// Returns the probing interval.
    pub fn interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.interval_secs).unwrap_or(Duration::ZERO)
    }

    /// Builds a `Watchdog` governing `presampler`, probing the current process.
    ///
    /// `die` is called with a diagnostic when a hard limit is exceeded. It is expected not to return.
    ///
    /// # Errors
    ///
    /// If the interval is not strictly positive, or the rate bounds are inconsistent, an error is returned.
    pub fn build<F>(&self, presampler: Arc<PreSampler>, die: F) -> Result<Watchdog, GenericError>
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.build_with_probe(presampler, Box::new(ProcessProbe::new()), die)
    }

    fn build_with_probe<F>(
        &self, presampler: Arc<PreSampler>, probe: Box<dyn ResourceProbe>, die: F,
    ) -> Result<Watchdog, GenericError>
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        if self.interval().is_zero() {
            return Err(generic_error!(
                "watchdog_interval must be greater than zero, got {}",
                self.interval_secs
            ));
        }
        if !(self.min_rate > 0.0 && self.min_rate <= self.max_rate && self.max_rate <= 1.0) {
            return Err(generic_error!(
                "pre-sampling rate bounds must satisfy 0 < min <= max <= 1, got min={} max={}",
                self.min_rate,
                self.max_rate
            ));
        }

        Ok(Watchdog {
            config: self.clone(),
            presampler,
            probe,
            die: Box::new(die),
            info: Arc::new(ArcSwap::from_pointee(WatchdogInfo::default())),
        })
    }
}

/// Computes the pre-sampling rate bringing CPU usage from `current_cpu` back to `max_cpu`.
///
/// The rate scales inversely with CPU usage and is clamped to `[min_rate, max_rate]`. Decreases of less than 30% are
/// ignored to avoid reacting to noise. Inconsistent inputs yield `max_rate`.
pub fn calc_pre_sample_rate(max_cpu: f64, current_cpu: f64, current_rate: f64, min_rate: f64, max_rate: f64) -> f64 {
    if max_cpu <= 0.0 || current_cpu <= 0.0 || current_rate <= 0.0 || current_rate > 1.0 {
        return max_rate;
    }

    let new_rate = (current_rate * max_cpu / current_cpu).clamp(min_rate, max_rate);
    let delta = (new_rate - current_rate) / current_rate;
    if delta < 0.0 && delta > -RATE_DECREASE_DEADBAND {
        return current_rate.clamp(min_rate, max_rate);
    }
    new_rate
}

/// Source of process resource measurements.
pub trait ResourceProbe: Send {
    /// Average user CPU usage since the previous call, as a fraction of one core.
    fn cpu_user_avg(&mut self) -> f64;

    /// Resident memory, in bytes.
    fn rss_bytes(&mut self) -> Option<u64>;

    /// Number of open connections.
    fn open_connections(&mut self) -> Option<u64>;
}

/// Probes the current process.
pub struct ProcessProbe {
    querier: Querier,
    last_cpu: Option<(StdInstant, Duration)>,
}

impl ProcessProbe {
    /// Creates a new `ProcessProbe`.
    pub fn new() -> Self {
        Self {
            querier: Querier::default(),
            last_cpu: None,
        }
    }
}

impl Default for ProcessProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for ProcessProbe {
    fn cpu_user_avg(&mut self) -> f64 {
        let Some(user) = self.querier.user_cpu_time() else {
            return 0.0;
        };
        let now = StdInstant::now();

        let avg = match self.last_cpu {
            Some((last_at, last_user)) => {
                let wall = now.duration_since(last_at).as_secs_f64();
                if wall > 0.0 {
                    user.saturating_sub(last_user).as_secs_f64() / wall
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last_cpu = Some((now, user));
        avg
    }

    fn rss_bytes(&mut self) -> Option<u64> {
        self.querier.resident_set_size()
    }

    fn open_connections(&mut self) -> Option<u64> {
        self.querier.open_sockets()
    }
}

/// Last measurements taken by the watchdog.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct WatchdogInfo {
    /// Average user CPU usage over the last interval, as a fraction of one core.
    pub cpu_user_avg: f64,

    /// Resident memory, in bytes.
    pub rss_bytes: u64,

    /// Number of open connections.
    pub open_connections: u64,
}

/// Periodic resource governor.
pub struct Watchdog {
    config: WatchdogConfiguration,
    presampler: Arc<PreSampler>,
    probe: Box<dyn ResourceProbe>,
    die: Box<dyn Fn(String) + Send + Sync>,
    info: Arc<ArcSwap<WatchdogInfo>>,
}

impl Watchdog {
    /// Returns a handle to the last measurements.
    pub fn info(&self) -> Arc<ArcSwap<WatchdogInfo>> {
        Arc::clone(&self.info)
    }

    /// Probes resources once, enforcing limits and updating the pre-sampling rate.
    pub fn check(&mut self) {
        let info = WatchdogInfo {
            cpu_user_avg: self.probe.cpu_user_avg(),
            rss_bytes: self.probe.rss_bytes().unwrap_or(0),
            open_connections: self.probe.open_connections().unwrap_or(0),
        };

        if self.config.max_memory > 0 && info.rss_bytes > self.config.max_memory {
            (self.die)(format!(
                "exceeded max memory (current={}, max={})",
                info.rss_bytes, self.config.max_memory
            ));
            return;
        }
        if self.config.max_connections > 0 && info.open_connections > self.config.max_connections {
            (self.die)(format!(
                "exceeded max connections (current={}, max={})",
                info.open_connections, self.config.max_connections
            ));
            return;
        }

        gauge!("watchdog_cpu_user_avg").set(info.cpu_user_avg);
        gauge!("watchdog_rss_bytes").set(info.rss_bytes as f64);
        gauge!("watchdog_open_connections").set(info.open_connections as f64);

        let rate = calc_pre_sample_rate(
            self.config.max_cpu,
            info.cpu_user_avg,
            self.presampler.real_rate(),
            self.config.min_rate,
            self.config.max_rate,
        );
        if rate != self.presampler.rate() {
            info!(
                rate,
                cpu_user_avg = info.cpu_user_avg,
                max_cpu = self.config.max_cpu,
                "Adjusting pre-sampling rate."
            );
        }
        self.presampler.set_rate(rate);
        debug!(?info, rate, "Watchdog check complete.");

        self.info.store(Arc::new(info));
    }

    /// Runs the watchdog until `shutdown` is cancelled.
    ///
    /// The first probe happens one full interval after start, so that a misconfigured limit cannot kill the process
    /// in a tight restart loop.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let period = self.config.interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        info!(interval = ?period, "Watchdog started.");

        loop {
            select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.check(),
            }
        }

        info!("Watchdog stopped.");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct FakeProbe {
        cpu: f64,
        rss: u64,
        connections: u64,
    }

    impl ResourceProbe for FakeProbe {
        fn cpu_user_avg(&mut self) -> f64 {
            self.cpu
        }

        fn rss_bytes(&mut self) -> Option<u64> {
            Some(self.rss)
        }

        fn open_connections(&mut self) -> Option<u64> {
            Some(self.connections)
        }
    }

    fn fixture(
        config: WatchdogConfiguration, cpu: f64, rss: u64, connections: u64,
    ) -> (Watchdog, Arc<PreSampler>, Arc<Mutex<Vec<String>>>) {
        let presampler = Arc::new(PreSampler::new(1.0, 100));
        let deaths = Arc::new(Mutex::new(Vec::new()));
        let probe = FakeProbe {
            cpu,
            rss,
            connections,
        };
        let recorded = Arc::clone(&deaths);
        let watchdog = config
            .build_with_probe(Arc::clone(&presampler), Box::new(probe), move |reason| {
                recorded.lock().unwrap().push(reason)
            })
            .unwrap();
        (watchdog, presampler, deaths)
    }

    #[test]
    fn rate_scales_with_cpu() {
        assert_eq!(calc_pre_sample_rate(0.1, 0.2, 1.0, 0.05, 1.0), 0.5);
        assert_eq!(calc_pre_sample_rate(0.1, 0.05, 1.0, 0.05, 1.0), 1.0);
        assert_eq!(calc_pre_sample_rate(0.1, 0.05, 0.5, 0.05, 0.8), 0.8);
        assert_eq!(calc_pre_sample_rate(0.1, 10.0, 1.0, 0.05, 1.0), 0.05);
    }

    #[test]
    fn small_decreases_are_ignored() {
        assert_eq!(calc_pre_sample_rate(0.1, 0.12, 1.0, 0.05, 1.0), 1.0);
        assert_eq!(calc_pre_sample_rate(0.1, 0.12, 0.6, 0.05, 1.0), 0.6);
        assert!((calc_pre_sample_rate(0.1, 0.15, 0.6, 0.05, 1.0) - 0.4).abs() < 1e-9);
        // Increases always apply.
        assert!((calc_pre_sample_rate(0.1, 0.09, 0.5, 0.05, 1.0) - 0.5 / 0.9).abs() < 1e-9);
    }

    #[test]
    fn inconsistent_inputs_use_max_rate() {
        assert_eq!(calc_pre_sample_rate(0.0, 0.2, 0.5, 0.05, 1.0), 1.0);
        assert_eq!(calc_pre_sample_rate(0.1, 0.0, 0.5, 0.05, 0.9), 0.9);
        assert_eq!(calc_pre_sample_rate(0.1, 0.2, 0.0, 0.05, 1.0), 1.0);
        assert_eq!(calc_pre_sample_rate(0.1, 0.2, 1.5, 0.05, 1.0), 1.0);
    }

    #[test]
    fn check_adjusts_presampler() {
        let config = WatchdogConfiguration::default().with_max_cpu(0.1);
        let (mut watchdog, presampler, deaths) = fixture(config, 0.2, 1024, 3);
        watchdog.check();

        assert_eq!(presampler.rate(), 0.5);
        assert!(deaths.lock().unwrap().is_empty());

        let info = watchdog.info().load_full();
        assert_eq!(info.cpu_user_avg, 0.2);
        assert_eq!(info.rss_bytes, 1024);
        assert_eq!(info.open_connections, 3);
    }

    #[test]
    fn limits_are_fatal() {
        let config = WatchdogConfiguration::default().with_max_memory(1000);
        let (mut watchdog, presampler, deaths) = fixture(config, 0.9, 2000, 0);
        watchdog.check();
        assert_eq!(deaths.lock().unwrap().len(), 1);
        assert!(deaths.lock().unwrap()[0].contains("max memory"));
        assert_eq!(presampler.rate(), 1.0);

        let config = WatchdogConfiguration::default().with_max_connections(10);
        let (mut watchdog, _, deaths) = fixture(config, 0.0, 0, 11);
        watchdog.check();
        assert!(deaths.lock().unwrap()[0].contains("max connections"));
    }

    #[test]
    fn zero_limits_are_disabled() {
        let (mut watchdog, _, deaths) = fixture(WatchdogConfiguration::default(), 0.1, u64::MAX, u64::MAX);
        watchdog.check();
        assert!(deaths.lock().unwrap().is_empty());
    }

    #[test]
    fn invalid_configuration() {
        let presampler = Arc::new(PreSampler::new(1.0, 100));
        let config = WatchdogConfiguration::default().with_interval(Duration::ZERO);
        assert!(config.build(Arc::clone(&presampler), |_| {}).is_err());

        let config = WatchdogConfiguration {
            min_rate: 0.5,
            max_rate: 0.2,
            ..Default::default()
        };
        assert!(config.build(presampler, |_| {}).is_err());
    }

    #[test]
    fn configuration_from_values() {
        let config = basenji_config::ConfigurationLoader::default()
            .with_values(serde_json::json!({
                "watchdog_interval": 2.5,
                "max_memory": 1000000,
                "max_cpu": 0.25,
                "pre_sample_min_rate": 0.1,
            }))
            .into_generic();
        let config = WatchdogConfiguration::from_configuration(&config).unwrap();
        assert_eq!(config.interval(), Duration::from_millis(2500));
        assert_eq!(config.max_memory, 1_000_000);
        assert_eq!(config.max_connections, 0);
        assert_eq!(config.max_cpu, 0.25);
        assert_eq!(config.min_rate, 0.1);
        assert_eq!(config.max_rate, 1.0);
    }

    #[test]
    fn process_probe_reports_usage() {
        let mut probe = ProcessProbe::new();
        assert_eq!(probe.cpu_user_avg(), 0.0);
        assert!(probe.cpu_user_avg() >= 0.0);
        if cfg!(target_os = "linux") {
            assert!(probe.rss_bytes().unwrap_or(0) > 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn run_probes_every_interval() {
        let config = WatchdogConfiguration::default()
            .with_max_cpu(0.1)
            .with_interval(Duration::from_secs(1));
        let (watchdog, presampler, _) = fixture(config, 0.4, 0, 0);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(watchdog.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(presampler.rate(), 1.0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(presampler.rate(), 0.25);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
