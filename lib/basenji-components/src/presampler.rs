//! Pre-sampling of inbound payloads.
//!
//! The pre-sampler drops whole payloads before they are decoded, based on the number of traces the client declared
//! in the [`TRACE_COUNT_HEADER`] header. It is the agent's first line of defense when it cannot keep up: the watchdog
//! lowers the pre-sampling rate when CPU usage is too high, and the pre-sampler drops payloads until the observed
//! kept fraction matches that rate.

use std::sync::{Mutex, MutexGuard, PoisonError};

use basenji_config::GenericConfiguration;
use basenji_error::{generic_error, GenericError};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Header carrying the number of traces in a payload.
pub const TRACE_COUNT_HEADER: &str = "X-Datadog-Trace-Count";

const fn default_pre_sample_rate() -> f64 {
    1.0
}

const fn default_reset_payloads() -> u64 {
    100
}

/// Pre-sampler configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct PreSamplerConfiguration {
    /// Initial, and maximum, fraction of payloads admitted.
    ///
    /// Defaults to `1.0`.
    #[serde(rename = "pre_sample_rate", default = "default_pre_sample_rate")]
    rate: f64,

    /// Number of payloads after which the pre-sampler counters are reset.
    ///
    /// Defaults to 100.
    #[serde(rename = "pre_sample_reset_payloads", default = "default_reset_payloads")]
    reset_payloads: u64,
}

impl Default for PreSamplerConfiguration {
    fn default() -> Self {
        Self {
            rate: default_pre_sample_rate(),
            reset_payloads: default_reset_payloads(),
        }
    }
}

impl PreSamplerConfiguration {
    /// Creates a new `PreSamplerConfiguration` from the given configuration.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed()?)
    }

    /// Builds a `PreSampler` from this configuration.
    ///
    /// # Errors
    ///
    /// If the rate is not in `(0, 1]`, an error is returned.
    pub fn build(&self) -> Result<PreSampler, GenericError> {
        if !(self.rate > 0.0 && self.rate <= 1.0) {
            return Err(generic_error!("pre_sample_rate must be in (0, 1], got {}", self.rate));
        }
        Ok(PreSampler::new(self.rate, self.reset_payloads))
    }
}

/// Snapshot of the pre-sampler state.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PreSamplerStats {
    /// Current pre-sampling rate.
    pub rate: f64,

    /// Fraction of declared traces kept since the last reset.
    pub real_rate: f64,

    /// Configured maximum rate.
    pub target_rate: f64,

    /// Payloads seen since the last reset.
    pub payloads_seen: u64,

    /// Traces seen since the last reset.
    pub traces_seen: u64,

    /// Traces dropped since the last reset.
    pub traces_dropped: u64,

    /// Last error encountered while reading a trace count, if any.
    pub recent_error: Option<String>,
}

#[derive(Debug)]
struct State {
    rate: f64,
    payloads_seen: u64,
    traces_seen: u64,
    traces_dropped: u64,
    recent_error: Option<String>,
}

impl State {
    fn real_rate(&self) -> f64 {
        if self.traces_seen == 0 {
            return self.rate;
        }
        1.0 - self.traces_dropped as f64 / self.traces_seen as f64
    }
}

/// Admission filter for inbound payloads.
///
/// Safe to share between concurrent request handlers.
#[derive(Debug)]
pub struct PreSampler {
    target_rate: f64,
    reset_payloads: u64,
    state: Mutex<State>,
}

impl PreSampler {
    /// Creates a new `PreSampler` admitting payloads at `rate`.
    ///
    /// Counters are reset every `reset_payloads` payloads so that the observed rate follows changes of the target rate.
    pub fn new(rate: f64, reset_payloads: u64) -> Self {
        Self {
            target_rate: rate,
            reset_payloads: reset_payloads.max(1),
            state: Mutex::new(State {
                rate,
                payloads_seen: 0,
                traces_seen: 0,
                traces_dropped: 0,
                recent_error: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the current pre-sampling rate.
    pub fn rate(&self) -> f64 {
        self.state().rate
    }

    /// Sets the pre-sampling rate.
    pub fn set_rate(&self, rate: f64) {
        self.state().rate = rate;
        gauge!("presampler_rate").set(rate);
    }

    /// Returns the fraction of declared traces kept since the last reset.
    pub fn real_rate(&self) -> f64 {
        self.state().real_rate()
    }

    /// Returns a snapshot of the pre-sampler state.
    pub fn stats(&self) -> PreSamplerStats {
        let state = self.state();
        PreSamplerStats {
            rate: state.rate,
            real_rate: state.real_rate(),
            target_rate: self.target_rate,
            payloads_seen: state.payloads_seen,
            traces_seen: state.traces_seen,
            traces_dropped: state.traces_dropped,
            recent_error: state.recent_error.clone(),
        }
    }

    /// Decides whether to admit a payload declaring `trace_count` traces.
    ///
    /// Payloads declaring no traces bypass pre-sampling.
    pub fn sample_with_count(&self, trace_count: i64) -> bool {
        if trace_count <= 0 {
            return true;
        }
        let trace_count = trace_count as u64;

        let (keep, rate) = {
            let mut state = self.state();
            if state.payloads_seen >= self.reset_payloads {
                state.payloads_seen = 0;
                state.traces_seen = 0;
                state.traces_dropped = 0;
            }

            let keep = state.real_rate() <= state.rate;
            if !keep {
                state.traces_dropped += trace_count;
            }
            state.payloads_seen += 1;
            state.traces_seen += trace_count;
            (keep, state.rate)
        };

        if !keep {
            counter!("presampler_traces_dropped_total").increment(trace_count);
            debug!(rate, trace_count, "Pre-sampler dropped payload.");
        }
        keep
    }

    /// Decides whether to admit a payload given the raw value of its trace count header.
    ///
    /// A missing header bypasses pre-sampling. An unparsable one is recorded in [`PreSamplerStats::recent_error`] and
    /// also bypasses pre-sampling.
    pub fn sample(&self, header: Option<&str>) -> bool {
        let trace_count = match header.map(|value| value.trim().parse::<i64>()) {
            None => 0,
            Some(Ok(count)) => count,
            Some(Err(e)) => {
                let message = format!("unable to parse HTTP header {}: {:?} ({})", TRACE_COUNT_HEADER, header, e);
                debug!(error = %message, "Invalid trace count header.");
                self.state().recent_error = Some(message);
                0
            }
        };
        self.sample_with_count(trace_count)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn configuration() {
        let config = basenji_config::ConfigurationLoader::default()
            .with_values(serde_json::json!({ "pre_sample_rate": 0.25, "pre_sample_reset_payloads": 7 }))
            .into_generic();
        let presampler = PreSamplerConfiguration::from_configuration(&config)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(presampler.rate(), 0.25);
        assert_eq!(presampler.reset_payloads, 7);

        let invalid = PreSamplerConfiguration {
            rate: 0.0,
            reset_payloads: 1,
        };
        assert!(invalid.build().is_err());
    }

    #[test]
    fn full_rate_keeps_everything() {
        let presampler = PreSampler::new(1.0, 100);
        for _ in 0..1000 {
            assert!(presampler.sample_with_count(10));
        }
        let stats = presampler.stats();
        assert_eq!(stats.real_rate, 1.0);
        assert_eq!(stats.traces_dropped, 0);
    }

    #[test]
    fn missing_or_invalid_counts_bypass() {
        let presampler = PreSampler::new(0.0, 100);
        assert!(presampler.sample(None));
        assert!(presampler.sample_with_count(0));
        assert!(presampler.sample_with_count(-5));
        assert_eq!(presampler.stats().payloads_seen, 0);

        assert!(presampler.sample(Some("not-a-number")));
        assert!(presampler.stats().recent_error.is_some());

        // The first counted payload is kept, as nothing has been seen yet.
        assert!(presampler.sample(Some("3")));
        assert!(!presampler.sample(Some("3")));
    }

    #[test]
    fn drops_down_to_rate() {
        let presampler = PreSampler::new(0.5, 1000);
        let kept = (0..400).filter(|_| presampler.sample_with_count(5)).count();
        assert_eq!(kept, 200);

        let stats = presampler.stats();
        assert_eq!(stats.payloads_seen, 400);
        assert_eq!(stats.traces_seen, 2000);
        assert_eq!(stats.traces_dropped, 1000);
        assert_eq!(stats.real_rate, 0.5);
    }

    #[test]
    fn counters_reset_and_follow_new_rate() {
        let presampler = PreSampler::new(1.0, 10);
        for _ in 0..10 {
            presampler.sample_with_count(1);
        }
        presampler.set_rate(0.2);
        assert_eq!(presampler.rate(), 0.2);

        let kept = (0..10).filter(|_| presampler.sample_with_count(1)).count();
        assert_eq!(kept, 2);
        assert!((presampler.real_rate() - 0.2).abs() < 1e-9);
        assert_eq!(presampler.stats().target_rate, 1.0);
    }

    #[test]
    fn concurrent_use() {
        let presampler = Arc::new(PreSampler::new(0.5, 1_000_000));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let presampler = Arc::clone(&presampler);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        presampler.sample_with_count(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = presampler.stats();
        assert_eq!(stats.traces_seen, 4000);
        assert!((stats.real_rate - 0.5).abs() < 0.01);
    }

    proptest! {
        #[test]
        fn real_rate_converges(rate in 0.05f64..1.0, count in 1i64..20) {
            let reset = 200u64;
            let presampler = PreSampler::new(rate, reset);
            for _ in 0..reset {
                presampler.sample_with_count(count);
            }
            let real = presampler.real_rate();
            prop_assert!((real - rate).abs() <= 1.0 / reset as f64 + 1e-9, "real = {}, rate = {}", real, rate);
        }
    }
}
