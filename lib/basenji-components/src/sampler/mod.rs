//! Trace sampling.
//!
//! Three engines share the same scoring core:
//! - the score engine handles traces without a sampling priority,
//! - the errors engine handles traces without a sampling priority that contain an error,
//! - the priority engine honours the priority set by tracers and publishes per-service rates back to them.
//!
//! All engines live in a single [`TraceSampler`], owned by one task: traces, decays, feedback adjustments and rate
//! publication are interleaved by that task, so the engines need no locking. The rate-by-service table is the only
//! state shared with other tasks.

use std::{sync::Arc, time::Duration};

use basenji_config::GenericConfiguration;
use basenji_core::{keys::SAMPLE_RATE_KEY, ProcessedTrace, Trace};
use basenji_error::{generic_error, GenericError};
use metrics::{counter, gauge};
use serde::Deserialize;
use tokio::{
    select,
    sync::mpsc,
    time::{interval_at, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

mod backend;
use self::backend::DEFAULT_DECAY_PERIOD;

mod catalog;
pub use self::catalog::DEFAULT_SERVICE_RATE_KEY;

mod core_sampler;
pub use self::core_sampler::sample_by_rate;
use self::core_sampler::{Sampler, ADJUST_PERIOD};

mod priority_sampler;
use self::priority_sampler::PriorityEngine;

mod rate_by_service;
pub use self::rate_by_service::RateByService;

mod score_sampler;
use self::score_sampler::{EngineKind, ScoreEngine};

mod signature;
pub use self::signature::{compute_signature_with_root_and_env, ServiceSignature, Signature};

/// How often per-service rates are published to the rate-by-service table.
const RATE_PUBLISH_PERIOD: Duration = Duration::from_secs(3);

const fn default_extra_sample_rate() -> f64 {
    1.0
}

const fn default_max_tps() -> f64 {
    10.0
}

/// Outcome of sampling a trace.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplingDecision {
    /// Whether the trace is kept.
    pub keep: bool,

    /// Rate applied by the agent, to be composed with the rate already recorded on the root.
    pub rate: f64,
}

impl SamplingDecision {
    fn dropped() -> Self {
        Self { keep: false, rate: 1.0 }
    }
}

/// Sampler configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct SamplerConfiguration {
    /// Rate applied on top of every signature rate.
    ///
    /// Must be in `(0, 1]`. Defaults to `1.0`.
    #[serde(default = "default_extra_sample_rate")]
    extra_sample_rate: f64,

    /// Target ceiling of kept traces per second, per engine. `0` disables the ceiling.
    ///
    /// Defaults to 10.
    #[serde(default = "default_max_tps")]
    max_tps: f64,

    /// Ceiling of the errors engine. Defaults to `max_tps`.
    #[serde(default)]
    errors_max_tps: Option<f64>,
}

impl Default for SamplerConfiguration {
    fn default() -> Self {
        Self {
            extra_sample_rate: default_extra_sample_rate(),
            max_tps: default_max_tps(),
            errors_max_tps: None,
        }
    }
}

impl SamplerConfiguration {
    /// Creates a new `SamplerConfiguration` from the given configuration.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed()?)
    }

    /// Sets the extra sample rate.
    pub fn with_extra_sample_rate(mut self, rate: f64) -> Self {
        self.extra_sample_rate = rate;
        self
    }

    /// Sets the throughput ceiling.
    pub fn with_max_tps(mut self, max_tps: f64) -> Self {
        self.max_tps = max_tps;
        self
    }

    /// Sets the throughput ceiling of the errors engine.
    pub fn with_errors_max_tps(mut self, max_tps: f64) -> Self {
        self.errors_max_tps = Some(max_tps);
        self
    }

    /// Builds a `TraceSampler` publishing into the given rate-by-service table.
    ///
    /// # Errors
    ///
    /// If the extra sample rate is not in `(0, 1]` or a ceiling is negative, an error is returned.
    pub fn build(&self, rate_by_service: RateByService) -> Result<TraceSampler, GenericError> {
        if !(self.extra_sample_rate > 0.0 && self.extra_sample_rate <= 1.0) {
            return Err(generic_error!(
                "extra_sample_rate must be in (0, 1], got {}",
                self.extra_sample_rate
            ));
        }

        let errors_max_tps = self.errors_max_tps.unwrap_or(self.max_tps);
        for (name, value) in [("max_tps", self.max_tps), ("errors_max_tps", errors_max_tps)] {
            if value.is_nan() || value < 0.0 {
                return Err(generic_error!("{} must not be negative, got {}", name, value));
            }
        }

        Ok(TraceSampler {
            score: ScoreEngine::new(EngineKind::Normal, self.extra_sample_rate, self.max_tps),
            errors: ScoreEngine::new(EngineKind::Errors, self.extra_sample_rate, errors_max_tps),
            priority: PriorityEngine::new(self.extra_sample_rate, self.max_tps),
            rate_by_service,
        })
    }
}

/// Routes traces to the sampling engines and combines their decisions.
pub struct TraceSampler {
    score: ScoreEngine,
    errors: ScoreEngine,
    priority: PriorityEngine,
    rate_by_service: RateByService,
}

impl TraceSampler {
    /// Returns the rate-by-service table this sampler publishes into.
    pub fn rate_by_service(&self) -> &RateByService {
        &self.rate_by_service
    }

    /// Decides whether to keep a trace.
    ///
    /// Priorities outside of `{0, 1}` are decided by the tracer alone. Otherwise, the score engine (or the errors engine
    /// when the trace contains an error) runs, along with the priority engine when a priority is set; the trace is
    /// kept if any of them keeps it. The returned rate is the one of the score engine when it kept the trace, and `1`
    /// otherwise.
    pub fn sample(&mut self, trace: &ProcessedTrace) -> SamplingDecision {
        let priority = trace.sampling_priority();

        if let Some(priority) = priority.filter(|p| !(0..=1).contains(p)) {
            let keep = self.priority.sample(trace, priority);
            count_decision("priority", keep);
            return SamplingDecision { keep, rate: 1.0 };
        }

        let engine = if trace.has_error() {
            &mut self.errors
        } else {
            &mut self.score
        };
        let scored = engine.sample(trace);
        count_decision(engine.kind().as_str(), scored.keep);

        let priority_keep = match priority {
            Some(priority) => {
                let keep = self.priority.sample(trace, priority);
                count_decision("priority", keep);
                keep
            }
            None => false,
        };

        if scored.keep {
            scored
        } else {
            SamplingDecision {
                keep: priority_keep,
                rate: 1.0,
            }
        }
    }

    fn engines(&self) -> [(&'static str, &Sampler); 3] {
        [
            (self.score.kind().as_str(), self.score.sampler()),
            (self.errors.kind().as_str(), self.errors.sampler()),
            ("priority", self.priority.sampler()),
        ]
    }

    fn engines_mut(&mut self) -> [(&'static str, &mut Sampler); 3] {
        [
            (self.score.kind().as_str(), self.score.sampler_mut()),
            (self.errors.kind().as_str(), self.errors.sampler_mut()),
            ("priority", self.priority.sampler_mut()),
        ]
    }

    /// Decays the scores of every engine.
    pub fn decay(&mut self) {
        for (engine, sampler) in self.engines_mut() {
            sampler.backend_mut().decay();
            gauge!("sampler_signatures", "engine" => engine).set(sampler.backend().signature_count() as f64);
        }
    }

    /// Runs one step of the scoring feedback loop of every engine.
    pub fn adjust_scoring(&mut self) {
        for (engine, sampler) in self.engines_mut() {
            sampler.adjust_scoring();
            let offset = sampler.signature_score_offset();
            let sampled_tps = sampler.backend().sampled_score();
            gauge!("sampler_score_offset", "engine" => engine).set(offset);
            gauge!("sampler_sampled_tps", "engine" => engine).set(sampled_tps);
            trace!(engine, offset, sampled_tps, "Adjusted scoring.");
        }
    }

    /// Publishes the current per-service rates to the rate-by-service table.
    pub fn publish_rates(&mut self) {
        for (engine, sampler) in self.engines() {
            gauge!("sampler_seen_tps", "engine" => engine).set(sampler.backend().total_score());
        }

        let rates = self.priority.rates_by_service();
        for (key, rate) in &rates {
            gauge!("sampler_rate_by_service", "service" => key.clone()).set(*rate);
        }
        self.rate_by_service.set_all(rates);
    }

    /// Runs the sampler until `shutdown` is triggered or the input channel closes.
    ///
    /// Kept traces are forwarded to `output` with the composed sample rate recorded on their root.
    pub async fn run(
        &mut self, input: &mut mpsc::Receiver<Arc<ProcessedTrace>>, output: &mpsc::Sender<Trace>,
        shutdown: &CancellationToken,
    ) {
        let mut decay = interval_at(Instant::now() + DEFAULT_DECAY_PERIOD, DEFAULT_DECAY_PERIOD);
        let mut adjust = interval_at(Instant::now() + ADJUST_PERIOD, ADJUST_PERIOD);
        let mut publish = interval_at(Instant::now() + RATE_PUBLISH_PERIOD, RATE_PUBLISH_PERIOD);

        debug!("Trace sampler started.");

        loop {
            select! {
                _ = shutdown.cancelled() => break,
                _ = decay.tick() => self.decay(),
                _ = adjust.tick() => self.adjust_scoring(),
                _ = publish.tick() => self.publish_rates(),
                maybe_trace = input.recv() => match maybe_trace {
                    Some(processed) => {
                        let decision = self.sample(&processed);
                        if !decision.keep {
                            continue;
                        }

                        if output.send(sampled_trace(&processed, decision.rate)).await.is_err() {
                            debug!("Sampled trace output closed.");
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        debug!("Trace sampler stopped.");
    }
}

fn count_decision(engine: &'static str, keep: bool) {
    let decision = if keep { "keep" } else { "drop" };
    counter!("sampler_traces_total", "engine" => engine, "decision" => decision).increment(1);
}

/// Copies a kept trace out of the shared processed trace, composing `rate` into the sample rate of its root.
pub fn sampled_trace(processed: &ProcessedTrace, rate: f64) -> Trace {
    let mut trace = processed.trace().clone();
    if let Some(root) = trace.spans_mut().get_mut(processed.root_index()) {
        let applied = root.sample_rate() * rate;
        root.metrics_mut().insert(SAMPLE_RATE_KEY.to_string(), applied);
    }
    trace
}
