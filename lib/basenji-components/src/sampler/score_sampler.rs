use basenji_core::ProcessedTrace;

use super::core_sampler::{sample_by_rate, Sampler};
use super::signature::compute_signature_with_root_and_env;
use super::SamplingDecision;

/// Which traces a [`ScoreEngine`] is responsible for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EngineKind {
    /// Traces without a sampling priority and without errors.
    Normal,

    /// Traces without a sampling priority containing at least one error.
    Errors,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "score",
            Self::Errors => "errors",
        }
    }
}

/// Samples traces by scoring their signature.
///
/// Rates are applied on the trace ID, so every agent seeing a chunk of the same trace makes the same decision for a
/// given rate.
pub struct ScoreEngine {
    kind: EngineKind,
    sampler: Sampler,
}

impl ScoreEngine {
    pub fn new(kind: EngineKind, extra_rate: f64, max_tps: f64) -> Self {
        Self {
            kind,
            sampler: Sampler::new(extra_rate, max_tps),
        }
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    pub fn sampler_mut(&mut self) -> &mut Sampler {
        &mut self.sampler
    }

    /// Counts the trace and decides whether to keep it.
    pub fn sample(&mut self, trace: &ProcessedTrace) -> SamplingDecision {
        let Some(root) = trace.root() else {
            return SamplingDecision::dropped();
        };

        let signature = compute_signature_with_root_and_env(trace.trace(), trace.root_index(), trace.env());
        self.sampler.backend_mut().count_signature(signature);

        let initial_rate = root.sample_rate();
        let mut rate = self.sampler.sample_rate(signature);
        let mut keep = sample_by_rate(root.trace_id(), initial_rate * rate);

        if keep {
            self.sampler.backend_mut().count_sample();

            // The ceiling composes with the signature rate, so a trace kept here is re-tested at the combined rate.
            let max_tps_rate = self.sampler.max_tps_rate();
            if max_tps_rate < 1.0 {
                rate *= max_tps_rate;
                keep = sample_by_rate(root.trace_id(), initial_rate * rate);
            }
        }

        SamplingDecision { keep, rate }
    }
}

#[cfg(test)]
mod tests {
    use basenji_core::{keys::SAMPLE_RATE_KEY, Span, Trace};
    use proptest::prelude::*;

    use super::*;

    fn trace(trace_id: u64) -> ProcessedTrace {
        let root = Span::new("web", "request", "GET /users", "web", trace_id, 1, 0, 0, 100, 0);
        ProcessedTrace::new(Trace::new(vec![root]), 0, "prod")
    }

    #[test]
    fn first_traces_are_kept() {
        let mut engine = ScoreEngine::new(EngineKind::Normal, 1.0, 0.0);
        let decision = engine.sample(&trace(42));
        assert!(decision.keep);
        assert_eq!(decision.rate, 1.0);
    }

    #[test]
    fn rate_converges_to_analytic_value() {
        let mut engine = ScoreEngine::new(EngineKind::Normal, 1.0, 0.0);
        let mut last = SamplingDecision::dropped();
        for trace_id in 1..=1000u64 {
            last = engine.sample(&trace(trace_id.wrapping_mul(0x9e37_79b9_7f4a_7c15)));
        }

        // The 1000th trace sees the 1000 counted so far.
        let score: f64 = 1000.0 / 45.0;
        let expected = 1.0 / 3f64.powf(score.log10());
        assert!((last.rate - expected).abs() / expected < 0.05, "rate = {}", last.rate);
    }

    #[test]
    fn keeps_roughly_the_rate() {
        let mut engine = ScoreEngine::new(EngineKind::Normal, 1.0, 0.0);
        let mut kept = 0;
        let mut expected = 0.0;
        for trace_id in 1..=20_000u64 {
            let decision = engine.sample(&trace(trace_id.wrapping_mul(0x9e37_79b9_7f4a_7c15)));
            expected += decision.rate;
            if decision.keep {
                kept += 1;
            }
        }
        let ratio = kept as f64 / expected;
        assert!((ratio - 1.0).abs() < 0.1, "kept = {}, expected = {}", kept, expected);
    }

    #[test]
    fn client_rate_composes() {
        let mut engine = ScoreEngine::new(EngineKind::Normal, 1.0, 0.0);
        let root =
            Span::new("web", "request", "GET /users", "web", 42, 1, 0, 0, 100, 0).with_metric(SAMPLE_RATE_KEY, 0.0);
        let decision = engine.sample(&ProcessedTrace::new(Trace::new(vec![root]), 0, "prod"));

        // The engine's own rate is 1 but the client already sampled everything out.
        assert!(!decision.keep);
        assert_eq!(decision.rate, 1.0);
    }

    #[test]
    fn max_tps_limits_kept_traces() {
        let mut engine = ScoreEngine::new(EngineKind::Errors, 1.0, 1.0);
        let mut kept = 0;
        for trace_id in 1..=1000u64 {
            // Distinct signatures, so only the ceiling restricts the rate.
            let id = trace_id.wrapping_mul(0x9e37_79b9_7f4a_7c15);
            let root = Span::new(format!("svc-{}", trace_id), "op", "res", "web", id, 1, 0, 0, 1, 1);
            if engine.sample(&ProcessedTrace::new(Trace::new(vec![root]), 0, "prod")).keep {
                kept += 1;
            }
        }
        // The first 40 fit under the ceiling, after which the n-th trace is kept with probability 40/n.
        assert!((40..250).contains(&kept), "kept = {}", kept);
        assert!(engine.sampler().max_tps_rate() < 1.0);
    }

    proptest! {
        #[test]
        fn decisions_are_deterministic(trace_id: u64, warmup in 0usize..200) {
            let mut a = ScoreEngine::new(EngineKind::Normal, 1.0, 0.0);
            let mut b = ScoreEngine::new(EngineKind::Normal, 1.0, 0.0);
            for i in 0..warmup as u64 {
                a.sample(&trace(i));
                b.sample(&trace(i));
            }
            prop_assert_eq!(a.sample(&trace(trace_id)), b.sample(&trace(trace_id)));
        }
    }
}
