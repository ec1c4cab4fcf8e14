//! Priority engine for traces carrying a sampling priority set by the tracer.

use basenji_common::collections::FastHashMap;
use basenji_core::ProcessedTrace;

use super::catalog::ServiceKeyCatalog;
use super::core_sampler::Sampler;
use super::signature::ServiceSignature;

/// Tracer decided to drop the trace, agent-side rates apply.
pub const PRIORITY_AUTO_DROP: i32 = 0;

/// Tracer decided to keep the trace, agent-side rates apply.
pub const PRIORITY_AUTO_KEEP: i32 = 1;

/// Honours the tracer's decision while scoring `(service, env)` pairs.
///
/// Only automatic priorities take part in scoring: the resulting per-service rates are fed back to tracers so that
/// their own decisions converge to the agent's target.
pub struct PriorityEngine {
    sampler: Sampler,
    catalog: ServiceKeyCatalog,
}

impl PriorityEngine {
    pub fn new(extra_rate: f64, max_tps: f64) -> Self {
        Self {
            sampler: Sampler::new(extra_rate, max_tps),
            catalog: ServiceKeyCatalog::new(),
        }
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    pub fn sampler_mut(&mut self) -> &mut Sampler {
        &mut self.sampler
    }

    /// Records the trace and returns whether the tracer asked to keep it.
    pub fn sample(&mut self, trace: &ProcessedTrace, priority: i32) -> bool {
        let Some(root) = trace.root() else {
            return false;
        };

        let keep = priority > 0;
        if !(PRIORITY_AUTO_DROP..=PRIORITY_AUTO_KEEP).contains(&priority) {
            return keep;
        }

        let signature = self.catalog.register(&ServiceSignature::new(root.service(), trace.env()));
        self.sampler.backend_mut().count_signature(signature);
        if keep {
            self.sampler.backend_mut().count_sample();
        }

        keep
    }

    /// Returns the current rate of every live `(service, env)` pair, plus the default entry.
    pub fn rates_by_service(&mut self) -> FastHashMap<String, f64> {
        self.catalog.rates_by_service(&self.sampler)
    }
}
