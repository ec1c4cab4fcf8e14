//! Decaying signature counters.

use std::time::Duration;

use basenji_common::collections::FastHashMap;

use super::signature::Signature;

/// Default period between two decays.
pub const DEFAULT_DECAY_PERIOD: Duration = Duration::from_secs(5);

/// Default factor scores are divided by at each decay.
pub const DEFAULT_DECAY_FACTOR: f64 = 1.125;

// Scores at or under this value are dropped instead of decayed.
const DROP_THRESHOLD: f64 = 2.0;

/// Per-signature scores decayed geometrically over time.
///
/// A signature seen at a steady `n` traces per second converges to a raw score of `n * period * F / (F - 1)`, so
/// dividing by that scale gives back an approximation of its throughput.
#[derive(Debug)]
pub struct Backend {
    scores: FastHashMap<Signature, f64>,
    sampled_score: f64,
    total_score: f64,
    decay_factor: f64,
    score_scale: f64,
}

impl Backend {
    /// Creates a new `Backend`.
    pub fn new(decay_period: Duration, decay_factor: f64) -> Self {
        Self {
            scores: FastHashMap::default(),
            sampled_score: 0.0,
            total_score: 0.0,
            decay_factor,
            score_scale: decay_factor / (decay_factor - 1.0) * decay_period.as_secs_f64(),
        }
    }

    /// Counts one trace for the given signature.
    ///
    /// Every signed trace is also counted towards the total.
    pub fn count_signature(&mut self, signature: Signature) {
        *self.scores.entry(signature).or_insert(0.0) += 1.0;
        self.count_total();
    }

    /// Counts one trace towards the total, without attributing it to a signature.
    pub fn count_total(&mut self) {
        self.total_score += 1.0;
    }

    /// Counts one kept trace.
    pub fn count_sample(&mut self) {
        self.sampled_score += 1.0;
    }

    /// Applies one decay step.
    pub fn decay(&mut self) {
        let factor = self.decay_factor;
        self.scores.retain(|_, score| {
            if *score > DROP_THRESHOLD {
                *score /= factor;
                true
            } else {
                false
            }
        });
        self.sampled_score /= factor;
        self.total_score /= factor;
    }

    /// Returns the approximate throughput, in traces per second, of a signature.
    pub fn signature_score(&self, signature: Signature) -> f64 {
        self.scores.get(&signature).copied().unwrap_or(0.0) / self.score_scale
    }

    /// Returns the approximate throughput of kept traces.
    pub fn sampled_score(&self) -> f64 {
        self.sampled_score / self.score_scale
    }

    /// Returns the approximate throughput of all counted traces.
    pub fn total_score(&self) -> f64 {
        self.total_score / self.score_scale
    }

    /// Returns an upper bound of the kept-trace throughput.
    ///
    /// Traces counted since the last decay have not been decayed yet, so the raw score is over-weighted by up to one
    /// decay factor.
    pub fn upper_sampled_score(&self) -> f64 {
        self.sampled_score * self.decay_factor / self.score_scale
    }

    /// Returns the number of tracked signatures.
    pub fn signature_count(&self) -> usize {
        self.scores.len()
    }

    /// Returns `true` if the signature has a live score.
    pub fn contains(&self, signature: Signature) -> bool {
        self.scores.contains_key(&signature)
    }
}

impl Default for Backend {
    fn default() -> Self {
        Self::new(DEFAULT_DECAY_PERIOD, DEFAULT_DECAY_FACTOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_scale() {
        let mut backend = Backend::default();
        let sig = Signature(42);
        for _ in 0..45 {
            backend.count_signature(sig);
        }
        backend.count_sample();

        // 1.125 / 0.125 * 5s
        let scale = 45.0;
        assert_eq!(backend.signature_score(sig), 45.0 / scale);
        assert_eq!(backend.total_score(), 45.0 / scale);
        assert_eq!(backend.sampled_score(), 1.0 / scale);
        assert_eq!(backend.upper_sampled_score(), 1.125 / scale);
        assert_eq!(backend.signature_score(Signature(7)), 0.0);
    }

    #[test]
    fn unsigned_traces_only_count_towards_total() {
        let mut backend = Backend::default();
        backend.count_total();
        backend.count_total();
        assert_eq!(backend.total_score(), 2.0 / 45.0);
        assert_eq!(backend.signature_count(), 0);
    }

    #[test]
    fn decay_drops_small_scores() {
        let mut backend = Backend::default();
        backend.count_signature(Signature(1));
        backend.count_signature(Signature(1));
        for _ in 0..9 {
            backend.count_signature(Signature(2));
        }

        backend.decay();
        assert_eq!(backend.signature_count(), 1);
        assert!(!backend.contains(Signature(1)));
        assert_eq!(backend.signature_score(Signature(1)), 0.0);
        assert!((backend.signature_score(Signature(2)) - 8.0 / 45.0).abs() < 1e-12);

        for _ in 0..20 {
            backend.decay();
        }
        assert_eq!(backend.signature_count(), 0);
    }

    #[test]
    fn steady_state_approximates_throughput() {
        let mut backend = Backend::default();
        let sig = Signature(3);
        // 20 traces per second, 5 seconds per decay period.
        for _ in 0..200 {
            for _ in 0..100 {
                backend.count_signature(sig);
            }
            backend.decay();
        }
        for _ in 0..100 {
            backend.count_signature(sig);
        }

        let score = backend.signature_score(sig);
        assert!((score - 20.0).abs() < 0.5, "score = {}", score);
    }
}
