use super::backend::Backend;
use super::signature::Signature;

/// Period of the scoring feedback loop.
pub const ADJUST_PERIOD: std::time::Duration = std::time::Duration::from_secs(10);

const INITIAL_SIGNATURE_SCORE_OFFSET: f64 = 1.0;
const MIN_SIGNATURE_SCORE_OFFSET: f64 = 0.01;
const DEFAULT_SIGNATURE_SCORE_SLOPE: f64 = 3.0;

// Knuth multiplicative hashing constant, shared by every agent so that decisions agree across hosts.
const SAMPLER_HASHER: u64 = 1111111111111111111;
const MAX_TRACE_ID_FLOAT: f64 = u64::MAX as f64;

/// Returns whether to keep a trace, based on its ID and a sampling rate.
///
/// This assumes that trace IDs are nearly uniformly distributed.
pub fn sample_by_rate(trace_id: u64, rate: f64) -> bool {
    if rate < 1.0 {
        trace_id.wrapping_mul(SAMPLER_HASHER) < (rate * MAX_TRACE_ID_FLOAT) as u64
    } else {
        true
    }
}

/// Scoring state shared by all sampling engines.
///
/// Maps a signature score to a keep probability through a logarithmic taper: `rate = factor / slope^log10(score)`
/// once the score exceeds `offset`, with `factor = slope^log10(offset)`. The offset is tuned by
/// [`adjust_scoring`](Sampler::adjust_scoring) so that kept throughput tracks `max_tps`.
#[derive(Debug)]
pub struct Sampler {
    backend: Backend,
    extra_rate: f64,
    max_tps: f64,
    signature_score_offset: f64,
    signature_score_slope: f64,
    signature_score_factor: f64,
}

impl Sampler {
    /// Creates a new `Sampler` with a default backend.
    pub fn new(extra_rate: f64, max_tps: f64) -> Self {
        let mut sampler = Self {
            backend: Backend::default(),
            extra_rate,
            max_tps,
            signature_score_offset: 0.0,
            signature_score_slope: 0.0,
            signature_score_factor: 0.0,
        };
        sampler.set_signature_coefficients(INITIAL_SIGNATURE_SCORE_OFFSET, DEFAULT_SIGNATURE_SCORE_SLOPE);
        sampler
    }

    pub fn set_signature_coefficients(&mut self, offset: f64, slope: f64) {
        self.signature_score_offset = offset;
        self.signature_score_slope = slope;
        self.signature_score_factor = slope.powf(offset.log10());
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut Backend {
        &mut self.backend
    }

    pub fn signature_score_offset(&self) -> f64 {
        self.signature_score_offset
    }

    /// Returns the keep probability of a signature, before the extra rate is applied.
    pub fn signature_rate(&self, signature: Signature) -> f64 {
        self.rate_for_score(self.backend.signature_score(signature))
    }

    /// Returns the rate to apply to a trace with the given signature.
    pub fn sample_rate(&self, signature: Signature) -> f64 {
        self.signature_rate(signature) * self.extra_rate
    }

    /// Returns the rate for signatures the backend knows nothing about, derived from the overall throughput.
    pub fn default_rate(&self) -> f64 {
        self.rate_for_score(self.backend.total_score()) * self.extra_rate
    }

    /// Returns the additional rate needed to bring kept throughput down to `max_tps`.
    pub fn max_tps_rate(&self) -> f64 {
        if self.max_tps > 0.0 {
            let current_tps = self.backend.upper_sampled_score();
            if current_tps > self.max_tps {
                return self.max_tps / current_tps;
            }
        }
        1.0
    }

    fn rate_for_score(&self, score: f64) -> f64 {
        if score > self.signature_score_offset {
            let rate = self.signature_score_factor / self.signature_score_slope.powf(score.log10());
            rate.clamp(0.0, 1.0)
        } else {
            1.0
        }
    }

    /// Scales the score offset so that kept throughput converges toward `max_tps`.
    pub fn adjust_scoring(&mut self) {
        if self.max_tps <= 0.0 {
            return;
        }

        let current_tps = self.backend.sampled_score();
        let total_tps = self.backend.total_score();
        let offset = self.signature_score_offset;

        let coefficient = if current_tps > self.max_tps {
            if current_tps > 3.0 * self.max_tps {
                0.5
            } else {
                0.8
            }
        } else if current_tps < 0.8 * self.max_tps && current_tps < 0.99 * total_tps && offset < self.max_tps {
            // Raising the offset only helps when traces are actually being dropped.
            if current_tps < 0.5 * self.max_tps {
                1.3
            } else {
                1.1
            }
        } else {
            1.0
        };

        if coefficient != 1.0 {
            let new_offset = (offset * coefficient).max(MIN_SIGNATURE_SCORE_OFFSET);
            self.set_signature_coefficients(new_offset, self.signature_score_slope);
        }
    }
}
