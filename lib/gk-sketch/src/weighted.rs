use rand::{rngs::SmallRng, Rng, SeedableRng as _};

use crate::{Entry, Summary, SummarySlice};

/// Fixed seed so that weighting the same summary twice produces the same result.
const ROUNDING_SEED: u64 = 7337;

/// A summary paired with the factor its counts should be scaled by.
#[derive(Clone, Copy, Debug)]
pub struct WeightedSummary<'a> {
    /// Scaling factor applied to every entry's `g`.
    pub weight: f64,

    /// Summary to scale.
    pub summary: &'a Summary,
}

/// Rounds `g * weight` to an integer, rounding up with a probability equal to the fractional part.
fn probabilistic_round<R: Rng>(rng: &mut R, g: u64, weight: f64) -> u64 {
    let raw = weight * g as f64;
    let floor = raw.floor();
    let rounded = if rng.random::<f64>() < raw - floor {
        floor + 1.0
    } else {
        floor
    };
    rounded.max(0.0) as u64
}

/// Returns a copy of `summary` with every count scaled by `weight`.
///
/// Entries whose scaled count rounds down to zero are dropped. Sample identifiers are not carried over.
pub fn weigh_summary(summary: &Summary, weight: f64) -> Summary {
    let mut rng = SmallRng::seed_from_u64(ROUNDING_SEED);
    let mut total = 0;
    let entries = summary
        .entries()
        .iter()
        .filter_map(|e| {
            let g = probabilistic_round(&mut rng, e.g, weight);
            (g != 0).then(|| {
                total += g;
                Entry {
                    v: e.v,
                    g,
                    delta: e.delta,
                    samples: Vec::new(),
                }
            })
        })
        .collect();

    Summary::from_parts(entries, total)
}

/// Weighs and merges several summaries, then returns the combined histogram.
pub fn by_slices_weighted(summaries: &[WeightedSummary<'_>]) -> Vec<SummarySlice> {
    let mut iter = summaries.iter();
    let Some(first) = iter.next() else {
        return Vec::new();
    };

    let mut merged = weigh_summary(first.summary, first.weight);
    for ws in iter {
        merged.merge(&weigh_summary(ws.summary, ws.weight));
    }
    merged.by_slices()
}
