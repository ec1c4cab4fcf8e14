use serde::{Deserialize, Serialize};

/// Rank precision of quantile queries, as a fraction of the number of inserted values.
pub const EPSILON: f64 = 0.01;

/// Number of inserts between two compressions: `1 / (2ε)`.
const COMPRESS_INTERVAL: u64 = 50;

/// Maximum number of sample identifiers kept on a single entry.
pub const MAX_SAMPLES_PER_ENTRY: usize = 8;

/// A single tuple of the summary.
///
/// `g` is the difference between the minimum rank of this entry and the previous one, and `delta` bounds the
/// uncertainty on its maximum rank.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Entry {
    /// Observed value.
    pub v: f64,

    /// Rank gap to the previous entry.
    pub g: u64,

    /// Rank uncertainty.
    pub delta: u64,

    /// Identifiers of values folded into this entry.
    #[serde(default)]
    pub samples: Vec<u64>,
}

impl Entry {
    fn absorb_samples(&mut self, mut other: Vec<u64>) {
        if self.samples.len() >= MAX_SAMPLES_PER_ENTRY {
            return;
        }
        other.truncate(MAX_SAMPLES_PER_ENTRY - self.samples.len());
        self.samples.append(&mut other);
    }
}

/// A `[start, end]` range of values and an upper bound on how many values fell into it.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct SummarySlice {
    /// Lower bound of the range.
    pub start: f64,

    /// Upper bound of the range.
    pub end: f64,

    /// Number of values in the range.
    pub weight: u64,
}

/// Greenwald–Khanna summary backed by a sorted vector.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Summary {
    entries: Vec<Entry>,
    n: u64,
}

impl Summary {
    /// Creates an empty summary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of values inserted (or merged) into this summary.
    pub fn count(&self) -> u64 {
        self.n
    }

    /// Returns `true` if no value has been inserted.
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Returns the entries of the summary, sorted by value.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Inserts `value`, tagged with the identifier `sample`.
    pub fn insert(&mut self, value: f64, sample: u64) {
        // Equal values go after the existing ones, so the oldest entry for a value keeps its position.
        let idx = self.entries.partition_point(|e| e.v <= value);
        let delta = if idx == 0 || idx == self.entries.len() {
            0
        } else {
            self.max_band()
        };

        self.entries.insert(
            idx,
            Entry {
                v: value,
                g: 1,
                delta,
                samples: vec![sample],
            },
        );
        self.n += 1;

        if self.n % COMPRESS_INTERVAL == 0 {
            self.compress();
        }
    }

    /// `⌊2εN⌋`, the largest `g + delta` an entry may reach after a merge.
    fn max_band(&self) -> u64 {
        (2.0 * EPSILON * self.n as f64) as u64
    }

    /// Merges adjacent entries whenever the combined tuple still satisfies the error bound.
    ///
    /// An entry is always folded into its successor, so the smallest and largest observed values survive. Entries
    /// holding the same value obey the same bound.
    fn compress(&mut self) {
        if self.entries.len() < 3 {
            return;
        }

        let max_band = self.max_band();
        let mut compressed = Vec::with_capacity(self.entries.len());
        let mut entries = std::mem::take(&mut self.entries).into_iter();
        let Some(mut pending) = entries.next() else {
            return;
        };
        let mut pending_is_first = true;

        for mut next in entries {
            if !pending_is_first && pending.g + next.g + next.delta < max_band {
                next.g += pending.g;
                let mut samples = std::mem::take(&mut pending.samples);
                samples.truncate(MAX_SAMPLES_PER_ENTRY);
                next.absorb_samples(samples);
            } else {
                compressed.push(pending);
                pending_is_first = false;
            }
            pending = next;
        }
        compressed.push(pending);

        self.entries = compressed;
    }

    /// Returns an ε-approximation of the value at quantile `q` (`0 <= q <= 1`), along with the sample identifiers kept
    /// for it.
    ///
    /// Returns `None` if the summary is empty.
    pub fn quantile(&self, q: f64) -> Option<(f64, &[u64])> {
        let last = self.entries.last()?;

        let rank = (q * self.n as f64 + 0.5) as u64;
        let eps_n = (EPSILON * self.n as f64) as u64;
        let mut rmin = 0;

        for pair in self.entries.windows(2) {
            let (current, next) = (&pair[0], &pair[1]);
            rmin += current.g;
            // Stop at the last entry whose maximum rank is still within `rank + εN`; its minimum rank is then at
            // least `rank - εN` since `g + delta <= 2εN` holds for every entry.
            if rank + eps_n < rmin + next.g + next.delta {
                return Some((current.v, &current.samples));
            }
        }

        Some((last.v, &last.samples))
    }

    /// Merges `other` into this summary.
    pub fn merge(&mut self, other: &Summary) {
        if other.is_empty() {
            return;
        }

        let ours = std::mem::take(&mut self.entries);
        let mut merged = Vec::with_capacity(ours.len() + other.entries.len());
        let mut ours = ours.into_iter().peekable();
        let mut theirs = other.entries.iter().cloned().peekable();

        loop {
            let take_ours = match (ours.peek(), theirs.peek()) {
                (Some(a), Some(b)) => a.v <= b.v,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            let next = if take_ours { ours.next() } else { theirs.next() };
            merged.extend(next);
        }

        self.entries = merged;
        self.n += other.n;
        self.compress();
    }

    /// Returns the summary as a list of weighted value ranges.
    ///
    /// The first slice is the degenerate range `[min, min]`; every following slice spans from the previous entry's
    /// value to the current one. Weights are upper bounds and add up to [`count`][Self::count].
    pub fn by_slices(&self) -> Vec<SummarySlice> {
        let mut slices = Vec::with_capacity(self.entries.len());
        let mut previous = match self.entries.first() {
            Some(first) => first.v,
            None => return slices,
        };

        for entry in &self.entries {
            slices.push(SummarySlice {
                start: previous,
                end: entry.v,
                weight: entry.g,
            });
            previous = entry.v;
        }

        slices
    }

    pub(crate) fn from_parts(entries: Vec<Entry>, n: u64) -> Self {
        Self { entries, n }
    }
}
