//! Greenwald–Khanna ε-approximate quantile summaries.
//!
//! A [`Summary`] answers `quantile(q)` queries over a stream of `f64` values with an absolute rank error of at most
//! `ε·N`, using `O((1/ε)·log(εN))` entries. Each entry additionally keeps a bounded set of caller-provided sample
//! identifiers (span IDs, in practice) so that a quantile answer can point back at representative traces.
//!
//! Summaries are exported as histogram-like [`SummarySlice`] triples via [`Summary::by_slices`], and several summaries
//! can be combined with per-summary weights through [`by_slices_weighted`].
//!
//! Reference: "Space-Efficient Online Computation of Quantile Summaries" (Greenwald, Khanna 2001).
#![deny(warnings)]
#![deny(missing_docs)]

mod summary;
pub use self::summary::{Entry, Summary, SummarySlice, EPSILON, MAX_SAMPLES_PER_ENTRY};

mod weighted;
pub use self::weighted::{by_slices_weighted, weigh_summary, WeightedSummary};
