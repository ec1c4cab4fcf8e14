//! Core data model for the trace agent.
//!
//! Everything that flows between pipeline stages lives here: spans and traces as decoded from tracers, the
//! `ProcessedTrace` produced by normalization, the statistics buckets produced by the concentrator, and service
//! metadata.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod keys;
pub mod services;
pub mod span;
pub mod stats;
pub mod trace;

pub use self::services::ServicesMetadata;
pub use self::span::Span;
pub use self::stats::{grain_key, Count, Distribution, StatsBucket, StatsPayload, Tag, TagSet};
pub use self::trace::{ProcessedTrace, SublayerValue, Trace, WeightedSpan};
