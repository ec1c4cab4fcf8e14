//! Traces.

use basenji_common::collections::{FastHashMap, FastHashSet};
use serde::{Deserialize, Serialize};

use crate::keys::ENV_KEY;
use crate::span::Span;
use crate::stats::Tag;

/// A trace: every span sharing a trace ID, in the order the tracer sent them.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Trace {
    spans: Vec<Span>,
}

impl Trace {
    /// Creates a new `Trace` from the given spans.
    pub fn new(spans: Vec<Span>) -> Self {
        Self { spans }
    }

    /// Returns the spans.
    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    /// Returns a mutable reference to the spans.
    pub fn spans_mut(&mut self) -> &mut [Span] {
        &mut self.spans
    }

    /// Consumes the trace, returning its spans.
    pub fn into_spans(self) -> Vec<Span> {
        self.spans
    }

    /// Returns the number of spans.
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Returns `true` if the trace holds no spans.
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Returns `true` if any span is flagged as an error.
    pub fn has_error(&self) -> bool {
        self.spans.iter().any(Span::is_error)
    }

    /// Finds the index of the root span.
    ///
    /// Root candidates are spans with no parent and spans whose parent is not part of the trace. When several
    /// candidates exist, the one that started first wins, with ties going to the earliest in the trace. Returns `None`
    /// for an empty trace or one where every span has a known parent.
    pub fn root_index(&self) -> Option<usize> {
        let span_ids: FastHashSet<u64> = self.spans.iter().map(Span::span_id).collect();

        let mut root: Option<usize> = None;
        for (idx, span) in self.spans.iter().enumerate() {
            let is_candidate = span.parent_id() == 0 || !span_ids.contains(&span.parent_id());
            if !is_candidate {
                continue;
            }
            match root {
                Some(current) if self.spans[current].start() <= span.start() => {}
                _ => root = Some(idx),
            }
        }
        root
    }

    /// Returns the environment of the trace.
    ///
    /// The root's `env` tag is preferred; otherwise the first span carrying one is used.
    pub fn env(&self, root_idx: usize) -> Option<&str> {
        self.spans
            .get(root_idx)
            .and_then(|root| root.meta().get(ENV_KEY))
            .or_else(|| self.spans.iter().find_map(|span| span.meta().get(ENV_KEY)))
            .map(String::as_str)
    }

    /// Marks every span that is top-level for its service.
    ///
    /// A span is top-level when it has no parent, when its parent is unknown, or when its parent belongs to a
    /// different service.
    pub fn compute_top_level(&mut self) {
        let span_id_to_idx: FastHashMap<u64, usize> = self
            .spans
            .iter()
            .enumerate()
            .map(|(idx, span)| (span.span_id(), idx))
            .collect();

        let flags: Vec<bool> = self
            .spans
            .iter()
            .map(|span| {
                if span.parent_id() == 0 {
                    return true;
                }
                match span_id_to_idx.get(&span.parent_id()) {
                    Some(&parent_idx) => self.spans[parent_idx].service() != span.service(),
                    None => true,
                }
            })
            .collect();

        for (span, top_level) in self.spans.iter_mut().zip(flags) {
            span.set_top_level(top_level);
        }
    }
}

impl From<Vec<Span>> for Trace {
    fn from(spans: Vec<Span>) -> Self {
        Self::new(spans)
    }
}

/// One sublayer measurement attached to a trace root.
#[derive(Clone, Debug, PartialEq)]
pub struct SublayerValue {
    /// Metric name, such as `_sublayers.duration.by_type`.
    pub metric: &'static str,

    /// Tag qualifying the value, absent for the span count.
    pub tag: Option<Tag>,

    /// Measured value.
    pub value: f64,
}

impl SublayerValue {
    /// Returns the key under which this value is stored in the root span's metrics.
    pub fn metric_key(&self) -> String {
        match &self.tag {
            Some(tag) => format!("{}.{}:{}", self.metric, tag.name, tag.value),
            None => self.metric.to_string(),
        }
    }
}

/// A span seen through the statistics lens: the span itself, its weight, and whether it is top-level.
#[derive(Clone, Copy, Debug)]
pub struct WeightedSpan<'a> {
    /// The span.
    pub span: &'a Span,

    /// Number of real spans this span stands for.
    pub weight: f64,

    /// Whether the span is top-level for its service.
    pub top_level: bool,
}

/// A normalized trace, ready for the concentrator and the samplers.
///
/// Once built, a `ProcessedTrace` is shared read-only between downstream stages.
#[derive(Clone, Debug)]
pub struct ProcessedTrace {
    trace: Trace,
    root_idx: usize,
    env: String,
    sublayers: Vec<SublayerValue>,
}

impl ProcessedTrace {
    /// Creates a new `ProcessedTrace`.
    ///
    /// `root_idx` must point at a span of `trace`.
    pub fn new(trace: Trace, root_idx: usize, env: impl Into<String>) -> Self {
        Self {
            trace,
            root_idx,
            env: env.into(),
            sublayers: Vec::new(),
        }
    }

    /// Attaches the sublayer values computed for the root.
    pub fn with_sublayers(mut self, sublayers: Vec<SublayerValue>) -> Self {
        self.sublayers = sublayers;
        self
    }

    /// Returns the trace.
    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    /// Consumes the processed trace, returning the trace.
    pub fn into_trace(self) -> Trace {
        self.trace
    }

    /// Returns the spans.
    pub fn spans(&self) -> &[Span] {
        self.trace.spans()
    }

    /// Returns the index of the root span.
    pub fn root_index(&self) -> usize {
        self.root_idx
    }

    /// Returns the root span.
    pub fn root(&self) -> Option<&Span> {
        self.trace.spans().get(self.root_idx)
    }

    /// Returns the trace ID.
    pub fn trace_id(&self) -> u64 {
        self.root().map(Span::trace_id).unwrap_or_default()
    }

    /// Returns the environment.
    pub fn env(&self) -> &str {
        &self.env
    }

    /// Returns the sublayer values of the root.
    pub fn sublayers(&self) -> &[SublayerValue] {
        &self.sublayers
    }

    /// Returns the weight of the trace, derived from the sample rate recorded on the root.
    pub fn weight(&self) -> f64 {
        self.root().map(Span::weight).unwrap_or(1.0)
    }

    /// Returns the sampling priority set by the tracer, if any.
    pub fn sampling_priority(&self) -> Option<i32> {
        self.root().and_then(Span::sampling_priority)
    }

    /// Returns `true` if any span is flagged as an error.
    pub fn has_error(&self) -> bool {
        self.trace.has_error()
    }

    /// Iterates over the spans with their statistical weight.
    pub fn weighted_spans(&self) -> impl Iterator<Item = WeightedSpan<'_>> {
        let weight = self.weight();
        self.trace.spans().iter().map(move |span| WeightedSpan {
            span,
            weight,
            top_level: span.is_top_level(),
        })
    }
}
