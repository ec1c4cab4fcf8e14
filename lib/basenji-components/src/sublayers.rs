//! Sublayer derivation.
//!
//! Sublayers describe how the wall-clock time of a trace splits between span types and between services. The trace
//! is walked level by level from the root; each span carves its own interval out of the interval of the enclosing
//! span, so that every nanosecond of the root is attributed to exactly one type and one service.

use std::collections::BTreeMap;

use basenji_common::collections::{FastHashMap, FastHashSet};
use basenji_core::{
    keys::{
        SUBLAYER_DURATION_BY_SERVICE, SUBLAYER_DURATION_BY_TYPE, SUBLAYER_SERVICE_TAG, SUBLAYER_SPAN_COUNT,
        SUBLAYER_TYPE_TAG,
    },
    Span, SublayerValue, Tag, Trace,
};

#[derive(Clone, Debug, PartialEq)]
struct TimeSpan<'a> {
    name: &'a str,
    start: i64,
    duration: i64,
}

impl TimeSpan<'_> {
    fn end(&self) -> i64 {
        self.start + self.duration
    }
}

/// Carves `ts` out of the first recorded interval that fully contains it.
///
/// Intervals that fit nowhere are ignored, as are intervals nested inside an interval with the same name.
fn insert_time_span<'a>(spans: &mut Vec<TimeSpan<'a>>, ts: TimeSpan<'a>) {
    if ts.name.is_empty() {
        return;
    }

    if spans.is_empty() {
        spans.push(ts);
        return;
    }

    let Some(idx) = spans.iter().position(|o| o.start <= ts.start && o.end() >= ts.end()) else {
        return;
    };

    let outer = spans[idx].clone();
    if outer.name == ts.name {
        return;
    }

    let head = TimeSpan {
        name: outer.name,
        start: outer.start,
        duration: ts.start - outer.start,
    };
    let tail = TimeSpan {
        name: outer.name,
        start: ts.end(),
        duration: outer.end() - ts.end(),
    };
    spans.splice(idx..=idx, [head, ts, tail]);
}

#[derive(Default)]
struct SublayerSpans<'a> {
    by_type: Vec<TimeSpan<'a>>,
    by_service: Vec<TimeSpan<'a>>,
}

impl<'a> SublayerSpans<'a> {
    fn add(&mut self, span: &'a Span) {
        insert_time_span(
            &mut self.by_type,
            TimeSpan {
                name: span.type_(),
                start: span.start(),
                duration: span.duration(),
            },
        );
        insert_time_span(
            &mut self.by_service,
            TimeSpan {
                name: span.service(),
                start: span.start(),
                duration: span.duration(),
            },
        );
    }

    fn into_values(self) -> Vec<SublayerValue> {
        let mut by_type = BTreeMap::<&str, f64>::new();
        for ts in &self.by_type {
            *by_type.entry(ts.name).or_default() += ts.duration as f64;
        }
        let mut by_service = BTreeMap::<&str, f64>::new();
        for ts in &self.by_service {
            *by_service.entry(ts.name).or_default() += ts.duration as f64;
        }

        let mut values = Vec::with_capacity(by_type.len() + by_service.len() + 1);
        values.extend(by_type.into_iter().map(|(name, value)| SublayerValue {
            metric: SUBLAYER_DURATION_BY_TYPE,
            tag: Some(Tag::new(SUBLAYER_TYPE_TAG, name)),
            value,
        }));
        values.extend(by_service.into_iter().map(|(name, value)| SublayerValue {
            metric: SUBLAYER_DURATION_BY_SERVICE,
            tag: Some(Tag::new(SUBLAYER_SERVICE_TAG, name)),
            value,
        }));
        values
    }
}

/// Returns the indexes of the spans of `trace`, level by level, starting at the root.
///
/// Spans that cannot be reached from the root are not returned.
fn levels(trace: &Trace, root_idx: usize) -> Vec<usize> {
    let spans = trace.spans();
    let mut children: FastHashMap<u64, Vec<usize>> = FastHashMap::default();
    for (idx, span) in spans.iter().enumerate() {
        if idx != root_idx {
            children.entry(span.parent_id()).or_default().push(idx);
        }
    }

    let mut order = Vec::with_capacity(spans.len());
    let mut seen = FastHashSet::default();
    let mut level = vec![root_idx];
    seen.insert(root_idx);
    while !level.is_empty() {
        order.extend_from_slice(&level);
        let mut next = Vec::new();
        for idx in level {
            if let Some(kids) = children.get(&spans[idx].span_id()) {
                next.extend(kids.iter().copied().filter(|kid| seen.insert(*kid)));
            }
        }
        next.sort_unstable();
        level = next;
    }
    order
}

/// Computes the sublayer values of a trace: exclusive durations by type and by service, plus the span count.
///
/// Returns an empty list if `root_idx` is out of bounds.
pub fn compute_sublayers(trace: &Trace, root_idx: usize) -> Vec<SublayerValue> {
    if root_idx >= trace.len() {
        return Vec::new();
    }

    let mut sublayer_spans = SublayerSpans::default();
    for idx in levels(trace, root_idx) {
        sublayer_spans.add(&trace.spans()[idx]);
    }

    let mut values = sublayer_spans.into_values();
    values.push(SublayerValue {
        metric: SUBLAYER_SPAN_COUNT,
        tag: None,
        value: trace.len() as f64,
    });
    values
}

/// Stores sublayer values in the metrics of `span`.
pub fn set_sublayers_on_span(span: &mut Span, values: &[SublayerValue]) {
    let metrics = span.metrics_mut();
    for value in values {
        metrics.insert(value.metric_key(), value.value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(span_id: u64, parent_id: u64, start: i64, duration: i64, service: &str, type_: &str) -> Span {
        Span::new(service, "op", "res", type_, 1, span_id, parent_id, start, duration, 0)
    }

    fn as_map(values: &[SublayerValue]) -> FastHashMap<String, f64> {
        values.iter().map(|v| (v.metric_key(), v.value)).collect()
    }

    #[test]
    fn nested_sublayers() {
        let now = 1_500_000_000_000_000_000;
        let trace = Trace::new(vec![
            span(1, 0, now + 42, 1_000_000_000, "mcnulty", "web"),
            span(2, 1, now + 100, 200_000_000, "mcnulty", "sql"),
            span(3, 2, now + 150, 199_999_000, "master-db", "sql"),
            span(4, 1, now + 500_000_000, 500_000, "redis", "redis"),
            span(5, 1, now + 700_000_000, 700_000, "mcnulty", ""),
        ]);

        let values = as_map(&compute_sublayers(&trace, 0));
        let expected: FastHashMap<String, f64> = [
            ("_sublayers.span_count", 5.0),
            ("_sublayers.duration.by_type.sublayer_type:web", 1e9 - 2e8 - 5e5),
            ("_sublayers.duration.by_type.sublayer_type:sql", 2e8),
            ("_sublayers.duration.by_type.sublayer_type:redis", 5e5),
            ("_sublayers.duration.by_service.sublayer_service:mcnulty", 1e9 - 199_999_000.0 - 5e5),
            ("_sublayers.duration.by_service.sublayer_service:master-db", 199_999_000.0),
            ("_sublayers.duration.by_service.sublayer_service:redis", 5e5),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        assert_eq!(values, expected);
    }

    #[test]
    fn sublayers_pinned_on_root() {
        let mut trace = Trace::new(vec![
            span(1, 0, 0, 100, "web", "web"),
            span(2, 1, 10, 20, "db", "sql"),
        ]);
        let values = compute_sublayers(&trace, 0);
        set_sublayers_on_span(&mut trace.spans_mut()[0], &values);

        let root = &trace.spans()[0];
        assert_eq!(root.metrics().get(SUBLAYER_SPAN_COUNT), Some(&2.0));
        assert_eq!(
            root.metrics().get("_sublayers.duration.by_type.sublayer_type:web"),
            Some(&80.0)
        );
        assert_eq!(
            root.metrics().get("_sublayers.duration.by_service.sublayer_service:db"),
            Some(&20.0)
        );
    }

    #[test]
    fn by_type_never_exceeds_root_duration() {
        let trace = Trace::new(vec![
            span(1, 0, 0, 100, "web", "web"),
            span(2, 1, 50, 200, "db", "sql"),
            span(3, 1, -20, 30, "cache", "redis"),
            span(4, 1, 10, 20, "db", "sql"),
        ]);

        let values = compute_sublayers(&trace, 0);
        let total: f64 = values
            .iter()
            .filter(|v| v.metric == SUBLAYER_DURATION_BY_TYPE)
            .map(|v| v.value)
            .sum();
        assert!(total <= 100.0);
    }

    #[test]
    fn out_of_bounds_root() {
        assert!(compute_sublayers(&Trace::default(), 0).is_empty());
    }
}
