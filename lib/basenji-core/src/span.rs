//! Spans.

use std::fmt;

use basenji_common::collections::FastHashMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DefaultOnNull};

use crate::keys::{SAMPLE_RATE_KEY, SAMPLING_PRIORITY_KEY, TOP_LEVEL_KEY};

/// A span.
///
/// Field names match the JSON objects sent by tracers, so a `Span` can be decoded straight from an intake payload.
#[serde_as]
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Span {
    #[serde(default)]
    service: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    resource: String,
    #[serde(rename = "type", default)]
    type_: String,
    #[serde(default)]
    trace_id: u64,
    #[serde(default)]
    span_id: u64,
    #[serde(default)]
    parent_id: u64,
    #[serde(default)]
    start: i64,
    #[serde(default)]
    duration: i64,
    #[serde(default)]
    error: i32,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    meta: FastHashMap<String, String>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    metrics: FastHashMap<String, f64>,
}

impl Span {
    /// Creates a new `Span` with the given identity, timing, and error status.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        service: impl Into<String>, name: impl Into<String>, resource: impl Into<String>, type_: impl Into<String>,
        trace_id: u64, span_id: u64, parent_id: u64, start: i64, duration: i64, error: i32,
    ) -> Self {
        Self {
            service: service.into(),
            name: name.into(),
            resource: resource.into(),
            type_: type_.into(),
            trace_id,
            span_id,
            parent_id,
            start,
            duration,
            error,
            meta: FastHashMap::default(),
            metrics: FastHashMap::default(),
        }
    }

    /// Sets the service name.
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    /// Sets the operation name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the resource name.
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    /// Sets the span type.
    pub fn with_type(mut self, type_: impl Into<String>) -> Self {
        self.type_ = type_.into();
        self
    }

    /// Sets the trace ID.
    pub fn with_trace_id(mut self, trace_id: u64) -> Self {
        self.trace_id = trace_id;
        self
    }

    /// Sets the span ID.
    pub fn with_span_id(mut self, span_id: u64) -> Self {
        self.span_id = span_id;
        self
    }

    /// Sets the parent span ID.
    pub fn with_parent_id(mut self, parent_id: u64) -> Self {
        self.parent_id = parent_id;
        self
    }

    /// Sets the start timestamp, in nanoseconds since the Unix epoch.
    pub fn with_start(mut self, start: i64) -> Self {
        self.start = start;
        self
    }

    /// Sets the duration, in nanoseconds.
    pub fn with_duration(mut self, duration: i64) -> Self {
        self.duration = duration;
        self
    }

    /// Sets the error status.
    pub fn with_error(mut self, error: i32) -> Self {
        self.error = error;
        self
    }

    /// Adds a tag.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Adds a metric.
    pub fn with_metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }

    /// Returns the service name.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Returns the operation name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the resource name.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Returns the span type.
    pub fn type_(&self) -> &str {
        &self.type_
    }

    /// Returns the trace ID.
    pub fn trace_id(&self) -> u64 {
        self.trace_id
    }

    /// Returns the span ID.
    pub fn span_id(&self) -> u64 {
        self.span_id
    }

    /// Returns the parent span ID. Zero means the span has no parent.
    pub fn parent_id(&self) -> u64 {
        self.parent_id
    }

    /// Returns the start timestamp, in nanoseconds since the Unix epoch.
    pub fn start(&self) -> i64 {
        self.start
    }

    /// Returns the duration, in nanoseconds.
    pub fn duration(&self) -> i64 {
        self.duration
    }

    /// Returns the end timestamp, in nanoseconds since the Unix epoch.
    pub fn end(&self) -> i64 {
        self.start.saturating_add(self.duration)
    }

    /// Returns the error status.
    pub fn error(&self) -> i32 {
        self.error
    }

    /// Returns `true` if the span is flagged as an error.
    pub fn is_error(&self) -> bool {
        self.error != 0
    }

    /// Returns the tags.
    pub fn meta(&self) -> &FastHashMap<String, String> {
        &self.meta
    }

    /// Returns the metrics.
    pub fn metrics(&self) -> &FastHashMap<String, f64> {
        &self.metrics
    }

    /// Returns a mutable reference to the tags.
    pub fn meta_mut(&mut self) -> &mut FastHashMap<String, String> {
        &mut self.meta
    }

    /// Returns a mutable reference to the metrics.
    pub fn metrics_mut(&mut self) -> &mut FastHashMap<String, f64> {
        &mut self.metrics
    }

    /// Replaces the service name.
    pub fn set_service(&mut self, service: String) {
        self.service = service;
    }

    /// Replaces the operation name.
    pub fn set_name(&mut self, name: String) {
        self.name = name;
    }

    /// Replaces the resource name.
    pub fn set_resource(&mut self, resource: String) {
        self.resource = resource;
    }

    /// Replaces the span type.
    pub fn set_type(&mut self, type_: String) {
        self.type_ = type_;
    }

    /// Replaces the span ID.
    pub fn set_span_id(&mut self, span_id: u64) {
        self.span_id = span_id;
    }

    /// Replaces the parent span ID.
    pub fn set_parent_id(&mut self, parent_id: u64) {
        self.parent_id = parent_id;
    }

    /// Replaces the start timestamp.
    pub fn set_start(&mut self, start: i64) {
        self.start = start;
    }

    /// Replaces the duration.
    pub fn set_duration(&mut self, duration: i64) {
        self.duration = duration;
    }

    /// Returns the sampling priority set by the tracer, if any.
    pub fn sampling_priority(&self) -> Option<i32> {
        self.metrics.get(SAMPLING_PRIORITY_KEY).map(|&p| p as i32)
    }

    /// Returns the sample rate applied to the trace so far, defaulting to `1.0`.
    pub fn sample_rate(&self) -> f64 {
        self.metrics.get(SAMPLE_RATE_KEY).copied().unwrap_or(1.0)
    }

    /// Returns the statistical weight of the span: the inverse of its sample rate.
    ///
    /// Rates outside `(0, 1]` are ignored and yield a weight of `1.0`.
    pub fn weight(&self) -> f64 {
        match self.metrics.get(SAMPLE_RATE_KEY) {
            Some(&rate) if rate > 0.0 && rate <= 1.0 => 1.0 / rate,
            _ => 1.0,
        }
    }

    /// Returns `true` if the span is marked as top-level for its service.
    pub fn is_top_level(&self) -> bool {
        self.metrics.get(TOP_LEVEL_KEY).is_some_and(|&v| v == 1.0)
    }

    /// Marks or unmarks the span as top-level.
    pub fn set_top_level(&mut self, top_level: bool) {
        if top_level {
            self.metrics.insert(TOP_LEVEL_KEY.to_string(), 1.0);
        } else {
            self.metrics.remove(TOP_LEVEL_KEY);
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Span[t_id:{},s_id:{},p_id:{},ser:{},name:{},res:{}]",
            self.trace_id, self.span_id, self.parent_id, self.service, self.name, self.resource
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_from_sample_rate() {
        assert_eq!(Span::default().weight(), 1.0);
        assert_eq!(Span::default().with_metric(SAMPLE_RATE_KEY, 0.25).weight(), 4.0);
        assert_eq!(Span::default().with_metric(SAMPLE_RATE_KEY, 1.0).weight(), 1.0);
        assert_eq!(Span::default().with_metric(SAMPLE_RATE_KEY, 0.0).weight(), 1.0);
        assert_eq!(Span::default().with_metric(SAMPLE_RATE_KEY, -1.0).weight(), 1.0);
        assert_eq!(Span::default().with_metric(SAMPLE_RATE_KEY, 1.5).weight(), 1.0);
    }

    #[test]
    fn top_level_flag() {
        let mut span = Span::default();
        assert!(!span.is_top_level());
        span.set_top_level(true);
        assert!(span.is_top_level());
        span.set_top_level(false);
        assert!(!span.is_top_level());
        assert!(span.metrics().is_empty());
    }

    #[test]
    fn decodes_tracer_json() {
        let raw = r#"{
            "service": "web", "name": "http.request", "resource": "GET /x", "type": "http",
            "trace_id": 42, "span_id": 7, "parent_id": 0, "start": 1000, "duration": 250, "error": 1,
            "meta": {"env": "prod"}, "metrics": {"_sampling_priority_v1": 2}
        }"#;
        let span: Span = serde_json::from_str(raw).unwrap();

        assert_eq!(span.type_(), "http");
        assert_eq!(span.end(), 1250);
        assert!(span.is_error());
        assert_eq!(span.meta().get("env").map(String::as_str), Some("prod"));
        assert_eq!(span.sampling_priority(), Some(2));
    }

    #[test]
    fn decodes_sparse_json() {
        let span: Span = serde_json::from_str(r#"{"trace_id": 1, "span_id": 2, "meta": null}"#).unwrap();
        assert_eq!(span.service(), "");
        assert_eq!(span.sampling_priority(), None);
        assert_eq!(span.sample_rate(), 1.0);
    }
}
