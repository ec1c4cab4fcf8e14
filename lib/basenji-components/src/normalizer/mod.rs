//! Trace normalization.
//!
//! The normalizer turns a trace as sent by a tracer into a [`ProcessedTrace`]: it rejects traces that cannot be
//! repaired, fixes up identifiers, timestamps and string fields that can be, applies the resource blacklist, tag
//! replacement rules and obfuscation, and finally derives top-level flags, the trace environment and sublayer metrics.
//! Normalizing an already normalized trace leaves it unchanged.

use std::time::Duration;

use basenji_common::{collections::FastHashSet, time::duration_to_nanos};
use basenji_config::GenericConfiguration;
use basenji_core::{keys::SAMPLE_RATE_KEY, ProcessedTrace, Span, Trace};
use basenji_error::{generic_error, GenericError};
use metrics::counter;
use serde::Deserialize;
use snafu::{ensure, OptionExt as _, Snafu};
use tracing::debug;

use crate::filters::{ReplaceRuleConfig, ResourceFilter, TagReplacer};
use crate::obfuscation::{ObfuscationConfig, Obfuscator};
use crate::sublayers::{compute_sublayers, set_sublayers_on_span};

mod fields;
use self::fields::{
    exceeds, normalize_name, normalize_service, truncate_utf8, MAX_META_KEY_LEN, MAX_META_VALUE_LEN, MAX_METRICS_KEY_LEN,
    MAX_RESOURCE_LEN, MAX_TYPE_LEN,
};

/// 2000-01-01T00:00:00Z, in nanoseconds. Spans starting earlier carry a bogus timestamp.
const YEAR_2000_NANOS: i64 = 946_684_800_000_000_000;

/// How far in the future a span may start before its start is clamped to the current time.
const MAX_FUTURE_SKEW_NANOS: i64 = 5 * 60 * 1_000_000_000;

const fn default_bucket_interval_secs() -> f64 {
    10.0
}

fn default_env() -> String {
    "none".to_string()
}

/// A trace normalization error.
#[derive(Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum NormalizeError {
    /// The trace held no spans.
    #[snafu(display("Trace is empty."))]
    EmptyTrace,

    /// Spans of the trace referenced different trace IDs.
    #[snafu(display("Span belongs to trace {} instead of trace {}.", found, expected))]
    TraceIdMismatch {
        /// Trace ID of the first span.
        expected: u64,

        /// Conflicting trace ID.
        found: u64,
    },

    /// No span qualified as the root of the trace.
    #[snafu(display("Trace {} has no root span.", trace_id))]
    MissingRoot {
        /// Trace ID.
        trace_id: u64,
    },

    /// A span started before any plausible time.
    #[snafu(display("Span {} has an invalid start timestamp ({}).", span_id, start))]
    InvalidTimestamp {
        /// Span ID.
        span_id: u64,

        /// Start timestamp, in nanoseconds.
        start: i64,
    },

    /// The root span ended before the oldest bucket the concentrator still accepts.
    #[snafu(display("Trace {} ended at {}, before the cutoff at {}.", trace_id, end, cutoff))]
    TraceTooOld {
        /// Trace ID.
        trace_id: u64,

        /// End timestamp of the root, in nanoseconds.
        end: i64,

        /// Oldest accepted end timestamp, in nanoseconds.
        cutoff: i64,
    },

    /// The root resource matched the resource blacklist.
    #[snafu(display("Trace with root resource '{}' was filtered out.", resource))]
    TraceFiltered {
        /// Root resource.
        resource: String,
    },
}

impl NormalizeError {
    /// Returns a short, stable identifier of the error kind, suitable as a metric label.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::EmptyTrace => "empty_trace",
            Self::TraceIdMismatch { .. } => "trace_id_mismatch",
            Self::MissingRoot { .. } => "missing_root",
            Self::InvalidTimestamp { .. } => "invalid_timestamp",
            Self::TraceTooOld { .. } => "trace_too_old",
            Self::TraceFiltered { .. } => "trace_filtered",
        }
    }
}

/// Normalizer configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NormalizerConfiguration {
    /// Environment of traces that do not carry an `env` tag.
    ///
    /// Defaults to `none`.
    default_env: String,

    /// Width of a concentrator bucket, in seconds.
    ///
    /// Defaults to 10 seconds.
    #[serde(rename = "bucket_interval")]
    bucket_interval_secs: f64,

    /// How old the end of a root span may be, in seconds, before its trace is rejected.
    ///
    /// Defaults to twice the bucket interval.
    #[serde(rename = "oldest_span_cutoff")]
    oldest_span_cutoff_secs: Option<f64>,

    /// Patterns matched against root resources. Matching traces are dropped.
    ///
    /// Defaults to no patterns.
    resource_blacklist: Vec<String>,

    /// Tag replacement rules, applied in order before obfuscation.
    ///
    /// Defaults to no rules.
    replace_tags: Vec<ReplaceRuleConfig>,

    /// Obfuscation settings.
    obfuscation: ObfuscationConfig,
}

impl Default for NormalizerConfiguration {
    fn default() -> Self {
        Self {
            default_env: default_env(),
            bucket_interval_secs: default_bucket_interval_secs(),
            oldest_span_cutoff_secs: None,
            resource_blacklist: Vec::new(),
            replace_tags: Vec::new(),
            obfuscation: ObfuscationConfig::default(),
        }
    }
}

impl NormalizerConfiguration {
    /// Creates a new `NormalizerConfiguration` from the given configuration.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed()?)
    }

    /// Sets the default environment.
    pub fn with_default_env(mut self, env: impl Into<String>) -> Self {
        self.default_env = env.into();
        self
    }

    /// Sets the resource blacklist.
    pub fn with_resource_blacklist<S: Into<String>>(mut self, patterns: impl IntoIterator<Item = S>) -> Self {
        self.resource_blacklist = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the tag replacement rules.
    pub fn with_replace_tags(mut self, rules: Vec<ReplaceRuleConfig>) -> Self {
        self.replace_tags = rules;
        self
    }

    /// Sets the obfuscation settings.
    pub fn with_obfuscation(mut self, obfuscation: ObfuscationConfig) -> Self {
        self.obfuscation = obfuscation;
        self
    }

    /// Returns the oldest age of a root span end that is still accepted.
    pub fn oldest_span_cutoff(&self) -> Duration {
        let secs = self.oldest_span_cutoff_secs.unwrap_or(2.0 * self.bucket_interval_secs);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
    }

    /// Builds a `Normalizer` from this configuration.
    ///
    /// # Errors
    ///
    /// If the bucket interval is not positive, or a tag replacement rule is invalid, an error is returned.
    pub fn build(&self) -> Result<Normalizer, GenericError> {
        if self.bucket_interval_secs.is_nan() || self.bucket_interval_secs <= 0.0 {
            return Err(generic_error!(
                "bucket_interval must be positive, got {}",
                self.bucket_interval_secs
            ));
        }

        Ok(Normalizer {
            default_env: self.default_env.clone(),
            oldest_span_cutoff: duration_to_nanos(self.oldest_span_cutoff()),
            resource_filter: ResourceFilter::new(&self.resource_blacklist),
            tag_replacer: TagReplacer::new(&self.replace_tags)?,
            obfuscator: Obfuscator::new(self.obfuscation.clone()),
        })
    }
}

/// Validates, repairs and enriches traces.
pub struct Normalizer {
    default_env: String,
    oldest_span_cutoff: i64,
    resource_filter: ResourceFilter,
    tag_replacer: TagReplacer,
    obfuscator: Obfuscator,
}

impl Normalizer {
    /// Normalizes a trace received at `now` (Unix nanoseconds).
    ///
    /// `presampler_rate` is the rate the pre-sampler was admitting payloads at when the trace arrived; it is folded
    /// into the sample rate recorded on the root so that statistics stay weighted correctly.
    ///
    /// # Errors
    ///
    /// If the trace is invalid, too old, or filtered out, an error is returned and the rejection is counted.
    pub fn process(&self, trace: Trace, now: i64, presampler_rate: f64) -> Result<ProcessedTrace, NormalizeError> {
        let result = self.normalize(trace, now, presampler_rate);
        if let Err(e) = &result {
            counter!("normalizer_traces_rejected_total", "reason" => e.reason()).increment(1);
            debug!(error = %e, "Rejected trace.");
        }
        result
    }

    fn normalize(&self, mut trace: Trace, now: i64, presampler_rate: f64) -> Result<ProcessedTrace, NormalizeError> {
        let trace_id = trace.spans().first().context(EmptyTrace)?.trace_id();
        if let Some(span) = trace.spans().iter().find(|span| span.trace_id() != trace_id) {
            return TraceIdMismatch {
                expected: trace_id,
                found: span.trace_id(),
            }
            .fail();
        }

        for span in trace.spans_mut() {
            if span.span_id() == 0 {
                span.set_span_id(rand::random::<u64>().max(1));
                counter!("normalizer_spans_fixed_total", "field" => "span_id").increment(1);
            }
            if span.parent_id() == span.trace_id() && span.parent_id() == span.span_id() {
                span.set_parent_id(0);
            }
        }

        let root_idx = trace.root_index().context(MissingRoot { trace_id })?;
        attach_orphans(&mut trace, root_idx);

        for span in trace.spans_mut() {
            normalize_timestamps(span, now)?;
        }

        let root = &trace.spans()[root_idx];
        let cutoff = now.saturating_sub(self.oldest_span_cutoff);
        ensure!(
            root.end() >= cutoff,
            TraceTooOld {
                trace_id,
                end: root.end(),
                cutoff,
            }
        );

        for span in trace.spans_mut() {
            normalize_fields(span);
        }

        let root_resource = trace.spans()[root_idx].resource();
        ensure!(
            self.resource_filter.keep(root_resource),
            TraceFiltered {
                resource: root_resource.to_string(),
            }
        );

        self.tag_replacer.replace(&mut trace);
        for span in trace.spans_mut() {
            self.obfuscator.obfuscate_span(span);
        }

        if presampler_rate > 0.0 && presampler_rate < 1.0 {
            let root = &mut trace.spans_mut()[root_idx];
            let rate = root.sample_rate() * presampler_rate;
            root.metrics_mut().insert(SAMPLE_RATE_KEY.to_string(), rate);
        }

        trace.compute_top_level();
        let env = trace
            .env(root_idx)
            .filter(|env| !env.is_empty())
            .unwrap_or(self.default_env.as_str())
            .to_string();

        let sublayers = compute_sublayers(&trace, root_idx);
        set_sublayers_on_span(&mut trace.spans_mut()[root_idx], &sublayers);

        Ok(ProcessedTrace::new(trace, root_idx, env).with_sublayers(sublayers))
    }
}

/// Makes the root the only span without a known parent.
///
/// Every other span whose parent is missing is re-attached under the root.
fn attach_orphans(trace: &mut Trace, root_idx: usize) {
    let span_ids: FastHashSet<u64> = trace.spans().iter().map(Span::span_id).collect();
    let root_span_id = trace.spans()[root_idx].span_id();

    for (idx, span) in trace.spans_mut().iter_mut().enumerate() {
        let orphan = span.parent_id() == 0 || !span_ids.contains(&span.parent_id());
        if !orphan {
            continue;
        }
        if idx == root_idx {
            span.set_parent_id(0);
        } else {
            span.set_parent_id(root_span_id);
        }
    }
}

fn normalize_timestamps(span: &mut Span, now: i64) -> Result<(), NormalizeError> {
    ensure!(
        span.start() >= YEAR_2000_NANOS,
        InvalidTimestamp {
            span_id: span.span_id(),
            start: span.start(),
        }
    );

    if span.start() > now.saturating_add(MAX_FUTURE_SKEW_NANOS) {
        debug!(span_id = span.span_id(), start = span.start(), "Span starts in the future. Clamping to now.");
        counter!("normalizer_spans_fixed_total", "field" => "start").increment(1);
        span.set_start(now);
    }

    if span.duration() < 0 {
        debug!(span_id = span.span_id(), duration = span.duration(), "Span has a negative duration. Resetting to 0.");
        counter!("normalizer_spans_fixed_total", "field" => "duration").increment(1);
        span.set_duration(0);
    }

    Ok(())
}

fn normalize_fields(span: &mut Span) {
    let service = normalize_service(span.service());
    if service != span.service() {
        counter!("normalizer_spans_fixed_total", "field" => "service").increment(1);
        span.set_service(service);
    }

    let name = normalize_name(span.name());
    if name != span.name() {
        counter!("normalizer_spans_fixed_total", "field" => "name").increment(1);
        span.set_name(name);
    }

    if span.resource().is_empty() {
        counter!("normalizer_spans_fixed_total", "field" => "resource").increment(1);
        let name = span.name().to_string();
        span.set_resource(name);
    } else if exceeds(span.resource(), MAX_RESOURCE_LEN) {
        counter!("normalizer_spans_truncated_total", "field" => "resource").increment(1);
        let resource = truncate_utf8(span.resource(), MAX_RESOURCE_LEN).to_string();
        span.set_resource(resource);
    }

    if exceeds(span.type_(), MAX_TYPE_LEN) {
        counter!("normalizer_spans_truncated_total", "field" => "type").increment(1);
        let type_ = truncate_utf8(span.type_(), MAX_TYPE_LEN).to_string();
        span.set_type(type_);
    }

    let meta = span.meta_mut();
    let meta_len = meta.len();
    meta.retain(|key, _| !exceeds(key, MAX_META_KEY_LEN));
    let dropped_meta = meta_len - meta.len();
    let mut truncated_meta = 0;
    for value in meta.values_mut() {
        if exceeds(value, MAX_META_VALUE_LEN) {
            let end = truncate_utf8(value, MAX_META_VALUE_LEN).len();
            value.truncate(end);
            truncated_meta += 1;
        }
    }

    let metrics = span.metrics_mut();
    let metrics_len = metrics.len();
    metrics.retain(|key, _| !exceeds(key, MAX_METRICS_KEY_LEN));
    let dropped_metrics = metrics_len - metrics.len();

    if dropped_meta + truncated_meta + dropped_metrics > 0 {
        counter!("normalizer_spans_truncated_total", "field" => "meta").increment((dropped_meta + truncated_meta) as u64);
        counter!("normalizer_spans_truncated_total", "field" => "metrics").increment(dropped_metrics as u64);
    }
}
