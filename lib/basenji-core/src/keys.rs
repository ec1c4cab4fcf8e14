//! Well-known span tag and metric keys.

/// Root metric holding the sampling priority chosen by the tracer.
pub const SAMPLING_PRIORITY_KEY: &str = "_sampling_priority_v1";

/// Root metric holding the product of every sample rate applied to the trace so far.
pub const SAMPLE_RATE_KEY: &str = "_sample_rate";

/// Metric set to `1` on spans that are top-level for their service.
pub const TOP_LEVEL_KEY: &str = "_top_level";

/// Tag holding the environment a span was emitted from.
pub const ENV_KEY: &str = "env";

/// Prefix shared by every sublayer metric.
pub const SUBLAYER_PREFIX: &str = "_sublayers";

/// Sublayer metric holding the number of spans in the trace.
pub const SUBLAYER_SPAN_COUNT: &str = "_sublayers.span_count";

/// Sublayer metric holding per-type exclusive durations.
pub const SUBLAYER_DURATION_BY_TYPE: &str = "_sublayers.duration.by_type";

/// Sublayer metric holding per-service exclusive durations.
pub const SUBLAYER_DURATION_BY_SERVICE: &str = "_sublayers.duration.by_service";

/// Tag name used for per-type sublayer values.
pub const SUBLAYER_TYPE_TAG: &str = "sublayer_type";

/// Tag name used for per-service sublayer values.
pub const SUBLAYER_SERVICE_TAG: &str = "sublayer_service";
