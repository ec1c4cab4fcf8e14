//! Aggregated statistics, as flushed by the concentrator.

use std::fmt;

use basenji_common::collections::FastHashMap;
use gk_sketch::Summary;
use serde::{Deserialize, Serialize, Serializer};

/// Measure counting hits.
pub const HITS: &str = "hits";

/// Measure counting errors.
pub const ERRORS: &str = "errors";

/// Measure summing durations.
pub const DURATION: &str = "duration";

/// A `name:value` tag.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Tag {
    /// Tag name.
    pub name: String,

    /// Tag value.
    pub value: String,
}

impl Tag {
    /// Creates a new `Tag`.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.value)
    }
}

/// An ordered list of tags.
pub type TagSet = Vec<Tag>;

/// Builds the canonical `name|measure|aggregation` key of a statistic.
pub fn grain_key(name: &str, measure: &str, aggr: &str) -> String {
    let mut key = String::with_capacity(name.len() + measure.len() + aggr.len() + 2);
    key.push_str(name);
    key.push('|');
    key.push_str(measure);
    key.push('|');
    key.push_str(aggr);
    key
}

/// A counter statistic.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Count {
    /// Grain key, see [`grain_key`].
    pub key: String,

    /// Operation name.
    pub name: String,

    /// Measure being counted: hits, errors, duration, or a sublayer metric.
    pub measure: String,

    /// Tags the count is aggregated on.
    #[serde(rename = "tagset")]
    pub tag_set: TagSet,

    /// Number of top-level spans that contributed.
    #[serde(rename = "toplevel")]
    pub top_level: i64,

    /// Accumulated value.
    pub value: f64,
}

/// A distribution statistic over span durations.
///
/// Serialized as the weighted slices of its summary, which is the only representation the intake reads.
#[derive(Clone, Debug, Serialize)]
pub struct Distribution {
    /// Grain key, see [`grain_key`].
    pub key: String,

    /// Operation name.
    pub name: String,

    /// Measure being distributed.
    pub measure: String,

    /// Tags the distribution is aggregated on.
    #[serde(rename = "tagset")]
    pub tag_set: TagSet,

    /// Number of top-level spans that contributed.
    #[serde(rename = "toplevel")]
    pub top_level: i64,

    /// Quantile summary of the values.
    #[serde(serialize_with = "serialize_slices")]
    pub summary: Summary,
}

fn serialize_slices<S: Serializer>(summary: &Summary, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(summary.by_slices())
}

/// Statistics for one time bucket.
#[derive(Clone, Debug, Default, Serialize)]
pub struct StatsBucket {
    /// Bucket start, in nanoseconds since the Unix epoch.
    pub start: i64,

    /// Bucket width, in nanoseconds.
    pub duration: i64,

    /// Counts by grain key.
    pub counts: FastHashMap<String, Count>,

    /// Distributions by grain key.
    pub distributions: FastHashMap<String, Distribution>,
}

impl StatsBucket {
    /// Creates a new, empty `StatsBucket`.
    pub fn new(start: i64, duration: i64) -> Self {
        Self {
            start,
            duration,
            counts: FastHashMap::default(),
            distributions: FastHashMap::default(),
        }
    }

    /// Returns `true` if the bucket holds no statistics.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty() && self.distributions.is_empty()
    }
}

/// Statistics payload sent to the intake.
#[derive(Clone, Debug, Serialize)]
pub struct StatsPayload {
    /// Hostname of the agent.
    #[serde(rename = "hostname")]
    pub host_name: String,

    /// Default environment of the agent.
    pub env: String,

    /// Flushed buckets.
    pub stats: Vec<StatsBucket>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grain_key_layout() {
        assert_eq!(
            grain_key("serve", DURATION, "service:webserver"),
            "serve|duration|service:webserver"
        );
    }

    #[test]
    fn distribution_serializes_as_slices() {
        let mut summary = Summary::new();
        for v in [1.0, 2.0, 3.0] {
            summary.insert(v, 0);
        }
        let distribution = Distribution {
            key: grain_key("op", DURATION, "env:none"),
            name: "op".to_string(),
            measure: DURATION.to_string(),
            tag_set: vec![Tag::new("env", "none")],
            top_level: 1,
            summary,
        };

        let value = serde_json::to_value(&distribution).unwrap();
        let slices = value["summary"].as_array().unwrap();
        assert!(!slices.is_empty());
        let total: u64 = slices.iter().map(|s| s["weight"].as_u64().unwrap()).sum();
        assert_eq!(total, 3);
        assert_eq!(value["tagset"][0]["name"], "env");
    }
}
