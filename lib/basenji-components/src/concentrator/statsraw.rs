use basenji_common::collections::FastHashMap;
use basenji_core::{
    grain_key,
    stats::{DURATION, ERRORS, HITS},
    Count, Distribution, StatsBucket, SublayerValue, Tag, TagSet, WeightedSpan,
};
use gk_sketch::Summary;
use tracing::error;

/// Values at or below this are kept at full precision; larger ones keep 10 significant bits.
const ROUND_MASK: i64 = 1 << 10;

struct GroupedStats {
    tags: TagSet,
    top_level: i64,
    hits: f64,
    errors: f64,
    duration: f64,
    distribution: Summary,
}

impl GroupedStats {
    fn new(tags: TagSet) -> Self {
        Self {
            tags,
            top_level: 0,
            hits: 0.0,
            errors: 0.0,
            duration: 0.0,
            distribution: Summary::new(),
        }
    }
}

struct SublayerStats {
    tags: TagSet,
    top_level: i64,
    value: f64,
}

#[derive(Eq, Hash, PartialEq)]
struct StatsKey {
    name: String,
    aggr: String,
}

#[derive(Eq, Hash, PartialEq)]
struct SublayerKey {
    name: String,
    measure: &'static str,
    aggr: String,
}

/// Statistics of a single time bucket, while it is still open.
pub struct RawBucket {
    start: i64,
    duration: i64,
    data: FastHashMap<StatsKey, GroupedStats>,
    sublayer_data: FastHashMap<SublayerKey, SublayerStats>,
}

impl RawBucket {
    pub fn new(start: i64, duration: i64) -> Self {
        Self {
            start,
            duration,
            data: FastHashMap::default(),
            sublayer_data: FastHashMap::default(),
        }
    }

    /// Adds a span to the bucket, aggregated on `env`, its resource and service, and the `aggregators` tags it carries.
    ///
    /// `aggregators` must be sorted. Sublayer values are only given for the root span.
    pub fn handle_span(
        &mut self, weighted: &WeightedSpan<'_>, env: &str, aggregators: &[String], sublayers: Option<&[SublayerValue]>,
    ) {
        if env.is_empty() {
            error!(span_id = weighted.span.span_id(), "Span has no environment, skipping.");
            return;
        }

        let (aggr, tags) = assemble_grain(weighted, env, aggregators);
        self.add(weighted, &aggr, &tags);

        for sublayer in sublayers.unwrap_or_default() {
            self.add_sublayer(weighted, &aggr, &tags, sublayer);
        }
    }

    fn add(&mut self, weighted: &WeightedSpan<'_>, aggr: &str, tags: &TagSet) {
        let span = weighted.span;
        let key = StatsKey {
            name: span.name().to_string(),
            aggr: aggr.to_string(),
        };
        let gs = self
            .data
            .entry(key)
            .or_insert_with(|| GroupedStats::new(tags.clone()));

        if weighted.top_level {
            gs.top_level += 1;
        }
        gs.hits += weighted.weight;
        if span.is_error() {
            gs.errors += weighted.weight;
        }
        gs.duration += span.duration() as f64 * weighted.weight;
        gs.distribution
            .insert(ns_timestamp_to_float(span.duration()), span.span_id());
    }

    fn add_sublayer(&mut self, weighted: &WeightedSpan<'_>, aggr: &str, tags: &TagSet, sublayer: &SublayerValue) {
        let (aggr, tags) = match &sublayer.tag {
            Some(tag) => {
                let mut sub_tags = tags.clone();
                sub_tags.push(tag.clone());
                (format!("{},{}", aggr, tag), sub_tags)
            }
            None => (aggr.to_string(), tags.clone()),
        };

        let key = SublayerKey {
            name: weighted.span.name().to_string(),
            measure: sublayer.metric,
            aggr,
        };
        let ss = self.sublayer_data.entry(key).or_insert_with(|| SublayerStats {
            tags,
            top_level: 0,
            value: 0.0,
        });

        if weighted.top_level {
            ss.top_level += 1;
        }
        ss.value += weighted.weight * sublayer.value;
    }

    /// Converts the bucket into its exported form.
    pub fn export(self) -> StatsBucket {
        let mut bucket = StatsBucket::new(self.start, self.duration);

        for (key, gs) in self.data {
            for (measure, value) in [(HITS, gs.hits), (ERRORS, gs.errors), (DURATION, gs.duration)] {
                let grain = grain_key(&key.name, measure, &key.aggr);
                bucket.counts.insert(
                    grain.clone(),
                    Count {
                        key: grain,
                        name: key.name.clone(),
                        measure: measure.to_string(),
                        tag_set: gs.tags.clone(),
                        top_level: gs.top_level,
                        value,
                    },
                );
            }

            let grain = grain_key(&key.name, DURATION, &key.aggr);
            bucket.distributions.insert(
                grain.clone(),
                Distribution {
                    key: grain,
                    name: key.name,
                    measure: DURATION.to_string(),
                    tag_set: gs.tags,
                    top_level: gs.top_level,
                    summary: gs.distribution,
                },
            );
        }

        for (key, ss) in self.sublayer_data {
            let grain = grain_key(&key.name, key.measure, &key.aggr);
            bucket.counts.insert(
                grain.clone(),
                Count {
                    key: grain,
                    name: key.name,
                    measure: key.measure.to_string(),
                    tag_set: ss.tags,
                    top_level: ss.top_level,
                    value: ss.value,
                },
            );
        }

        bucket
    }
}

/// Builds the aggregation string `env:..,resource:..,service:..[,tag:value...]` and its tag set.
fn assemble_grain(weighted: &WeightedSpan<'_>, env: &str, aggregators: &[String]) -> (String, TagSet) {
    let span = weighted.span;
    let mut tags = vec![
        Tag::new("env", env),
        Tag::new("resource", span.resource()),
        Tag::new("service", span.service()),
    ];

    for name in aggregators {
        if matches!(name.as_str(), "env" | "resource" | "service") {
            continue;
        }
        if let Some(value) = span.meta().get(name) {
            tags.push(Tag::new(name.as_str(), value.as_str()));
        }
    }

    let aggr = tags.iter().map(Tag::to_string).collect::<Vec<_>>().join(",");
    (aggr, tags)
}

/// Truncates a nanosecond duration to a fixed precision, so that the sketch does not track insignificant digits.
fn ns_timestamp_to_float(mut ns: i64) -> f64 {
    let mut shift = 0;
    while ns > ROUND_MASK {
        ns >>= 1;
        shift += 1;
    }
    (ns << shift) as f64
}
