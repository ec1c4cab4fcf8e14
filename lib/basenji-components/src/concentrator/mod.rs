//! Time-bucketed span statistics.
//!
//! The concentrator folds every span of every processed trace into the bucket containing the span's end, keyed by
//! operation name and aggregation tags. Buckets are flushed once they are old enough that late spans are unlikely to
//! land in them.

use std::{sync::Arc, time::Duration};

use basenji_common::{collections::FastHashMap, time::get_unix_timestamp_nanos};
use basenji_config::GenericConfiguration;
use basenji_core::{ProcessedTrace, StatsBucket};
use basenji_error::{generic_error, GenericError};
use metrics::{gauge, histogram};
use serde::Deserialize;
use tokio::{
    select,
    sync::mpsc,
    time::{interval_at, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

mod statsraw;
use self::statsraw::RawBucket;

/// Number of bucket widths a bucket stays open after its start.
const BUFFER_LEN: i64 = 2;

const fn default_bucket_interval_secs() -> f64 {
    10.0
}

/// Concentrator configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct ConcentratorConfiguration {
    /// Width of a statistics bucket, in seconds.
    ///
    /// Defaults to 10 seconds.
    #[serde(rename = "bucket_interval", default = "default_bucket_interval_secs")]
    bucket_interval_secs: f64,

    /// Span tags to aggregate on, in addition to env, resource and service.
    ///
    /// Defaults to none.
    #[serde(default)]
    extra_aggregators: Vec<String>,
}

impl Default for ConcentratorConfiguration {
    fn default() -> Self {
        Self {
            bucket_interval_secs: default_bucket_interval_secs(),
            extra_aggregators: Vec::new(),
        }
    }
}

impl ConcentratorConfiguration {
    /// Creates a new `ConcentratorConfiguration` from the given configuration.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed()?)
    }

    /// Sets the bucket width.
    pub fn with_bucket_interval(mut self, interval: Duration) -> Self {
        self.bucket_interval_secs = interval.as_secs_f64();
        self
    }

    /// Sets the extra aggregation tags.
    pub fn with_extra_aggregators<S: Into<String>>(mut self, aggregators: impl IntoIterator<Item = S>) -> Self {
        self.extra_aggregators = aggregators.into_iter().map(Into::into).collect();
        self
    }

    /// Builds a `Concentrator` from this configuration.
    ///
    /// # Errors
    ///
    /// If the bucket width is shorter than a nanosecond, an error is returned.
    pub fn build(&self) -> Result<Concentrator, GenericError> {
        let bsize = (self.bucket_interval_secs * 1e9) as i64;
        if self.bucket_interval_secs.is_nan() || bsize <= 0 {
            return Err(generic_error!(
                "bucket_interval must be greater than zero, got {}",
                self.bucket_interval_secs
            ));
        }
        Ok(Concentrator::new(self.extra_aggregators.clone(), bsize))
    }
}

/// Aggregates spans into time buckets.
pub struct Concentrator {
    aggregators: Vec<String>,
    bsize: i64,
    buckets: FastHashMap<i64, RawBucket>,
}

impl Concentrator {
    /// Creates a new `Concentrator` with buckets `bsize` nanoseconds wide.
    pub fn new(mut aggregators: Vec<String>, bsize: i64) -> Self {
        aggregators.sort();
        aggregators.dedup();
        Self {
            aggregators,
            bsize,
            buckets: FastHashMap::default(),
        }
    }

    /// Returns the bucket width, in nanoseconds.
    pub fn bucket_size(&self) -> i64 {
        self.bsize
    }

    /// Adds every span of `trace` to the bucket containing its end.
    pub fn add(&mut self, trace: &ProcessedTrace) {
        let root_idx = trace.root_index();
        let sublayers = trace.sublayers();

        for (idx, weighted) in trace.weighted_spans().enumerate() {
            let end = weighted.span.end();
            let ts = end - end.rem_euclid(self.bsize);
            let bucket = self
                .buckets
                .entry(ts)
                .or_insert_with(|| RawBucket::new(ts, self.bsize));

            let sublayers = (idx == root_idx && !sublayers.is_empty()).then_some(sublayers);
            bucket.handle_span(&weighted, trace.env(), &self.aggregators, sublayers);
        }
    }

    /// Removes and returns every bucket that started at least two bucket widths before `now`.
    pub fn flush(&mut self, now: i64) -> Vec<StatsBucket> {
        let cutoff = now - BUFFER_LEN * self.bsize;
        let ready: Vec<i64> = self.buckets.keys().copied().filter(|ts| *ts <= cutoff).collect();

        let mut flushed = Vec::with_capacity(ready.len());
        for ts in ready {
            if let Some(raw) = self.buckets.remove(&ts) {
                let bucket = raw.export();
                for distribution in bucket.distributions.values() {
                    histogram!("concentrator_distribution_len").record(distribution.summary.count() as f64);
                }
                debug!(start = ts, "Flushing stats bucket.");
                flushed.push(bucket);
            }
        }

        gauge!("concentrator_open_buckets").set(self.buckets.len() as f64);
        flushed.sort_by_key(|bucket| bucket.start);
        flushed
    }

    /// Runs the concentrator until `shutdown` is triggered or the input channel closes.
    ///
    /// Buckets are flushed every bucket width, and once more on exit.
    pub async fn run(
        &mut self, input: &mut mpsc::Receiver<Arc<ProcessedTrace>>, output: &mpsc::Sender<Vec<StatsBucket>>,
        shutdown: &CancellationToken,
    ) {
        let period = Duration::from_nanos(self.bsize as u64);
        let mut flush = interval_at(Instant::now() + period, period);

        debug!("Concentrator started.");

        loop {
            select! {
                _ = shutdown.cancelled() => break,
                _ = flush.tick() => {
                    let buckets = self.flush(get_unix_timestamp_nanos());
                    if buckets.is_empty() {
                        continue;
                    }
                    if output.send(buckets).await.is_err() {
                        debug!("Stats output closed.");
                        return;
                    }
                }
                maybe_trace = input.recv() => match maybe_trace {
                    Some(trace) => self.add(&trace),
                    None => break,
                },
            }
        }

        info!("Concentrator stopping, flushing remaining stats.");
        let buckets = self.flush(get_unix_timestamp_nanos());
        if !buckets.is_empty() && output.send(buckets).await.is_err() {
            debug!("Stats output closed.");
        }
    }
}
