use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use basenji_common::time::get_unix_timestamp_nanos;
use basenji_components::{normalizer::Normalizer, services::extract_services};
use basenji_core::{ProcessedTrace, ServicesMetadata};
use metrics::counter;
use tokio::{
    select,
    sync::mpsc::{self, error::TrySendError},
    time::{interval_at, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{IncomingTrace, Stage};

/// Shortest interval between two drop summaries in the logs.
const DROP_SUMMARY_PERIOD: Duration = Duration::from_secs(60);

/// Counts dropped traces per reason between two log lines.
#[derive(Debug, Default)]
struct DropSummary {
    counts: BTreeMap<&'static str, u64>,
}

impl DropSummary {
    fn record(&mut self, reason: &'static str) {
        *self.counts.entry(reason).or_default() += 1;
    }

    fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Logs the counts accumulated so far, if any, and resets them.
    fn flush(&mut self) {
        if self.counts.is_empty() {
            return;
        }

        let reasons = self
            .counts
            .iter()
            .map(|(reason, count)| format!("{}={}", reason, count))
            .collect::<Vec<_>>()
            .join(", ");
        warn!(total = self.total(), "Dropped traces over the last minute: {}.", reasons);
        self.counts.clear();
    }
}

/// Normalizes incoming traces and fans them out to the stats, sampling and service stages.
///
/// A full downstream queue only drops the trace for that target; the others still receive it.
pub struct NormalizerStage {
    normalizer: Normalizer,
    input: mpsc::Receiver<IncomingTrace>,
    concentrator: mpsc::Sender<Arc<ProcessedTrace>>,
    sampler: mpsc::Sender<Arc<ProcessedTrace>>,
    services: mpsc::Sender<ServicesMetadata>,
    drops: DropSummary,
}

impl NormalizerStage {
    pub fn new(
        normalizer: Normalizer, input: mpsc::Receiver<IncomingTrace>, concentrator: mpsc::Sender<Arc<ProcessedTrace>>,
        sampler: mpsc::Sender<Arc<ProcessedTrace>>, services: mpsc::Sender<ServicesMetadata>,
    ) -> Self {
        Self {
            normalizer,
            input,
            concentrator,
            sampler,
            services,
            drops: DropSummary::default(),
        }
    }

    fn handle(&mut self, incoming: IncomingTrace) {
        let now = get_unix_timestamp_nanos();
        let processed = match self
            .normalizer
            .process(incoming.trace, now, incoming.presampler_rate)
        {
            Ok(processed) => Arc::new(processed),
            Err(e) => {
                self.drops.record(e.reason());
                return;
            }
        };
        counter!("pipeline_traces_processed_total").increment(1);

        let services = extract_services(&processed);
        if !services.is_empty() {
            forward("service_mapper", &self.services, services, &mut self.drops);
        }
        forward("concentrator", &self.concentrator, Arc::clone(&processed), &mut self.drops);
        forward("sampler", &self.sampler, processed, &mut self.drops);
    }
}

fn forward<T>(target: &'static str, output: &mpsc::Sender<T>, item: T, drops: &mut DropSummary) {
    match output.try_send(item) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            counter!("pipeline_traces_dropped_total", "target" => target).increment(1);
            drops.record(target);
        }
        Err(TrySendError::Closed(_)) => debug!(target, "Pipeline stage input closed."),
    }
}

#[async_trait]
impl Stage for NormalizerStage {
    async fn run(&mut self, shutdown: &CancellationToken) {
        let mut summary = interval_at(Instant::now() + DROP_SUMMARY_PERIOD, DROP_SUMMARY_PERIOD);

        debug!("Normalizer started.");

        loop {
            select! {
                _ = shutdown.cancelled() => break,
                _ = summary.tick() => self.drops.flush(),
                maybe_trace = self.input.recv() => match maybe_trace {
                    Some(incoming) => self.handle(incoming),
                    None => break,
                },
            }
        }

        self.drops.flush();
        debug!("Normalizer stopped.");
    }
}
