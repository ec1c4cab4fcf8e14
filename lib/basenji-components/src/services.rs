//! Service metadata tracking.
//!
//! Metadata comes from two sources: tracers posting it to the services endpoint, and the agent itself deriving the
//! application type of every service it sees as top-level in a trace. The mapper caches what it has forwarded, so only
//! new or changed services reach the writer.

use std::time::Duration;

use basenji_core::{services::APP_TYPE_KEY, ProcessedTrace, ServicesMetadata};
use metrics::gauge;
use tokio::{
    select,
    sync::mpsc,
    time::{interval_at, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Metadata key only set by tracers. Entries carrying it take precedence over derived ones.
pub const APP_KEY: &str = "app";

const TELEMETRY_PERIOD: Duration = Duration::from_secs(60);

/// Derives service metadata from the top-level spans of a trace.
///
/// The first top-level span of a service that has a type decides its `app_type`.
pub fn extract_services(trace: &ProcessedTrace) -> ServicesMetadata {
    let mut metadata = ServicesMetadata::new();
    for weighted in trace.weighted_spans() {
        let span = weighted.span;
        if !weighted.top_level || span.type_().is_empty() || metadata.get(span.service()).is_some() {
            continue;
        }
        metadata.insert(span.service(), APP_TYPE_KEY, span.type_());
    }
    metadata
}

/// Cache of forwarded service metadata.
#[derive(Debug, Default)]
pub struct ServiceMapper {
    cache: ServicesMetadata,
}

impl ServiceMapper {
    /// Creates an empty `ServiceMapper`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every service known so far.
    pub fn known(&self) -> &ServicesMetadata {
        &self.cache
    }

    /// Merges `metadata` into the cache, returning the services that must be forwarded, if any.
    pub fn update(&mut self, metadata: &ServicesMetadata) -> Option<ServicesMetadata> {
        let mut changes = ServicesMetadata::new();
        for (service, metas) in metadata.iter() {
            if !self.should_add(service, metas.contains_key(APP_KEY), metadata) {
                continue;
            }
            for (key, value) in metas {
                changes.insert(service.as_str(), key.as_str(), value.as_str());
            }
        }

        if changes.is_empty() {
            return None;
        }
        self.cache.merge(changes.clone());
        gauge!("services_tracked").set(self.cache.len() as f64);
        Some(changes)
    }

    fn should_add(&self, service: &str, from_tracer: bool, metadata: &ServicesMetadata) -> bool {
        let Some(cached) = self.cache.get(service) else {
            return true;
        };
        if Some(cached) == metadata.get(service) {
            return false;
        }
        // Tracer-provided entries are never overwritten by derived ones.
        if cached.contains_key(APP_KEY) {
            return false;
        }
        from_tracer
    }

    /// Runs the mapper until `shutdown` is triggered or the input channel closes.
    pub async fn run(
        &mut self, input: &mut mpsc::Receiver<ServicesMetadata>, output: &mpsc::Sender<ServicesMetadata>,
        shutdown: &CancellationToken,
    ) {
        let mut telemetry = interval_at(Instant::now() + TELEMETRY_PERIOD, TELEMETRY_PERIOD);

        debug!("Service mapper started.");

        loop {
            select! {
                _ = shutdown.cancelled() => break,
                _ = telemetry.tick() => info!(services = self.cache.len(), "Tracked services."),
                maybe_metadata = input.recv() => match maybe_metadata {
                    Some(metadata) => {
                        let Some(changes) = self.update(&metadata) else {
                            continue;
                        };
                        if output.send(changes).await.is_err() {
                            debug!("Service metadata output closed.");
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        debug!("Service mapper stopped.");
    }
}

#[cfg(test)]
mod tests {
    use basenji_core::{Span, Trace};

    use super::*;

    fn metadata(entries: &[(&str, &str, &str)]) -> ServicesMetadata {
        let mut metadata = ServicesMetadata::new();
        for (service, key, value) in entries {
            metadata.insert(*service, *key, *value);
        }
        metadata
    }

    #[test]
    fn extracts_app_type_from_top_level_spans() {
        let root = Span::new("web", "request", "GET /", "web", 1, 1, 0, 0, 100, 0);
        let inner = Span::new("web", "render", "GET /", "template", 1, 2, 1, 10, 10, 0);
        let db = Span::new("pg", "query", "SELECT ?", "sql", 1, 3, 1, 20, 10, 0);
        let untyped = Span::new("cache", "get", "GET", "", 1, 4, 1, 30, 10, 0);
        let mut trace = Trace::new(vec![root, inner, db, untyped]);
        trace.compute_top_level();

        let extracted = extract_services(&ProcessedTrace::new(trace, 0, "prod"));
        assert_eq!(extracted, metadata(&[("web", APP_TYPE_KEY, "web"), ("pg", APP_TYPE_KEY, "sql")]));
    }

    #[test]
    fn forwards_only_changes() {
        let mut mapper = ServiceMapper::new();
        let first = metadata(&[("web", APP_TYPE_KEY, "web")]);
        assert_eq!(mapper.update(&first), Some(first.clone()));
        assert_eq!(mapper.update(&first), None);

        let both = metadata(&[("web", APP_TYPE_KEY, "web"), ("pg", APP_TYPE_KEY, "db")]);
        assert_eq!(mapper.update(&both), Some(metadata(&[("pg", APP_TYPE_KEY, "db")])));
        assert_eq!(mapper.known().len(), 2);
    }

    #[test]
    fn tracer_metadata_wins() {
        let mut mapper = ServiceMapper::new();
        mapper.update(&metadata(&[("web", APP_TYPE_KEY, "web")]));

        // Derived metadata does not replace derived metadata.
        assert_eq!(mapper.update(&metadata(&[("web", APP_TYPE_KEY, "rpc")])), None);

        let from_tracer = metadata(&[("web", APP_TYPE_KEY, "web"), ("web", APP_KEY, "django")]);
        assert!(mapper.update(&from_tracer).is_some());

        assert_eq!(mapper.update(&metadata(&[("web", APP_TYPE_KEY, "db")])), None);
        assert_eq!(
            mapper.known().get("web").and_then(|m| m.get(APP_KEY)).map(String::as_str),
            Some("django")
        );
    }

    #[tokio::test]
    async fn run_forwards_changes() {
        let mut mapper = ServiceMapper::new();
        let (input_tx, mut input_rx) = mpsc::channel(4);
        let (output_tx, mut output_rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();

        let update = metadata(&[("web", APP_TYPE_KEY, "web")]);
        input_tx.send(update.clone()).await.unwrap();
        input_tx.send(update.clone()).await.unwrap();
        drop(input_tx);

        mapper.run(&mut input_rx, &output_tx, &shutdown).await;
        drop(output_tx);
        assert_eq!(output_rx.recv().await, Some(update));
        assert_eq!(output_rx.recv().await, None);
    }
}
