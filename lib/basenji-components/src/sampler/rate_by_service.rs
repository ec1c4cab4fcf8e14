use std::sync::Arc;

use arc_swap::ArcSwap;
use basenji_common::collections::FastHashMap;

/// Sampling rates per `(service, env)`, keyed by `service:<service>,env:<env>`.
///
/// Written by the priority engine and read by the receiver, which hands the table back to tracers so they can adjust
/// their client-side rates. Updates replace the whole table at once, so readers always see a consistent snapshot.
#[derive(Clone, Debug, Default)]
pub struct RateByService {
    rates: Arc<ArcSwap<FastHashMap<String, f64>>>,
}

impl RateByService {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every rate.
    ///
    /// Keys absent from `rates` are removed, and rates are clamped to `[0, 1]`.
    pub fn set_all(&self, mut rates: FastHashMap<String, f64>) {
        for rate in rates.values_mut() {
            *rate = rate.clamp(0.0, 1.0);
        }
        self.rates.store(Arc::new(rates));
    }

    /// Returns a snapshot of every rate.
    pub fn get_all(&self) -> Arc<FastHashMap<String, f64>> {
        self.rates.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rates(entries: &[(&str, f64)]) -> FastHashMap<String, f64> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn set_all_replaces_and_clamps() {
        let table = RateByService::new();
        assert!(table.get_all().is_empty());

        table.set_all(rates(&[("service:a,env:prod", 0.5), ("service:b,env:prod", 1.5)]));
        let snapshot = table.get_all();
        assert_eq!(snapshot.get("service:a,env:prod"), Some(&0.5));
        assert_eq!(snapshot.get("service:b,env:prod"), Some(&1.0));

        table.set_all(rates(&[("service:b,env:prod", -0.2)]));
        let updated = table.get_all();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated.get("service:b,env:prod"), Some(&0.0));

        // Earlier snapshots are unaffected.
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn clones_share_the_table() {
        let writer = RateByService::new();
        let reader = writer.clone();
        writer.set_all(rates(&[("service:,env:", 0.7)]));
        assert_eq!(reader.get_all().get("service:,env:"), Some(&0.7));
    }
}
