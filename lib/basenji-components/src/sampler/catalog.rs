//! Service key catalog for reverse-mapping service signatures to their hashes.
//!
//! The catalog does not own the lifecycle of the scores it points at: when the backend forgets a signature, the
//! matching entry is evicted on the next publish.

use basenji_common::collections::FastHashMap;

use super::core_sampler::Sampler;
use super::signature::{ServiceSignature, Signature};

/// Key under which the rate for unknown services is published.
pub const DEFAULT_SERVICE_RATE_KEY: &str = "service:,env:";

#[derive(Debug, Default)]
pub struct ServiceKeyCatalog {
    entries: FastHashMap<String, Signature>,
}

impl ServiceKeyCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a service signature and returns its hash.
    pub fn register(&mut self, service_signature: &ServiceSignature) -> Signature {
        let signature = service_signature.hash();
        self.entries.insert(service_signature.to_string(), signature);
        signature
    }

    /// Builds the rate-by-service table from the sampler's current scores.
    ///
    /// Entries whose signature is no longer scored are evicted. The default entry carries the rate applied to
    /// services the agent has not seen yet.
    pub fn rates_by_service(&mut self, sampler: &Sampler) -> FastHashMap<String, f64> {
        self.entries.retain(|_, signature| sampler.backend().contains(*signature));

        let mut rates = FastHashMap::default();
        rates.reserve(self.entries.len() + 1);
        for (key, signature) in &self.entries {
            rates.insert(key.clone(), sampler.sample_rate(*signature));
        }
        rates.insert(DEFAULT_SERVICE_RATE_KEY.to_string(), sampler.default_rate());
        rates
    }
}
