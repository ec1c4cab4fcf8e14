//! Service metadata.

use basenji_common::collections::FastHashMap;
use serde::{Deserialize, Serialize};

/// Metadata key holding the application type of a service.
pub const APP_TYPE_KEY: &str = "app_type";

/// Per-service metadata: service name to a map of metadata keys and values.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ServicesMetadata(FastHashMap<String, FastHashMap<String, String>>);

impl ServicesMetadata {
    /// Creates an empty `ServicesMetadata`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a single metadata entry for a service.
    pub fn insert(&mut self, service: impl Into<String>, key: impl Into<String>, value: impl Into<String>) {
        self.0.entry(service.into()).or_default().insert(key.into(), value.into());
    }

    /// Returns the metadata of a service.
    pub fn get(&self, service: &str) -> Option<&FastHashMap<String, String>> {
        self.0.get(service)
    }

    /// Returns the number of services.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if no service is known.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over services and their metadata.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FastHashMap<String, String>)> {
        self.0.iter()
    }

    /// Merges `other` into `self`, replacing the metadata of every service `other` knows about.
    ///
    /// Returns `true` if anything changed, so callers only forward metadata that is new.
    pub fn merge(&mut self, other: ServicesMetadata) -> bool {
        let mut changed = false;
        for (service, metas) in other.0 {
            if self.0.get(&service) != Some(&metas) {
                self.0.insert(service, metas);
                changed = true;
            }
        }
        changed
    }
}
