//! Maps service names to their registries, and reserves one for self-metrics.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::registry::Registry;

/// The service name the aggregator's own metrics are published under. Ingested samples
/// claiming this service name are rejected: it isn't a client-facing identity, it's the
/// aggregator's own process.
pub const SELF_METRICS_SERVICE: &str = "metricz";

/// All known registries, one per service name that has ever sent a sample.
pub struct RegistryIndex {
    registries: RwLock<IndexMap<String, Arc<Registry>>>,
    self_metrics: Arc<Registry>,
}

impl RegistryIndex {
    pub fn new() -> RegistryIndex {
        let self_metrics = Arc::new(Registry::new());
        let mut registries = IndexMap::new();
        registries.insert(SELF_METRICS_SERVICE.to_string(), Arc::clone(&self_metrics));
        RegistryIndex { registries: RwLock::new(registries), self_metrics }
    }

    /// Returns the registry for `service`, creating an empty one on first sight.
    pub fn registry_for(&self, service: &str) -> Arc<Registry> {
        {
            let registries = self.registries.read();
            if let Some(r) = registries.get(service) {
                return Arc::clone(r);
            }
        }
        let mut registries = self.registries.write();
        if let Some(r) = registries.get(service) {
            return Arc::clone(r);
        }
        let registry = Arc::new(Registry::new());
        registries.insert(service.to_string(), Arc::clone(&registry));
        registry
    }

    /// Looks up a registry without creating one, used by the scrape dispatcher: an unknown
    /// service name is a 404, not an empty page.
    pub fn lookup(&self, service: &str) -> Option<Arc<Registry>> {
        self.registries.read().get(service).cloned()
    }

    pub fn self_metrics(&self) -> &Arc<Registry> {
        &self.self_metrics
    }

    pub fn service_names(&self) -> Vec<String> {
        self.registries.read().keys().cloned().collect()
    }
}

impl Default for RegistryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserves_self_metrics_service() {
        let idx = RegistryIndex::new();
        assert!(idx.lookup(SELF_METRICS_SERVICE).is_some());
    }

    #[test]
    fn creates_registry_on_first_lookup() {
        let idx = RegistryIndex::new();
        assert!(idx.lookup("shop").is_none());
        let reg = idx.registry_for("shop");
        assert!(reg.is_empty());
        assert!(idx.lookup("shop").is_some());
    }
}
