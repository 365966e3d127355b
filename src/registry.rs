//! Per-service collection of dynamic vectors.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use quanta::Clock;
use std::time::Duration;

use crate::sample::{Sample, SampleKind};
use crate::vector::{Vector, VectorConflict};

/// All metrics belonging to one service, keyed by metric name.
///
/// Insertion order is preserved so a scrape renders metrics in first-seen order, matching
/// what an operator watching `kubectl logs` or a growing dashboard would expect.
#[derive(Default)]
pub struct Registry {
    vectors: RwLock<IndexMap<String, Arc<Vector>>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry { vectors: RwLock::new(IndexMap::new()) }
    }

    /// Folds a validated sample into its vector, creating the vector on first sight of `name`.
    ///
    /// Returns an error without mutating anything if the sample's kind conflicts with a
    /// vector already registered under this name.
    pub fn fold(&self, sample: &Sample, kind: SampleKind, buckets: Vec<f64>, clock: &Clock) -> Result<(), VectorConflict> {
        let vector = self.vector_for(&sample.name, kind)?;
        vector.fold(sample.labels.clone(), sample.value, buckets, clock)
    }

    fn vector_for(&self, name: &str, kind: SampleKind) -> Result<Arc<Vector>, VectorConflict> {
        {
            let vectors = self.vectors.read();
            if let Some(v) = vectors.get(name) {
                return Self::check_kind(v, kind);
            }
        }
        let mut vectors = self.vectors.write();
        if let Some(v) = vectors.get(name) {
            return Self::check_kind(v, kind);
        }
        let vector = Arc::new(Vector::new(kind));
        vectors.insert(name.to_string(), Arc::clone(&vector));
        Ok(vector)
    }

    fn check_kind(vector: &Arc<Vector>, kind: SampleKind) -> Result<Arc<Vector>, VectorConflict> {
        if vector.kind() != kind {
            vector.record_conflict();
            return Err(VectorConflict::KindMismatch {
                existing: vector.kind().as_str(),
                incoming: kind.as_str(),
            });
        }
        Ok(Arc::clone(vector))
    }

    /// Sweeps every vector for children untouched for at least `ttl`, returning the total
    /// number of children evicted. Empty vectors are left in place: a metric name that has
    /// gone quiet still renders with zero children until the process restarts, mirroring how
    /// client libraries never un-register a metric once declared.
    pub fn expire(&self, now: quanta::Instant, ttl: Duration) -> usize {
        self.vectors.read().values().map(|v| v.expire(now, ttl)).sum()
    }

    pub fn vectors(&self) -> IndexMap<String, Arc<Vector>> {
        self.vectors.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample(name: &str, kind: &str, value: f64) -> Sample {
        Sample {
            service: "shop".into(),
            name: name.into(),
            kind_raw: kind.into(),
            labels: BTreeMap::new(),
            value,
            histogram_def: Vec::new(),
        }
    }

    #[test]
    fn registers_new_vector_on_first_sample() {
        let (clock, _mock) = Clock::mock();
        let reg = Registry::new();
        let s = sample("requests", "c", 1.0);
        reg.fold(&s, SampleKind::Counter, Vec::new(), &clock).unwrap();
        assert_eq!(reg.vectors().len(), 1);
    }

    #[test]
    fn rejects_kind_conflict() {
        let (clock, _mock) = Clock::mock();
        let reg = Registry::new();
        let s = sample("requests", "c", 1.0);
        reg.fold(&s, SampleKind::Counter, Vec::new(), &clock).unwrap();

        let s2 = sample("requests", "g", 1.0);
        let err = reg.fold(&s2, SampleKind::Gauge, Vec::new(), &clock).unwrap_err();
        assert_eq!(
            err,
            VectorConflict::KindMismatch { existing: "counter", incoming: "gauge" }
        );
    }
}
