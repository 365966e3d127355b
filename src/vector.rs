//! A dynamic label vector: one metric name, one kind, many children keyed by label set.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use indexmap::IndexSet;
use parking_lot::RwLock;
use quanta::Clock;
use thiserror::Error;

use crate::child::Child;
use crate::sample::SampleKind;

/// Raised when a sample's kind or histogram shape conflicts with the vector it would join.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VectorConflict {
    #[error("metric already registered as {existing}, sample was {incoming}")]
    KindMismatch { existing: &'static str, incoming: &'static str },
    #[error("histogram buckets already fixed to {existing:?}, sample declared {incoming:?}")]
    BucketMismatch { existing: Vec<f64>, incoming: Vec<f64> },
}

/// All the timeseries sharing one `(service, name, kind)` identity.
///
/// A single folding task owns every mutation (insertion, schema back-fill, expiration); the
/// `RwLock` exists only to let concurrent scrape reads and the expiration sweep observe a
/// consistent children map without blocking the folder on the common case of updating a
/// value already present, which takes the lock in read mode.
pub struct Vector {
    kind: SampleKind,
    help: RwLock<Option<String>>,
    label_names: RwLock<IndexSet<String>>,
    children: RwLock<Vec<Child>>,
    buckets: RwLock<Option<Vec<f64>>>,
    dropped_conflicts: AtomicU64,
}

impl Vector {
    pub fn new(kind: SampleKind) -> Vector {
        Vector {
            kind,
            help: RwLock::new(None),
            label_names: RwLock::new(IndexSet::new()),
            children: RwLock::new(Vec::new()),
            buckets: RwLock::new(None),
            dropped_conflicts: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> SampleKind {
        self.kind
    }

    pub fn set_help(&self, help: String) {
        *self.help.write() = Some(help);
    }

    pub fn help(&self) -> Option<String> {
        self.help.read().clone()
    }

    /// Folds one sample's labels and value into this vector, creating a child if needed.
    ///
    /// If the sample introduces label names the vector hasn't seen before, every existing
    /// child is back-filled with `""` for the new names (schema back-fill) before the new
    /// child is created, so the vector's label key set only ever grows.
    pub fn fold(
        &self,
        labels: BTreeMap<String, String>,
        value: f64,
        buckets: Vec<f64>,
        clock: &Clock,
    ) -> Result<(), VectorConflict> {
        if self.kind.is_histogram() {
            let mut sorted = buckets.clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).expect("bucket bounds must be finite"));
            let fixed = self.fix_buckets(&sorted);
            if fixed != sorted {
                self.record_conflict();
                return Err(VectorConflict::BucketMismatch { existing: fixed, incoming: sorted });
            }
        }

        let new_names: Vec<String> = {
            let known = self.label_names.read();
            labels.keys().filter(|k| !known.contains(*k)).cloned().collect()
        };

        if !new_names.is_empty() {
            let mut known = self.label_names.write();
            let mut children = self.children.write();
            for name in &new_names {
                if known.insert(name.clone()) {
                    for child in children.iter_mut() {
                        child.labels_mut().entry(name.clone()).or_insert_with(String::new);
                    }
                }
            }
            drop(known);
            drop(children);
        }

        let full_labels = self.backfill(labels);

        {
            let children = self.children.read();
            if let Some(child) = children.iter().find(|c| *c.labels() == full_labels) {
                child.apply(value, clock);
                return Ok(());
            }
        }

        let mut children = self.children.write();
        if let Some(child) = children.iter().find(|c| *c.labels() == full_labels) {
            child.apply(value, clock);
            return Ok(());
        }
        let child = Child::new(self.kind, full_labels, buckets, clock);
        child.apply(value, clock);
        children.push(child);
        Ok(())
    }

    /// Fixes the vector's bucket definition to `proposed` on first call, returning the
    /// definition the vector now holds (which may differ from `proposed` if another sample
    /// already fixed it first).
    fn fix_buckets(&self, proposed: &[f64]) -> Vec<f64> {
        let mut guard = self.buckets.write();
        match guard.as_ref() {
            Some(existing) => existing.clone(),
            None => {
                *guard = Some(proposed.to_vec());
                proposed.to_vec()
            }
        }
    }

    pub fn buckets(&self) -> Option<Vec<f64>> {
        self.buckets.read().clone()
    }

    /// Fills in any label name known to the vector but absent from `labels` with `""`.
    fn backfill(&self, mut labels: BTreeMap<String, String>) -> BTreeMap<String, String> {
        for name in self.label_names.read().iter() {
            labels.entry(name.clone()).or_insert_with(String::new);
        }
        labels
    }

    /// Removes children untouched for at least `ttl`, returning how many were dropped.
    pub fn expire(&self, now: quanta::Instant, ttl: Duration) -> usize {
        let mut children = self.children.write();
        let before = children.len();
        children.retain(|c| !c.is_expired(now, ttl));
        before - children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.read().is_empty()
    }

    pub fn label_names(&self) -> Vec<String> {
        self.label_names.read().iter().cloned().collect()
    }

    pub fn with_children<R>(&self, f: impl FnOnce(&[Child]) -> R) -> R {
        f(&self.children.read())
    }

    pub fn record_conflict(&self) {
        self.dropped_conflicts.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::child::ChildSnapshot;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn creates_and_updates_children() {
        let (clock, _mock) = Clock::mock();
        let v = Vector::new(SampleKind::Counter);
        v.fold(labels(&[("route", "/")]), 1.0, Vec::new(), &clock).unwrap();
        v.fold(labels(&[("route", "/")]), 2.0, Vec::new(), &clock).unwrap();
        v.with_children(|children| {
            assert_eq!(children.len(), 1);
            match children[0].snapshot() {
                ChildSnapshot::Counter(val) => assert_eq!(val, 3.0),
                _ => panic!("expected counter"),
            }
        });
    }

    #[test]
    fn backfills_new_label_names_on_existing_children() {
        let (clock, _mock) = Clock::mock();
        let v = Vector::new(SampleKind::Gauge);
        v.fold(labels(&[("route", "/")]), 1.0, Vec::new(), &clock).unwrap();
        v.fold(labels(&[("route", "/"), ("method", "GET")]), 2.0, Vec::new(), &clock).unwrap();

        v.with_children(|children| {
            assert_eq!(children.len(), 2);
            for child in children {
                assert!(child.labels().contains_key("method"));
                assert!(child.labels().contains_key("route"));
            }
            let first = children.iter().find(|c| c.labels()["method"] == "").unwrap();
            assert_eq!(first.labels()["route"], "/");
        });
    }

    #[test]
    fn expire_drops_stale_children() {
        let (clock, mock) = Clock::mock();
        let v = Vector::new(SampleKind::Gauge);
        v.fold(labels(&[("route", "/")]), 1.0, Vec::new(), &clock).unwrap();
        mock.increment(Duration::from_secs(120));
        let dropped = v.expire(clock.now(), Duration::from_secs(60));
        assert_eq!(dropped, 1);
        assert!(v.is_empty());
    }

    #[test]
    fn rejects_conflicting_bucket_redefinition() {
        let (clock, _mock) = Clock::mock();
        let v = Vector::new(SampleKind::Histogram);
        v.fold(labels(&[]), 1.0, vec![1.0, 5.0, 10.0], &clock).unwrap();
        let err = v.fold(labels(&[]), 1.0, vec![1.0, 2.0, 10.0], &clock).unwrap_err();
        assert_eq!(
            err,
            VectorConflict::BucketMismatch { existing: vec![1.0, 5.0, 10.0], incoming: vec![1.0, 2.0, 10.0] }
        );
    }
}
