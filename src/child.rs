//! A single labelled timeseries within a dynamic vector.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::RwLock;
use quanta::{Clock, Instant};

use crate::atomic_f64::AtomicF64;
use crate::histogram::{HistogramSnapshot, HistogramState};
use crate::sample::SampleKind;

/// The kind-specific state a child holds. A child's kind never changes after creation.
#[derive(Debug)]
pub enum ChildState {
    Counter(AtomicF64),
    Gauge(AtomicF64),
    Histogram(HistogramState),
}

/// One fully-labelled timeseries inside a [`crate::vector::Vector`].
///
/// `labels` always carries every label name the vector's schema has ever seen; labels absent
/// on the sample that created this child are back-filled with `""` by the vector before the
/// child is constructed, so every child in a vector has an identical label key set.
#[derive(Debug)]
pub struct Child {
    labels: BTreeMap<String, String>,
    state: ChildState,
    last_update: RwLock<Instant>,
}

/// A point-in-time read of a child, suitable for rendering.
pub enum ChildSnapshot {
    Counter(f64),
    Gauge(f64),
    Histogram(HistogramSnapshot),
}

impl Child {
    pub fn new(kind: SampleKind, labels: BTreeMap<String, String>, buckets: Vec<f64>, clock: &Clock) -> Child {
        let state = match kind {
            SampleKind::Counter => ChildState::Counter(AtomicF64::new(0.0)),
            SampleKind::Gauge => ChildState::Gauge(AtomicF64::new(0.0)),
            SampleKind::Histogram | SampleKind::HistogramLinear => {
                ChildState::Histogram(HistogramState::new(buckets))
            }
        };
        Child { labels, state, last_update: RwLock::new(clock.now()) }
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Mutable access used only by the vector's schema back-fill, under its own write lock.
    pub fn labels_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.labels
    }

    /// Applies one validated sample's value to this child's state and marks it as fresh.
    ///
    /// Takes only a shared reference: callers hold the vector's `RwLock` in read mode while
    /// folding, since the atomic update below is the only mutation a steady-state sample needs.
    pub fn apply(&self, value: f64, clock: &Clock) {
        match &self.state {
            ChildState::Counter(v) => {
                v.add(value, Ordering::AcqRel);
            }
            ChildState::Gauge(v) => {
                v.store(value, Ordering::Release);
            }
            ChildState::Histogram(h) => {
                h.observe(value);
            }
        }
        *self.last_update.write() = clock.now();
    }

    pub fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(*self.last_update.read()) >= ttl
    }

    pub fn snapshot(&self) -> ChildSnapshot {
        match &self.state {
            ChildState::Counter(v) => ChildSnapshot::Counter(v.load(Ordering::Acquire)),
            ChildState::Gauge(v) => ChildSnapshot::Gauge(v.load(Ordering::Acquire)),
            ChildState::Histogram(h) => ChildSnapshot::Histogram(h.snapshot()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn counter_accumulates() {
        let (clock, _mock) = Clock::mock();
        let c = Child::new(SampleKind::Counter, labels(&[("route", "/")]), Vec::new(), &clock);
        c.apply(1.0, &clock);
        c.apply(2.0, &clock);
        match c.snapshot() {
            ChildSnapshot::Counter(v) => assert_eq!(v, 3.0),
            _ => panic!("expected counter"),
        }
    }

    #[test]
    fn gauge_overwrites() {
        let (clock, _mock) = Clock::mock();
        let c = Child::new(SampleKind::Gauge, labels(&[]), Vec::new(), &clock);
        c.apply(5.0, &clock);
        c.apply(2.0, &clock);
        match c.snapshot() {
            ChildSnapshot::Gauge(v) => assert_eq!(v, 2.0),
            _ => panic!("expected gauge"),
        }
    }

    #[test]
    fn expiration_uses_last_update() {
        let (clock, mock) = Clock::mock();
        let c = Child::new(SampleKind::Gauge, labels(&[]), Vec::new(), &clock);
        assert!(!c.is_expired(clock.now(), Duration::from_secs(60)));
        mock.increment(Duration::from_secs(120));
        assert!(c.is_expired(clock.now(), Duration::from_secs(60)));
        c.apply(1.0, &clock);
        assert!(!c.is_expired(clock.now(), Duration::from_secs(60)));
    }
}
