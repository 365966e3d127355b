//! Cumulative-bucket histogram storage, the same accounting `metrics-util::Histogram` uses:
//! each bucket counts every observation less than or equal to its bound, so rendering walks
//! the bounds in order and the running total at each bound is the bucket's final value.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::atomic_f64::AtomicF64;

/// Fixed, immutable bucket boundaries with atomic per-bucket counts.
///
/// Boundaries are decided once, from the first sample that creates the enclosing vector, and
/// never change afterward (first-definition-wins, per the vector's schema rules).
#[derive(Debug)]
pub struct HistogramState {
    bounds: Vec<f64>,
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    sum: AtomicF64,
}

/// A point-in-time read of a histogram's state, suitable for rendering.
#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    pub bounds: Vec<f64>,
    pub cumulative_counts: Vec<u64>,
    pub count: u64,
    pub sum: f64,
}

impl HistogramState {
    /// Builds a histogram from already-resolved, ascending bucket bounds.
    pub fn new(mut bounds: Vec<f64>) -> HistogramState {
        bounds.sort_by(|a, b| a.partial_cmp(b).expect("bounds must be finite"));
        let buckets = bounds.iter().map(|_| AtomicU64::new(0)).collect();
        HistogramState { bounds, buckets, count: AtomicU64::new(0), sum: AtomicF64::new(0.0) }
    }

    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }

    /// Records one observation: every bucket whose bound is `>= value` is incremented, and
    /// the running count/sum always advance regardless of whether `value` falls within the
    /// highest declared bound (Prometheus's implicit `+Inf` bucket).
    pub fn observe(&self, value: f64) {
        for (bound, bucket) in self.bounds.iter().zip(self.buckets.iter()) {
            if value <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.add(value, Ordering::AcqRel);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            bounds: self.bounds.clone(),
            cumulative_counts: self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).collect(),
            count: self.count.load(Ordering::Relaxed),
            sum: self.sum.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_cumulative_buckets() {
        let h = HistogramState::new(vec![1.0, 5.0, 10.0]);
        h.observe(0.5);
        h.observe(3.0);
        h.observe(7.0);
        h.observe(20.0);

        let snap = h.snapshot();
        assert_eq!(snap.cumulative_counts, vec![1, 2, 3]);
        assert_eq!(snap.count, 4);
        assert_eq!(snap.sum, 0.5 + 3.0 + 7.0 + 20.0);
    }

    #[test]
    fn observation_above_all_bounds_still_counted() {
        let h = HistogramState::new(vec![1.0]);
        h.observe(100.0);
        let snap = h.snapshot();
        assert_eq!(snap.cumulative_counts, vec![0]);
        assert_eq!(snap.count, 1);
    }

    #[test]
    fn sorts_unsorted_bounds() {
        let h = HistogramState::new(vec![10.0, 1.0, 5.0]);
        assert_eq!(h.bounds(), &[1.0, 5.0, 10.0]);
    }
}
