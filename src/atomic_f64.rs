use std::sync::atomic::{AtomicU64, Ordering};

/// A floating-point value that can be read, set, and added to atomically.
///
/// `std` has no atomic `f64`, so values are stored as the bit pattern of the float inside
/// an `AtomicU64` and updated via a compare-and-swap loop, the same trick
/// `metrics-util`'s `AtomicBucket` counterparts use for their `u64` gauges.
#[derive(Debug, Default)]
pub struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self { bits: AtomicU64::new(value.to_bits()) }
    }

    pub fn load(&self, ordering: Ordering) -> f64 {
        f64::from_bits(self.bits.load(ordering))
    }

    pub fn store(&self, value: f64, ordering: Ordering) {
        self.bits.store(value.to_bits(), ordering);
    }

    /// Adds `value` to the current value, returning the new value.
    pub fn add(&self, value: f64, ordering: Ordering) -> f64 {
        self.update(ordering, |current| current + value)
    }

    fn update(&self, ordering: Ordering, mut f: impl FnMut(f64) -> f64) -> f64 {
        let mut current = self.bits.load(Ordering::Acquire);
        loop {
            let new = f(f64::from_bits(current)).to_bits();
            match self.bits.compare_exchange_weak(current, new, ordering, Ordering::Acquire) {
                Ok(_) => return f64::from_bits(new),
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_load() {
        let v = AtomicF64::new(1.5);
        assert_eq!(v.load(Ordering::Acquire), 1.5);
        v.store(2.5, Ordering::Release);
        assert_eq!(v.load(Ordering::Acquire), 2.5);
    }

    #[test]
    fn add_accumulates() {
        let v = AtomicF64::new(0.0);
        v.add(1.0, Ordering::AcqRel);
        v.add(2.5, Ordering::AcqRel);
        assert_eq!(v.load(Ordering::Acquire), 3.5);
    }
}
