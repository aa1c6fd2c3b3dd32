// Lock-free exponentially weighted moving average
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, thiserror::Error)]
#[error("alpha must be between 0 and 1 inclusive, got {0}")]
pub struct InvalidAlpha(pub f64);

/// Moving average of a single value, safe to share between threads.
///
/// The current average is stored as raw `f64` bits and updated with a
/// compare-and-retry loop, so concurrent writers never block each other.
/// A smaller alpha gives new samples less weight.
#[derive(Debug)]
pub struct ExponentiallyWeightedMovingAverage {
    alpha: f64,
    average_bits: AtomicU64,
}

impl ExponentiallyWeightedMovingAverage {
    /// # Panics
    ///
    /// Panics if `alpha` is outside `[0, 1]`; use `try_new` for untrusted input.
    pub fn new(alpha: f64, initial_average: f64) -> Self {
        match Self::try_new(alpha, initial_average) {
            Ok(ewma) => ewma,
            Err(e) => panic!("{}", e),
        }
    }

    pub fn try_new(alpha: f64, initial_average: f64) -> Result<Self, InvalidAlpha> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(InvalidAlpha(alpha));
        }
        Ok(Self {
            alpha,
            average_bits: AtomicU64::new(initial_average.to_bits()),
        })
    }

    pub fn average(&self) -> f64 {
        f64::from_bits(self.average_bits.load(Ordering::Acquire))
    }

    pub fn add_value(&self, value: f64) {
        let mut current_bits = self.average_bits.load(Ordering::Acquire);
        loop {
            let current = f64::from_bits(current_bits);
            let next = self.alpha * value + (1.0 - self.alpha) * current;
            match self.average_bits.compare_exchange_weak(
                current_bits,
                next.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current_bits = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_rejects_out_of_range_alpha() {
        assert!(ExponentiallyWeightedMovingAverage::try_new(-0.1, 0.0).is_err());
        assert!(ExponentiallyWeightedMovingAverage::try_new(1.5, 0.0).is_err());
        assert!(ExponentiallyWeightedMovingAverage::try_new(f64::NAN, 0.0).is_err());
        assert!(ExponentiallyWeightedMovingAverage::try_new(0.0, 0.0).is_ok());
        assert!(ExponentiallyWeightedMovingAverage::try_new(1.0, 0.0).is_ok());
    }

    #[test]
    #[should_panic(expected = "alpha must be between 0 and 1")]
    fn test_new_panics_on_bad_alpha() {
        ExponentiallyWeightedMovingAverage::new(2.0, 0.0);
    }

    #[test]
    fn test_weighting() {
        let ewma = ExponentiallyWeightedMovingAverage::new(0.5, 10.0);
        ewma.add_value(20.0);
        assert!((ewma.average() - 15.0).abs() < 1e-9);

        let frozen = ExponentiallyWeightedMovingAverage::new(0.0, 10.0);
        frozen.add_value(1000.0);
        assert_eq!(frozen.average(), 10.0);
    }

    #[test]
    fn test_concurrent_updates_converge() {
        let ewma = Arc::new(ExponentiallyWeightedMovingAverage::new(0.3, 0.0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ewma = ewma.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        ewma.add_value(42.0);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!((ewma.average() - 42.0).abs() < 1e-6);
    }
}
