// Small concurrency helpers shared across the crate
pub mod ewma;
pub mod keyed_lock;

pub use ewma::ExponentiallyWeightedMovingAverage;
pub use keyed_lock::{KeyedLock, KeyedLockGuard};
