use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

use crate::phase::Observables;

/// A trait for numeric types that can pass through the sanitizer.
/// Must support finiteness checks, ordering, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// Decides whether the signals observed during a phase are strong enough to leave it.
pub trait ThresholdPredicate {
    /// index: the phase currently being dwelt in
    /// signals: the sanitized observables of this tick
    fn satisfied(&self, index: u32, signals: &Observables) -> bool;
}

impl<F> ThresholdPredicate for F
where
    F: Fn(u32, &Observables) -> bool,
{
    fn satisfied(&self, index: u32, signals: &Observables) -> bool {
        self(index, signals)
    }
}
