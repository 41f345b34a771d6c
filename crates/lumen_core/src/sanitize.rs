use serde::{Deserialize, Serialize};

use crate::events::{Diagnostics, EventKind};
use crate::traits::Scalar;

/// What the sanitizer had to do to a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repair {
    None,
    /// The value was NaN or infinite and the fallback was used.
    NonFinite,
    /// The value was finite but outside `[min, max]`.
    Clamped,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sanitized<T> {
    pub value: T,
    pub repair: Repair,
}

/// Declared range and fallback of one numeric quantity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
    pub fallback: f64,
}

impl Bounds {
    pub const fn new(min: f64, max: f64, fallback: f64) -> Self {
        Self { min, max, fallback }
    }

    pub fn unit() -> Self {
        Self::new(0.0, 1.0, 0.0)
    }
}

/// Returns `fallback` when `value` is not finite, otherwise `value` clamped to `[min, max]`.
///
/// The result is always inside the range: a reversed range is swapped and an out-of-range
/// or non-finite fallback is itself pulled into the range (non-finite bounds collapse to zero).
pub fn sanitize<T: Scalar>(value: T, fallback: T, min: T, max: T) -> Sanitized<T> {
    let zero = T::zero();
    let (lo, hi) = {
        let lo = if min.is_finite() { min } else { zero };
        let hi = if max.is_finite() { max } else { zero };
        if lo <= hi {
            (lo, hi)
        } else {
            (hi, lo)
        }
    };

    if !value.is_finite() {
        let fallback = if fallback.is_finite() { fallback } else { lo };
        return Sanitized {
            value: clamp(fallback, lo, hi),
            repair: Repair::NonFinite,
        };
    }

    let clamped = clamp(value, lo, hi);
    let repair = if clamped != value {
        Repair::Clamped
    } else {
        Repair::None
    };
    Sanitized {
        value: clamped,
        repair,
    }
}

fn clamp<T: Scalar>(value: T, lo: T, hi: T) -> T {
    value.max(lo).min(hi)
}

/// Remembers a repair the pure derivation step could not report itself.
#[derive(Debug, Clone, PartialEq)]
pub struct RepairNote {
    pub name: String,
    pub repair: Repair,
    pub original: f64,
    pub bounds: Bounds,
}

impl RepairNote {
    pub fn into_event(self) -> Option<EventKind> {
        match self.repair {
            Repair::None => None,
            Repair::NonFinite => Some(EventKind::NumericRepair {
                name: self.name,
                fallback: self.bounds.fallback,
            }),
            Repair::Clamped => Some(EventKind::ValueClamped {
                name: self.name,
                value: self.original,
                min: self.bounds.min,
                max: self.bounds.max,
            }),
        }
    }
}

/// Sanitizes `value` against `bounds`, recording a note when a repair occurred.
pub fn guard_noted(name: &str, value: f64, bounds: Bounds, notes: &mut Vec<RepairNote>) -> f64 {
    let out = sanitize(value, bounds.fallback, bounds.min, bounds.max);
    if out.repair != Repair::None {
        notes.push(RepairNote {
            name: name.to_string(),
            repair: out.repair,
            original: value,
            bounds,
        });
    }
    out.value
}

/// Sanitizes `value` and emits the matching diagnostic immediately.
pub fn guard(name: &str, value: f64, bounds: Bounds, diagnostics: &mut Diagnostics) -> f64 {
    let mut notes = Vec::new();
    let out = guard_noted(name, value, bounds, &mut notes);
    for note in notes {
        if let Some(kind) = note.into_event() {
            diagnostics.emit(kind);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;

    #[test]
    fn non_finite_values_use_fallback() {
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let out = sanitize(bad, 2.0, 0.0, 10.0);
            assert_eq!(out.value, 2.0);
            assert_eq!(out.repair, Repair::NonFinite);
        }
    }

    #[test]
    fn finite_values_are_clamped() {
        assert_eq!(sanitize(12.0, 1.0, 0.0, 10.0).value, 10.0);
        assert_eq!(sanitize(-3.0, 1.0, 0.0, 10.0).value, 0.0);
        let inside = sanitize(4.5, 1.0, 0.0, 10.0);
        assert_eq!(inside.value, 4.5);
        assert_eq!(inside.repair, Repair::None);
    }

    #[test]
    fn fallback_outside_range_is_pulled_in() {
        let out = sanitize(f64::NAN, 99.0, 0.1, 50.0);
        assert_eq!(out.value, 50.0);
        let out = sanitize(f64::NAN, f64::NAN, 0.1, 50.0);
        assert_eq!(out.value, 0.1);
    }

    #[test]
    fn reversed_range_is_swapped() {
        assert_eq!(sanitize(7.0, 0.0, 5.0, 1.0).value, 5.0);
    }

    #[test]
    fn works_for_f32() {
        let out = sanitize(f32::NAN, 0.5f32, 0.0, 1.0);
        assert_eq!(out.value, 0.5f32);
    }

    #[test]
    fn guard_emits_repair_diagnostics() {
        let sink = RecordingSink::new();
        let mut diagnostics = Diagnostics::new(8);
        diagnostics.subscribe(Box::new(sink.clone()));

        let bounds = Bounds::new(0.1, 50.0, 1.0);
        assert_eq!(guard("brightness", f64::NAN, bounds, &mut diagnostics), 1.0);
        assert_eq!(guard("brightness", 80.0, bounds, &mut diagnostics), 50.0);
        assert_eq!(guard("brightness", 3.0, bounds, &mut diagnostics), 3.0);

        assert_eq!(
            sink.count(|kind| matches!(kind, EventKind::NumericRepair { .. })),
            1
        );
        assert_eq!(
            sink.count(|kind| matches!(kind, EventKind::ValueClamped { .. })),
            1
        );
    }
}
