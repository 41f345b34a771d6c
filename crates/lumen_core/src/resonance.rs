use std::any::Any;
use std::f64::consts::{PI, TAU};
use std::panic::{catch_unwind, AssertUnwindSafe};

use anyhow::{anyhow, bail, Result};
use num_complex::Complex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ResonanceSettings {
    /// Entities beyond this many are ignored (the pairwise pass is quadratic).
    pub max_samples: usize,
    /// Pairs closer than this (radians) count as locked.
    pub lock_tolerance: f64,
}

impl Default for ResonanceSettings {
    fn default() -> Self {
        Self {
            max_samples: 256,
            lock_tolerance: 0.15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResonanceReport {
    pub order: f64,
    pub locked_pairs: usize,
    pub sampled: usize,
}

fn wrapped_distance(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(TAU);
    if d > PI {
        TAU - d
    } else {
        d
    }
}

/// Magnitude of the mean unit phasor of the sampled phases, plus the number of sampled
/// pairs within `lock_tolerance` of each other.
pub fn scan(phases: &[f64], settings: &ResonanceSettings) -> Result<ResonanceReport> {
    if settings.max_samples == 0 {
        bail!("max_samples must be greater than zero.");
    }
    if !settings.lock_tolerance.is_finite() || settings.lock_tolerance < 0.0 {
        bail!("lock_tolerance must be finite and non-negative.");
    }
    let sample = &phases[..phases.len().min(settings.max_samples)];
    if sample.is_empty() {
        return Ok(ResonanceReport::default());
    }
    if let Some(pos) = sample.iter().position(|p| !p.is_finite()) {
        bail!("Entity phase at index {} is not finite.", pos);
    }

    let sum: Complex<f64> = sample.iter().map(|&theta| Complex::from_polar(1.0, theta)).sum();
    let order = (sum / sample.len() as f64).norm();
    if !order.is_finite() {
        bail!("Order parameter is not finite.");
    }

    let mut locked_pairs = 0usize;
    for i in 0..sample.len() {
        for j in (i + 1)..sample.len() {
            if wrapped_distance(sample[i], sample[j]) <= settings.lock_tolerance {
                locked_pairs += 1;
            }
        }
    }

    Ok(ResonanceReport {
        order: order.clamp(0.0, 1.0),
        locked_pairs,
        sampled: sample.len(),
    })
}

fn panic_payload_to_string(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    "Resonance scan panicked.".to_string()
}

/// Runs `analysis` and converts both errors and panics into `Err`.
pub fn contained<T>(analysis: impl FnOnce() -> Result<T>) -> Result<T> {
    catch_unwind(AssertUnwindSafe(analysis))
        .map_err(|payload| anyhow!(panic_payload_to_string(payload)))?
}

/// Resonance subsystem state: the last report and whether the scan is still trusted.
#[derive(Debug, Clone)]
pub struct ResonanceMonitor {
    settings: ResonanceSettings,
    enabled: bool,
    last: ResonanceReport,
}

impl ResonanceMonitor {
    pub fn new(settings: ResonanceSettings) -> Self {
        Self {
            settings,
            enabled: true,
            last: ResonanceReport::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn last(&self) -> ResonanceReport {
        self.last
    }

    /// Order parameter fed to derivation; 0 once the subsystem is disabled.
    pub fn output(&self) -> f64 {
        if self.enabled {
            self.last.order
        } else {
            0.0
        }
    }

    /// Runs one contained scan. On failure the monitor disables itself and returns the
    /// reason; later calls do nothing until the monitor is rebuilt.
    pub fn run(&mut self, phases: &[f64]) -> Option<String> {
        let settings = self.settings;
        self.run_with(|| scan(phases, &settings))
    }

    pub fn run_with(&mut self, analysis: impl FnOnce() -> Result<ResonanceReport>) -> Option<String> {
        if !self.enabled {
            return None;
        }
        match contained(analysis) {
            Ok(report) => {
                self.last = report;
                None
            }
            Err(err) => {
                self.enabled = false;
                self.last = ResonanceReport::default();
                Some(err.to_string())
            }
        }
    }
}
