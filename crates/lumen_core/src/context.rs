//! Shared per-tick state read by every controller.
//!
//! Controllers never look each other up. Each one publishes a snapshot of its state here
//! after it updates, and reads the snapshots of the controllers that ran before it.

use crate::events::Diagnostics;
use crate::quality::QualityTier;
use crate::topology::Topology;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseSnapshot {
    pub index: u32,
    /// Index the phase controller will move to next (wrap-aware).
    pub next_index: u32,
    pub started_at_ms: f64,
    pub dwell_ms: f64,
}

impl PhaseSnapshot {
    /// Fraction of the minimum dwell already spent, in `[0, 1]`.
    pub fn dwell_fraction(&self, now_ms: f64) -> f64 {
        if self.dwell_ms <= 0.0 {
            return 1.0;
        }
        ((now_ms - self.started_at_ms) / self.dwell_ms).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TopologySnapshot {
    pub current: Topology,
    pub target: Topology,
    pub progress: f64,
    pub morph: f64,
}

impl TopologySnapshot {
    pub fn is_idle(&self) -> bool {
        self.current == self.target
    }
}

#[derive(Debug)]
pub struct EngineContext {
    pub diagnostics: Diagnostics,
    pub tick: u64,
    pub now_ms: f64,
    /// True while the phase sequence advances on its own.
    pub running: bool,
    pub quality_tier: QualityTier,
    pub phase: PhaseSnapshot,
    pub topology: TopologySnapshot,
    pub topology_override: Option<Topology>,
}

impl EngineContext {
    pub fn new(event_capacity: usize) -> Self {
        Self {
            diagnostics: Diagnostics::new(event_capacity),
            tick: 0,
            now_ms: 0.0,
            running: false,
            quality_tier: QualityTier::High,
            phase: PhaseSnapshot {
                index: 0,
                next_index: 1,
                started_at_ms: 0.0,
                dwell_ms: 0.0,
            },
            topology: TopologySnapshot {
                current: Topology::Sphere,
                target: Topology::Sphere,
                progress: 1.0,
                morph: 1.0,
            },
            topology_override: None,
        }
    }

    /// Moves the clock forward. A timestamp that is not finite or runs backwards keeps the
    /// previous one.
    pub fn advance_clock(&mut self, now_ms: f64) {
        self.tick += 1;
        if now_ms.is_finite() && now_ms >= self.now_ms {
            self.now_ms = now_ms;
        }
        self.diagnostics.stamp(self.tick, self.now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_ignores_bad_timestamps() {
        let mut ctx = EngineContext::new(4);
        ctx.advance_clock(100.0);
        ctx.advance_clock(f64::NAN);
        assert_eq!(ctx.now_ms, 100.0);
        ctx.advance_clock(50.0);
        assert_eq!(ctx.now_ms, 100.0);
        assert_eq!(ctx.tick, 3);
    }

    #[test]
    fn dwell_fraction_is_clamped() {
        let phase = PhaseSnapshot {
            index: 2,
            next_index: 3,
            started_at_ms: 1_000.0,
            dwell_ms: 2_000.0,
        };
        assert_eq!(phase.dwell_fraction(500.0), 0.0);
        assert!((phase.dwell_fraction(2_000.0) - 0.5).abs() < 1e-12);
        assert_eq!(phase.dwell_fraction(9_000.0), 1.0);
    }
}
