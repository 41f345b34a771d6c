use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::context::{EngineContext, PhaseSnapshot};
use crate::events::{Diagnostics, EventKind};
use crate::sanitize::{guard, Bounds};
use crate::traits::ThresholdPredicate;

/// Activity signals reported by the renderer each tick.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Observables {
    pub particle_count: f64,
    pub field_strength: f64,
    pub coherence: f64,
    pub recursion: f64,
    pub strand_count: f64,
}

impl Observables {
    const PARTICLES: Bounds = Bounds::new(0.0, 10_000_000.0, 0.0);
    const FIELD: Bounds = Bounds::new(0.0, 10_000.0, 0.0);
    const COHERENCE: Bounds = Bounds::new(0.0, 1.0, 0.0);
    const RECURSION: Bounds = Bounds::new(0.0, 64.0, 1.0);
    const STRANDS: Bounds = Bounds::new(0.0, 4_096.0, 1.0);

    /// Copy with every field finite and inside its range.
    pub fn sanitized(&self, diagnostics: &mut Diagnostics) -> Observables {
        Observables {
            particle_count: guard("particle_count", self.particle_count, Self::PARTICLES, diagnostics),
            field_strength: guard("field_strength", self.field_strength, Self::FIELD, diagnostics),
            coherence: guard("coherence", self.coherence, Self::COHERENCE, diagnostics),
            recursion: guard("recursion", self.recursion, Self::RECURSION, diagnostics),
            strand_count: guard("strand_count", self.strand_count, Self::STRANDS, diagnostics),
        }
    }

    fn components(&self) -> [f64; 5] {
        [
            self.particle_count,
            self.field_strength,
            self.coherence,
            self.recursion,
            self.strand_count,
        ]
    }

    fn improves_on(&self, best: &Observables, epsilon: f64) -> bool {
        self.components()
            .iter()
            .zip(best.components().iter())
            .any(|(now, best)| *now > *best + epsilon)
    }

    fn max(&self, other: &Observables) -> Observables {
        Observables {
            particle_count: self.particle_count.max(other.particle_count),
            field_strength: self.field_strength.max(other.field_strength),
            coherence: self.coherence.max(other.coherence),
            recursion: self.recursion.max(other.recursion),
            strand_count: self.strand_count.max(other.strand_count),
        }
    }
}

/// What happens when the threshold predicate keeps failing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum StallPolicy {
    /// Wait for the predicate indefinitely.
    Strict,
    /// After `stall_ms` without any signal improving, advance on dwell alone.
    TimeOnly { stall_ms: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseRequirement {
    pub min_particles: f64,
    pub min_field: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    pub max_phase: u32,
    /// Index the sequence resumes from after the terminal hold.
    pub restart_floor: u32,
    pub dwell_ms: f64,
    pub observation_dwell_ms: f64,
    pub observation_first: u32,
    pub observation_last: u32,
    /// Dwell at `max_phase` before wrapping to `restart_floor`.
    pub terminal_hold_ms: f64,
    pub stall_policy: StallPolicy,
    pub improvement_epsilon: f64,
    pub requirements: Vec<PhaseRequirement>,
    pub names: Vec<String>,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        let max_phase = 12;
        Self {
            max_phase,
            restart_floor: 1,
            dwell_ms: 8_000.0,
            observation_dwell_ms: 20_000.0,
            observation_first: 5,
            observation_last: 8,
            terminal_hold_ms: 30_000.0,
            stall_policy: StallPolicy::TimeOnly { stall_ms: 45_000.0 },
            improvement_epsilon: 0.01,
            requirements: (0..=max_phase)
                .map(|i| PhaseRequirement {
                    min_particles: 250.0 * i as f64,
                    min_field: 0.05 * i as f64,
                })
                .collect(),
            names: default_phase_names(max_phase),
        }
    }
}

pub fn default_phase_names(max_phase: u32) -> Vec<String> {
    (0..=max_phase).map(|i| format!("Phase {i}")).collect()
}

impl PhaseConfig {
    pub fn is_observation(&self, index: u32) -> bool {
        (self.observation_first..=self.observation_last).contains(&index)
    }

    pub fn dwell_for(&self, index: u32) -> f64 {
        if index >= self.max_phase {
            self.terminal_hold_ms
        } else if self.is_observation(index) {
            self.observation_dwell_ms
        } else {
            self.dwell_ms
        }
    }

    pub fn next_index(&self, index: u32) -> u32 {
        if index >= self.max_phase {
            self.restart_floor
        } else {
            index + 1
        }
    }

    pub fn name(&self, index: u32) -> String {
        self.names
            .get(index as usize)
            .cloned()
            .unwrap_or_else(|| format!("Phase {index}"))
    }
}

/// Count and magnitude gates from the configured requirement table.
#[derive(Debug, Clone)]
pub struct DefaultThresholds {
    requirements: Vec<PhaseRequirement>,
}

impl DefaultThresholds {
    pub fn new(requirements: Vec<PhaseRequirement>) -> Self {
        Self { requirements }
    }
}

impl ThresholdPredicate for DefaultThresholds {
    fn satisfied(&self, index: u32, signals: &Observables) -> bool {
        let requirement = self
            .requirements
            .get(index as usize)
            .or_else(|| self.requirements.last());
        match requirement {
            Some(req) => {
                signals.particle_count >= req.min_particles && signals.field_strength >= req.min_field
            }
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum PhaseStep {
    Held,
    Advanced { from: u32, to: u32 },
    Wrapped { from: u32, to: u32 },
}

pub struct PhaseController {
    config: PhaseConfig,
    predicate: Rc<dyn ThresholdPredicate>,
    index: u32,
    started_at_ms: f64,
    best: Option<Observables>,
    last_improvement_ms: f64,
    fallback_reported: bool,
}

impl fmt::Debug for PhaseController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseController")
            .field("index", &self.index)
            .field("started_at_ms", &self.started_at_ms)
            .field("best", &self.best)
            .field("last_improvement_ms", &self.last_improvement_ms)
            .finish()
    }
}

impl PhaseController {
    pub fn new(config: PhaseConfig, predicate: Rc<dyn ThresholdPredicate>) -> Self {
        Self {
            config,
            predicate,
            index: 0,
            started_at_ms: 0.0,
            best: None,
            last_improvement_ms: 0.0,
            fallback_reported: false,
        }
    }

    pub fn with_default_thresholds(config: PhaseConfig) -> Self {
        let predicate = Rc::new(DefaultThresholds::new(config.requirements.clone()));
        Self::new(config, predicate)
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn started_at_ms(&self) -> f64 {
        self.started_at_ms
    }

    pub fn config(&self) -> &PhaseConfig {
        &self.config
    }

    pub fn dwell_ms(&self) -> f64 {
        self.config.dwell_for(self.index)
    }

    /// Starts the dwell clock of the current phase at `now_ms`.
    pub fn restart_clock(&mut self, now_ms: f64) {
        self.started_at_ms = now_ms;
        self.last_improvement_ms = now_ms;
        self.best = None;
        self.fallback_reported = false;
    }

    pub fn publish(&self, ctx: &mut EngineContext) {
        ctx.phase = PhaseSnapshot {
            index: self.index,
            next_index: self.config.next_index(self.index),
            started_at_ms: self.started_at_ms,
            dwell_ms: self.dwell_ms(),
        };
    }

    fn threshold_met(&mut self, signals: &Observables, ctx: &mut EngineContext) -> bool {
        if self.predicate.satisfied(self.index, signals) {
            return true;
        }
        match self.config.stall_policy {
            StallPolicy::Strict => false,
            StallPolicy::TimeOnly { stall_ms } => {
                let stalled_ms = ctx.now_ms - self.last_improvement_ms;
                if stalled_ms < stall_ms {
                    return false;
                }
                if !self.fallback_reported {
                    self.fallback_reported = true;
                    ctx.diagnostics.emit(EventKind::LivenessFallback {
                        index: self.index,
                        stalled_ms,
                    });
                }
                true
            }
        }
    }

    fn track_improvement(&mut self, signals: &Observables, now_ms: f64) {
        match self.best {
            None => self.best = Some(*signals),
            Some(best) => {
                if signals.improves_on(&best, self.config.improvement_epsilon) {
                    self.last_improvement_ms = now_ms;
                    self.fallback_reported = false;
                }
                self.best = Some(best.max(signals));
            }
        }
    }

    /// Runs the advance check for this tick. Only moves while `ctx.running`.
    pub fn update(&mut self, signals: &Observables, ctx: &mut EngineContext) -> PhaseStep {
        if !ctx.running {
            self.publish(ctx);
            return PhaseStep::Held;
        }

        let now_ms = ctx.now_ms;
        self.track_improvement(signals, now_ms);

        let dwell_elapsed = now_ms - self.started_at_ms >= self.dwell_ms();
        let topology_idle = ctx.topology.is_idle();

        let step = if !dwell_elapsed || !topology_idle {
            PhaseStep::Held
        } else if self.index >= self.config.max_phase {
            self.commit(self.config.restart_floor, false, ctx)
        } else if self.threshold_met(signals, ctx) {
            self.commit(self.index + 1, false, ctx)
        } else {
            PhaseStep::Held
        };

        self.publish(ctx);
        step
    }

    /// Moves to the next phase regardless of dwell and thresholds.
    pub fn force_advance(&mut self, ctx: &mut EngineContext) -> PhaseStep {
        let next = self.config.next_index(self.index);
        let step = self.commit(next, true, ctx);
        self.publish(ctx);
        step
    }

    /// Requests an arbitrary index. Anything other than +1 or the terminal wrap is
    /// corrected: jumps clamp to +1, regressions are refused.
    pub fn request(&mut self, proposed: u32, ctx: &mut EngineContext) -> PhaseStep {
        let step = self.commit(proposed, false, ctx);
        self.publish(ctx);
        step
    }

    fn commit(&mut self, proposed: u32, forced: bool, ctx: &mut EngineContext) -> PhaseStep {
        let from = self.index;
        if proposed == from {
            return PhaseStep::Held;
        }

        if from >= self.config.max_phase && proposed == self.config.restart_floor {
            self.index = proposed;
            self.restart_clock(ctx.now_ms);
            ctx.diagnostics
                .emit(EventKind::PhaseWrapped { from, to: proposed });
            return PhaseStep::Wrapped { from, to: proposed };
        }

        if proposed < from {
            ctx.diagnostics
                .emit(EventKind::IllegalPhaseRegression { from, proposed });
            return PhaseStep::Held;
        }

        let committed = (from + 1).min(self.config.max_phase);
        if proposed > from + 1 || committed != proposed {
            ctx.diagnostics.emit(EventKind::IllegalPhaseJump {
                from,
                proposed,
                committed,
            });
        }
        if committed == from {
            return PhaseStep::Held;
        }

        self.index = committed;
        self.restart_clock(ctx.now_ms);
        ctx.diagnostics.emit(EventKind::PhaseAdvanced {
            from,
            to: committed,
            forced,
        });
        PhaseStep::Advanced {
            from,
            to: committed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;

    fn always(_: u32, _: &Observables) -> bool {
        true
    }

    fn never(_: u32, _: &Observables) -> bool {
        false
    }

    fn controller(config: PhaseConfig, predicate: fn(u32, &Observables) -> bool) -> PhaseController {
        PhaseController::new(config, Rc::new(predicate))
    }

    fn running_ctx() -> (EngineContext, RecordingSink) {
        let sink = RecordingSink::new();
        let mut ctx = EngineContext::new(64);
        ctx.diagnostics.subscribe(Box::new(sink.clone()));
        ctx.running = true;
        (ctx, sink)
    }

    fn tick_at(
        controller: &mut PhaseController,
        ctx: &mut EngineContext,
        now_ms: f64,
        signals: &Observables,
    ) -> PhaseStep {
        ctx.advance_clock(now_ms);
        controller.update(signals, ctx)
    }

    #[test]
    fn advances_after_dwell_with_threshold_and_idle_topology() {
        let mut phase = controller(PhaseConfig::default(), always);
        let (mut ctx, _) = running_ctx();
        phase.restart_clock(0.0);

        let held = tick_at(&mut phase, &mut ctx, 7_999.0, &Observables::default());
        assert_eq!(held, PhaseStep::Held);

        let step = tick_at(&mut phase, &mut ctx, 8_001.0, &Observables::default());
        assert_eq!(step, PhaseStep::Advanced { from: 0, to: 1 });
        assert_eq!(phase.index(), 1);
        assert_eq!(phase.started_at_ms(), 8_001.0);
        assert_eq!(ctx.phase.index, 1);
    }

    #[test]
    fn holds_while_topology_is_transitioning() {
        let mut phase = controller(PhaseConfig::default(), always);
        let (mut ctx, _) = running_ctx();
        ctx.topology.target = crate::topology::Topology::Torus;
        let step = tick_at(&mut phase, &mut ctx, 60_000.0, &Observables::default());
        assert_eq!(step, PhaseStep::Held);
        assert_eq!(phase.index(), 0);
    }

    #[test]
    fn holds_when_not_running() {
        let mut phase = controller(PhaseConfig::default(), always);
        let (mut ctx, _) = running_ctx();
        ctx.running = false;
        let step = tick_at(&mut phase, &mut ctx, 60_000.0, &Observables::default());
        assert_eq!(step, PhaseStep::Held);
    }

    #[test]
    fn observation_phases_dwell_longer() {
        let config = PhaseConfig::default();
        assert_eq!(config.dwell_for(2), 8_000.0);
        assert_eq!(config.dwell_for(5), 20_000.0);
        assert_eq!(config.dwell_for(8), 20_000.0);
        assert_eq!(config.dwell_for(9), 8_000.0);
        assert_eq!(config.dwell_for(12), 30_000.0);
    }

    #[test]
    fn index_moves_at_most_one_per_tick_and_wraps_to_floor() {
        let config = PhaseConfig {
            max_phase: 4,
            restart_floor: 1,
            dwell_ms: 100.0,
            observation_first: 10,
            observation_last: 10,
            terminal_hold_ms: 500.0,
            ..PhaseConfig::default()
        };
        let mut phase = controller(config, always);
        let (mut ctx, sink) = running_ctx();

        let mut previous = phase.index();
        let mut wrapped = false;
        for tick in 1..2_000 {
            tick_at(&mut phase, &mut ctx, tick as f64 * 16.0, &Observables::default());
            let index = phase.index();
            if index < previous {
                assert_eq!(previous, 4);
                assert_eq!(index, 1);
                wrapped = true;
            } else {
                assert!(index <= previous + 1);
            }
            assert!(index <= 4);
            previous = index;
        }
        assert!(wrapped);
        assert!(sink.count(|k| matches!(k, EventKind::PhaseWrapped { .. })) >= 1);
        assert_eq!(sink.count(EventKind::is_defect), 0);
    }

    #[test]
    fn oversized_jumps_are_clamped_and_reported() {
        let mut phase = controller(PhaseConfig::default(), never);
        let (mut ctx, sink) = running_ctx();
        let step = phase.request(5, &mut ctx);
        assert_eq!(step, PhaseStep::Advanced { from: 0, to: 1 });
        assert_eq!(phase.index(), 1);
        assert_eq!(
            sink.count(|k| matches!(
                k,
                EventKind::IllegalPhaseJump {
                    from: 0,
                    proposed: 5,
                    committed: 1
                }
            )),
            1
        );
    }

    #[test]
    fn regressions_are_refused() {
        let mut phase = controller(PhaseConfig::default(), never);
        let (mut ctx, sink) = running_ctx();
        phase.request(1, &mut ctx);
        phase.request(2, &mut ctx);
        assert_eq!(phase.request(0, &mut ctx), PhaseStep::Held);
        assert_eq!(phase.index(), 2);
        assert_eq!(
            sink.count(|k| matches!(k, EventKind::IllegalPhaseRegression { .. })),
            1
        );
    }

    #[test]
    fn strict_policy_never_degrades() {
        let config = PhaseConfig {
            stall_policy: StallPolicy::Strict,
            ..PhaseConfig::default()
        };
        let mut phase = controller(config, never);
        let (mut ctx, _) = running_ctx();
        for tick in 1..100 {
            tick_at(&mut phase, &mut ctx, tick as f64 * 10_000.0, &Observables::default());
        }
        assert_eq!(phase.index(), 0);
    }

    #[test]
    fn stalled_signals_fall_back_to_time_only() {
        let config = PhaseConfig {
            stall_policy: StallPolicy::TimeOnly { stall_ms: 20_000.0 },
            ..PhaseConfig::default()
        };
        let mut phase = controller(config, never);
        let (mut ctx, sink) = running_ctx();
        phase.restart_clock(0.0);

        assert_eq!(
            tick_at(&mut phase, &mut ctx, 10_000.0, &Observables::default()),
            PhaseStep::Held
        );
        assert_eq!(
            tick_at(&mut phase, &mut ctx, 20_000.0, &Observables::default()),
            PhaseStep::Advanced { from: 0, to: 1 }
        );
        assert_eq!(
            sink.count(|k| matches!(k, EventKind::LivenessFallback { index: 0, .. })),
            1
        );
    }

    #[test]
    fn improving_signals_postpone_the_fallback() {
        let config = PhaseConfig {
            stall_policy: StallPolicy::TimeOnly { stall_ms: 20_000.0 },
            ..PhaseConfig::default()
        };
        let mut phase = controller(config, never);
        let (mut ctx, _) = running_ctx();
        phase.restart_clock(0.0);

        for step in 0..30 {
            let signals = Observables {
                particle_count: step as f64 * 10.0,
                ..Observables::default()
            };
            tick_at(&mut phase, &mut ctx, step as f64 * 1_000.0, &signals);
        }
        assert_eq!(phase.index(), 0);
    }

    #[test]
    fn default_thresholds_gate_on_count_and_magnitude() {
        let thresholds = DefaultThresholds::new(PhaseConfig::default().requirements);
        let weak = Observables {
            particle_count: 600.0,
            field_strength: 0.05,
            ..Observables::default()
        };
        let strong = Observables {
            particle_count: 600.0,
            field_strength: 0.2,
            ..Observables::default()
        };
        assert!(thresholds.satisfied(0, &weak));
        assert!(!thresholds.satisfied(2, &weak));
        assert!(thresholds.satisfied(2, &strong));
        assert!(!thresholds.satisfied(3, &strong));
    }

    #[test]
    fn default_thresholds_hold_until_signals_qualify() {
        let mut phase = PhaseController::with_default_thresholds(PhaseConfig {
            stall_policy: StallPolicy::Strict,
            ..PhaseConfig::default()
        });
        let (mut ctx, _) = running_ctx();
        phase.restart_clock(0.0);

        let quiet = Observables::default();
        assert_eq!(
            tick_at(&mut phase, &mut ctx, 8_001.0, &quiet),
            PhaseStep::Advanced { from: 0, to: 1 }
        );
        assert_eq!(tick_at(&mut phase, &mut ctx, 20_000.0, &quiet), PhaseStep::Held);

        let qualified = Observables {
            particle_count: 300.0,
            field_strength: 0.06,
            ..Observables::default()
        };
        assert_eq!(
            tick_at(&mut phase, &mut ctx, 20_016.0, &qualified),
            PhaseStep::Advanced { from: 1, to: 2 }
        );
    }

    #[test]
    fn force_advance_wraps_at_the_end() {
        let config = PhaseConfig {
            max_phase: 2,
            restart_floor: 1,
            names: default_phase_names(2),
            ..PhaseConfig::default()
        };
        let mut phase = controller(config, never);
        let (mut ctx, _) = running_ctx();
        assert_eq!(phase.force_advance(&mut ctx), PhaseStep::Advanced { from: 0, to: 1 });
        assert_eq!(phase.force_advance(&mut ctx), PhaseStep::Advanced { from: 1, to: 2 });
        assert_eq!(phase.force_advance(&mut ctx), PhaseStep::Wrapped { from: 2, to: 1 });
        assert_eq!(ctx.phase.index, 1);
        assert_eq!(ctx.phase.next_index, 2);
    }

    #[test]
    fn sanitized_observables_are_finite() {
        let mut diagnostics = Diagnostics::new(8);
        let raw = Observables {
            particle_count: f64::INFINITY,
            field_strength: -4.0,
            coherence: f64::NAN,
            recursion: 3.0,
            strand_count: 12.0,
        };
        let clean = raw.sanitized(&mut diagnostics);
        assert_eq!(clean.particle_count, 0.0);
        assert_eq!(clean.field_strength, 0.0);
        assert_eq!(clean.coherence, 0.0);
        assert_eq!(clean.recursion, 3.0);
        assert_eq!(diagnostics.drain().len(), 3);
    }
}
