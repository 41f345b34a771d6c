//! The per-tick orchestration loop and its control surface.
//!
//! One [`Engine::tick`] runs, in order: clock, scheduled effects, override detection,
//! quality, topology, phase, phase blend, strided auxiliary work, derivation, override
//! application and the final range check. Topology reads the phase snapshot of the
//! previous tick; phase reads the topology snapshot of this one.

use std::collections::BTreeMap;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::cadence::AuxProcess;
use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::derive::{
    derive, spec_for, DerivationInputs, ParameterBag, Perturbation, PhaseBlend, FLAG_PARAMS,
};
use crate::error::EngineError;
use crate::events::{Diagnostics, Event, EventKind, EventSink, TracingSink};
use crate::overrides::{OverrideArbiter, ParamValue};
use crate::phase::{DefaultThresholds, Observables, PhaseController, PhaseStep};
use crate::quality::{QualityController, QualityTier};
use crate::resonance::{ResonanceMonitor, ResonanceReport};
use crate::sanitize::{guard, Bounds};
use crate::scheduler::{ActiveEffect, ScheduledEffect, Scheduler};
use crate::topology::{MorphDescriptor, Topology, TopologyMorphController};
use crate::traits::ThresholdPredicate;

/// Everything the collaborators report for one frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TickInput {
    pub now_ms: f64,
    pub frame_cost_ms: f64,
    pub observables: Observables,
    /// Latest externally visible value of each monitored parameter.
    pub monitored: BTreeMap<String, ParamValue>,
    /// Optional sample of entity phases (radians) for the resonance scan.
    pub entity_phases: Vec<f64>,
}

/// Read-only view for display collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub phase_index: u32,
    pub phase_name: String,
    pub topology_name: String,
    pub quality_tier: QualityTier,
    pub morph_progress: f64,
    pub tick: u64,
    pub running: bool,
    pub manual_mode: bool,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickOutput {
    pub params: ParameterBag,
    pub morph: MorphDescriptor,
    pub status: StatusSnapshot,
}

/// All mutable state of one engine generation.
#[derive(Debug)]
struct EngineState {
    ctx: EngineContext,
    quality: QualityController,
    topology: TopologyMorphController,
    phase: PhaseController,
    blend: PhaseBlend,
    arbiter: OverrideArbiter,
    scheduler: Scheduler,
    active: Vec<ActiveEffect>,
    resonance: ResonanceMonitor,
    rng: StdRng,
}

impl EngineState {
    fn build(
        config: &EngineConfig,
        predicate: Rc<dyn ThresholdPredicate>,
        diagnostics: Diagnostics,
        generation: u64,
    ) -> Self {
        let mut ctx = EngineContext::new(0);
        ctx.diagnostics = diagnostics;

        let quality = QualityController::new(config.quality.clone());
        ctx.quality_tier = quality.tier();
        let phase = PhaseController::new(config.phase.clone(), predicate);
        phase.publish(&mut ctx);

        Self {
            ctx,
            quality,
            topology: TopologyMorphController::new(config.topology.clone()),
            blend: PhaseBlend::new(phase.index()),
            phase,
            arbiter: OverrideArbiter::new(config.overrides),
            scheduler: Scheduler::new(generation),
            active: Vec::new(),
            resonance: ResonanceMonitor::new(config.resonance),
            rng: StdRng::seed_from_u64(config.seed.wrapping_add(generation)),
        }
    }
}

fn is_output_name(name: &str) -> bool {
    spec_for(name).is_some() || FLAG_PARAMS.contains(&name)
}

pub struct Engine {
    config: EngineConfig,
    predicate: Rc<dyn ThresholdPredicate>,
    state: EngineState,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let predicate = Rc::new(DefaultThresholds::new(config.phase.requirements.clone()));
        Self::with_predicate(config, predicate)
    }

    /// Builds an engine whose phase gate is `predicate` instead of the requirement table.
    pub fn with_predicate(
        config: EngineConfig,
        predicate: Rc<dyn ThresholdPredicate>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let mut diagnostics = Diagnostics::new(config.diagnostics.ring_capacity);
        if config.diagnostics.forward_to_tracing {
            diagnostics.subscribe(Box::new(TracingSink));
        }
        let state = EngineState::build(&config, predicate.clone(), diagnostics, 0);
        Ok(Self {
            config,
            predicate,
            state,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.state.ctx.running
    }

    pub fn generation(&self) -> u64 {
        self.state.scheduler.generation()
    }

    pub fn phase_index(&self) -> u32 {
        self.state.phase.index()
    }

    pub fn quality_tier(&self) -> QualityTier {
        self.state.quality.tier()
    }

    pub fn pinned_count(&self) -> usize {
        self.state.arbiter.pinned_count()
    }

    pub fn pending_tasks(&self) -> usize {
        self.state.scheduler.pending()
    }

    pub fn resonance_enabled(&self) -> bool {
        self.state.resonance.is_enabled()
    }

    pub fn resonance_report(&self) -> ResonanceReport {
        self.state.resonance.last()
    }

    pub fn subscribe(&mut self, sink: Box<dyn EventSink>) {
        self.state.ctx.diagnostics.subscribe(sink);
    }

    /// Removes and returns the buffered recent events.
    pub fn drain_events(&mut self) -> Vec<Event> {
        self.state.ctx.diagnostics.drain()
    }

    /// Starts auto-running the phase sequence at `now_ms` and schedules the configured
    /// effects. Does nothing while already running.
    pub fn start(&mut self, now_ms: f64) {
        let state = &mut self.state;
        if state.ctx.running {
            return;
        }
        let now_ms = if now_ms.is_finite() {
            now_ms.max(state.ctx.now_ms)
        } else {
            state.ctx.now_ms
        };
        state.ctx.now_ms = now_ms;
        state.ctx.running = true;
        state.phase.restart_clock(now_ms);
        state.phase.publish(&mut state.ctx);

        let jitter = self.config.perturbation_jitter;
        for entry in &self.config.effects {
            let effect = match &entry.effect {
                ScheduledEffect::Perturbation {
                    parameter,
                    factor,
                    duration_ms,
                } => {
                    let spread = if jitter > 0.0 {
                        state.rng.gen_range(-jitter..=jitter)
                    } else {
                        0.0
                    };
                    ScheduledEffect::Perturbation {
                        parameter: parameter.clone(),
                        factor: factor * (1.0 + spread),
                        duration_ms: *duration_ms,
                    }
                }
            };
            state.scheduler.schedule(now_ms, entry.delay_ms, effect);
        }

        let generation = state.scheduler.generation();
        state
            .ctx
            .diagnostics
            .emit(EventKind::EngineStarted { generation });
        tracing::info!(generation, pending = state.scheduler.pending(), "engine started");
    }

    /// Returns to idle with every controller rebuilt from the configuration. Tasks of
    /// the previous generation are dropped and disabled subsystems come back.
    /// Subscribers and buffered events carry over.
    pub fn reset(&mut self) {
        let dropped = self.state.scheduler.reset();
        let generation = self.state.scheduler.generation();
        let now_ms = self.state.ctx.now_ms;
        let diagnostics = std::mem::replace(&mut self.state.ctx.diagnostics, Diagnostics::new(0));

        let mut fresh = EngineState::build(&self.config, self.predicate.clone(), diagnostics, generation);
        fresh.ctx.now_ms = now_ms;
        fresh.ctx.diagnostics.stamp(0, now_ms);
        self.state = fresh;

        let diagnostics = &mut self.state.ctx.diagnostics;
        if dropped > 0 {
            diagnostics.emit(EventKind::ScheduledTasksCancelled {
                generation,
                count: dropped,
            });
        }
        diagnostics.emit(EventKind::EngineReset { generation });
    }

    /// Steps to the next phase (wrapping at the end). Only valid while idle.
    pub fn force_advance_phase(&mut self) -> Result<PhaseStep, EngineError> {
        if self.state.ctx.running {
            return Err(EngineError::AutoRunning);
        }
        Ok(self.state.phase.force_advance(&mut self.state.ctx))
    }

    pub fn set_manual_mode(&mut self, enabled: bool) {
        let state = &mut self.state;
        if state.arbiter.manual_mode() != enabled {
            state.arbiter.set_manual_mode(enabled);
            state
                .ctx
                .diagnostics
                .emit(EventKind::ManualModeChanged { enabled });
        }
    }

    pub fn set_topology_override(&mut self, topology: Option<Topology>) {
        self.state.ctx.topology_override = topology;
    }

    pub fn status(&self) -> StatusSnapshot {
        let state = &self.state;
        let index = state.phase.index();
        StatusSnapshot {
            phase_index: index,
            phase_name: state.phase.config().name(index),
            topology_name: state.ctx.topology.current.name().to_string(),
            quality_tier: state.quality.tier(),
            morph_progress: state.ctx.topology.morph,
            tick: state.ctx.tick,
            running: state.ctx.running,
            manual_mode: state.arbiter.manual_mode(),
            generation: state.scheduler.generation(),
        }
    }

    pub fn tick(&mut self, input: &TickInput) -> TickOutput {
        let state = &mut self.state;
        let ctx = &mut state.ctx;
        ctx.advance_clock(input.now_ms);
        let now_ms = ctx.now_ms;

        for task in state.scheduler.poll(now_ms) {
            match task.effect {
                ScheduledEffect::Perturbation {
                    parameter,
                    factor,
                    duration_ms,
                } => {
                    ctx.diagnostics.emit(EventKind::ScheduledEffectFired {
                        task: task.id.0,
                        parameter: parameter.clone(),
                    });
                    state.active.push(ActiveEffect {
                        parameter,
                        factor,
                        until_ms: now_ms + duration_ms,
                    });
                }
            }
        }
        state.active.retain(|effect| effect.until_ms >= now_ms);

        for (name, value) in &input.monitored {
            if is_output_name(name) {
                state
                    .arbiter
                    .observe(name, *value, now_ms, &mut ctx.diagnostics);
            }
        }

        let signals = input.observables.sanitized(&mut ctx.diagnostics);
        state.quality.update(input.frame_cost_ms, ctx);
        let morph = state.topology.update(&signals, ctx);
        state.phase.update(&signals, ctx);

        let phase_blend = state
            .blend
            .step(state.phase.index(), self.config.derivation.blend_rate);

        let tier_multiplier = state.quality.profile().stride_multiplier;
        let cadence = &self.config.cadence;
        if cadence.should_execute(AuxProcess::ResonanceScan, ctx.tick, tier_multiplier) {
            if let Some(reason) = state.resonance.run(&input.entity_phases) {
                tracing::warn!(process = AuxProcess::ResonanceScan.display_name(), %reason, "subsystem disabled");
                ctx.diagnostics.emit(EventKind::SubsystemDisabled {
                    process: AuxProcess::ResonanceScan,
                    reason,
                });
            }
        }
        if cadence.should_execute(AuxProcess::OverrideSweep, ctx.tick, tier_multiplier) {
            state.arbiter.sweep(now_ms, &mut ctx.diagnostics);
        }

        let perturbations: Vec<Perturbation> = state
            .active
            .iter()
            .map(|effect| Perturbation {
                parameter: effect.parameter.clone(),
                factor: effect.factor,
            })
            .collect();
        let derived = derive(
            &self.config.derivation,
            &DerivationInputs {
                profile: state.quality.profile(),
                phase_blend,
                morph: ctx.topology.morph,
                field_strength: signals.field_strength,
                coherence: signals.coherence,
                resonance: state.resonance.output(),
                perturbations: &perturbations,
            },
        );
        for event in derived.notes.into_iter().filter_map(|note| note.into_event()) {
            ctx.diagnostics.emit(event);
        }

        let mut published = BTreeMap::new();
        for (name, automatic) in derived.values {
            let chosen = state
                .arbiter
                .apply(&name, automatic, now_ms, &mut ctx.diagnostics);
            let value = match (automatic, chosen) {
                (ParamValue::Number(_), ParamValue::Number(v)) => {
                    let bounds = spec_for(&name).map(|s| s.bounds).unwrap_or_else(Bounds::unit);
                    ParamValue::Number(guard(&name, v, bounds, &mut ctx.diagnostics))
                }
                (ParamValue::Flag(_), ParamValue::Flag(v)) => ParamValue::Flag(v),
                // A pin of the wrong kind cannot replace the automatic value.
                (automatic, _) => automatic,
            };
            state.arbiter.sync(&name, value);
            published.insert(name, value);
        }

        TickOutput {
            params: ParameterBag::from_map(published),
            morph,
            status: self.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive::{BRIGHTNESS, NUMERIC_PARAMS};
    use crate::events::RecordingSink;

    fn quiet_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.diagnostics.forward_to_tracing = false;
        config
    }

    fn input(now_ms: f64) -> TickInput {
        TickInput {
            now_ms,
            frame_cost_ms: 12.0,
            ..TickInput::default()
        }
    }

    #[test]
    fn idle_ticks_derive_but_hold_the_phase() {
        let mut engine = Engine::new(quiet_config()).expect("engine");
        for i in 1..200 {
            let out = engine.tick(&input(i as f64 * 1_000.0));
            assert_eq!(out.status.phase_index, 0);
            assert!(!out.status.running);
            assert_eq!(out.params.len(), NUMERIC_PARAMS.len() + FLAG_PARAMS.len());
        }
    }

    #[test]
    fn force_advance_requires_idle() {
        let mut engine = Engine::new(quiet_config()).expect("engine");
        assert_eq!(
            engine.force_advance_phase().expect("idle"),
            PhaseStep::Advanced { from: 0, to: 1 }
        );
        engine.start(0.0);
        assert!(matches!(
            engine.force_advance_phase(),
            Err(EngineError::AutoRunning)
        ));
        engine.reset();
        assert_eq!(engine.phase_index(), 0);
        assert!(engine.force_advance_phase().is_ok());
    }

    #[test]
    fn echoed_outputs_do_not_pin() {
        let mut engine = Engine::new(quiet_config()).expect("engine");
        let mut monitored = BTreeMap::new();
        for i in 1..50 {
            let out = engine.tick(&TickInput {
                monitored: monitored.clone(),
                ..input(i as f64 * 16.0)
            });
            monitored = out.params.iter().map(|(k, v)| (k.to_string(), v)).collect();
        }
        assert_eq!(engine.pinned_count(), 0);
    }

    #[test]
    fn manual_mode_freezes_published_values() {
        let mut engine = Engine::new(quiet_config()).expect("engine");
        engine.start(0.0);
        let first = engine.tick(&input(16.0));
        engine.set_manual_mode(true);
        let mut last = first.clone();
        for i in 2..400 {
            last = engine.tick(&input(i as f64 * 16.0));
        }
        assert_eq!(first.params.number(BRIGHTNESS), last.params.number(BRIGHTNESS));
        assert!(last.status.manual_mode);
    }

    #[test]
    fn wrong_kind_pins_are_ignored() {
        let mut engine = Engine::new(quiet_config()).expect("engine");
        let out = engine.tick(&input(16.0));
        let bloom = out.params.flag(crate::derive::BLOOM);
        let mut monitored = BTreeMap::new();
        monitored.insert("bloom".to_string(), ParamValue::Number(3.0));
        let out = engine.tick(&TickInput {
            monitored,
            ..input(32.0)
        });
        assert_eq!(out.params.flag(crate::derive::BLOOM), bloom);
    }

    #[test]
    fn reset_keeps_subscribers() {
        let sink = RecordingSink::new();
        let mut engine = Engine::new(quiet_config()).expect("engine");
        engine.subscribe(Box::new(sink.clone()));
        engine.reset();
        engine.start(100.0);
        assert_eq!(sink.count(|k| matches!(k, EventKind::EngineReset { generation: 1 })), 1);
        assert_eq!(sink.count(|k| matches!(k, EventKind::EngineStarted { generation: 1 })), 1);
    }
}
