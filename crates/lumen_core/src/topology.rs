use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::context::{EngineContext, TopologySnapshot};
use crate::error::EngineError;
use crate::events::EventKind;
use crate::phase::Observables;
use crate::sanitize::sanitize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    Sphere,
    Torus,
    Mobius,
    Hyperbolic,
}

impl Topology {
    pub fn all() -> [Topology; 4] {
        [
            Topology::Sphere,
            Topology::Torus,
            Topology::Mobius,
            Topology::Hyperbolic,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Topology::Sphere => "sphere",
            Topology::Torus => "torus",
            Topology::Mobius => "mobius",
            Topology::Hyperbolic => "hyperbolic",
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Topology {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Topology::all()
            .into_iter()
            .find(|t| t.name() == needle)
            .ok_or_else(|| EngineError::UnknownTopology(s.to_string()))
    }
}

/// Phases from `first_phase` up to the next range's start map to `topology`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TopologyRange {
    pub first_phase: u32,
    pub topology: Topology,
}

/// Topology for `phase` given contiguous ranges sorted by `first_phase`.
pub fn topology_for_phase(ranges: &[TopologyRange], phase: u32) -> Topology {
    ranges
        .iter()
        .take_while(|range| range.first_phase <= phase)
        .last()
        .or_else(|| ranges.first())
        .map(|range| range.topology)
        .unwrap_or(Topology::Sphere)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub ranges: Vec<TopologyRange>,
    /// Progress added per tick while transitioning.
    pub transition_rate: f64,
    pub completion_threshold: f64,
    /// Morph deltas above this damp the next progress step.
    pub spike_threshold: f64,
    pub slowdown_factor: f64,
    pub ease_rate: f64,
    /// Largest change of the morph signal in one tick.
    pub max_delta: f64,
    /// Dwell fraction after which the morph signal starts ramping down ahead of a
    /// topology change. 1.0 disables the ramp.
    pub ramp_start_fraction: f64,
    pub max_recursion_depth: u32,
    pub max_strand_count: u32,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            ranges: vec![
                TopologyRange {
                    first_phase: 0,
                    topology: Topology::Sphere,
                },
                TopologyRange {
                    first_phase: 3,
                    topology: Topology::Torus,
                },
                TopologyRange {
                    first_phase: 5,
                    topology: Topology::Mobius,
                },
                TopologyRange {
                    first_phase: 7,
                    topology: Topology::Hyperbolic,
                },
            ],
            transition_rate: 0.01,
            completion_threshold: 0.99,
            spike_threshold: 0.015,
            slowdown_factor: 0.5,
            ease_rate: 0.08,
            max_delta: 0.02,
            ramp_start_fraction: 0.8,
            max_recursion_depth: 6,
            max_strand_count: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TopologyState {
    Settled {
        current: Topology,
    },
    Transitioning {
        from: Topology,
        to: Topology,
        progress: f64,
    },
}

impl TopologyState {
    pub fn current(&self) -> Topology {
        match *self {
            TopologyState::Settled { current } => current,
            TopologyState::Transitioning { from, .. } => from,
        }
    }

    pub fn target(&self) -> Topology {
        match *self {
            TopologyState::Settled { current } => current,
            TopologyState::Transitioning { to, .. } => to,
        }
    }

    pub fn progress(&self) -> f64 {
        match *self {
            TopologyState::Settled { .. } => 1.0,
            TopologyState::Transitioning { progress, .. } => progress,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, TopologyState::Settled { .. })
    }
}

/// Scalar in `[0, 1]` eased toward a desired value with a per-tick cap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MorphSignal {
    pub value: f64,
    pub last_delta: f64,
}

impl MorphSignal {
    pub fn settled() -> Self {
        Self {
            value: 1.0,
            last_delta: 0.0,
        }
    }

    pub fn ease_toward(&mut self, desired: f64, ease_rate: f64, max_delta: f64) -> f64 {
        let desired = sanitize(desired, self.value, 0.0, 1.0).value;
        let step = ((desired - self.value) * ease_rate).clamp(-max_delta, max_delta);
        let next = (self.value + step).clamp(0.0, 1.0);
        self.last_delta = next - self.value;
        self.value = next;
        self.last_delta
    }
}

/// What the renderer needs to draw the current shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MorphDescriptor {
    pub from: Topology,
    pub to: Topology,
    pub progress: f64,
    pub recursion_depth: u32,
    pub strand_count: u32,
    pub coherence: f64,
}

fn smoothstep(x: f64) -> f64 {
    let x = x.clamp(0.0, 1.0);
    x * x * (3.0 - 2.0 * x)
}

#[derive(Debug, Clone)]
pub struct TopologyMorphController {
    config: TopologyConfig,
    state: TopologyState,
    morph: MorphSignal,
    ignored_override: Option<Topology>,
    deferred: Option<Topology>,
}

impl TopologyMorphController {
    pub fn new(config: TopologyConfig) -> Self {
        let initial = topology_for_phase(&config.ranges, 0);
        Self {
            config,
            state: TopologyState::Settled { current: initial },
            morph: MorphSignal::settled(),
            ignored_override: None,
            deferred: None,
        }
    }

    pub fn state(&self) -> TopologyState {
        self.state
    }

    pub fn morph(&self) -> MorphSignal {
        self.morph
    }

    pub fn desired_for_phase(&self, phase: u32) -> Topology {
        topology_for_phase(&self.config.ranges, phase)
    }

    fn desired_target(&mut self, ctx: &mut EngineContext) -> Topology {
        let by_phase = self.desired_for_phase(ctx.phase.index);
        match ctx.topology_override {
            Some(requested) if ctx.running => {
                if self.ignored_override != Some(requested) {
                    self.ignored_override = Some(requested);
                    ctx.diagnostics
                        .emit(EventKind::TopologyOverrideIgnored { requested });
                }
                by_phase
            }
            Some(requested) => {
                self.ignored_override = None;
                requested
            }
            None => {
                self.ignored_override = None;
                by_phase
            }
        }
    }

    fn ramp_value(&self, ctx: &EngineContext) -> Option<f64> {
        if !ctx.running || !self.state.is_idle() || self.config.ramp_start_fraction >= 1.0 {
            return None;
        }
        let upcoming = self.desired_for_phase(ctx.phase.next_index);
        if upcoming == self.state.current() {
            return None;
        }
        let fraction = ctx.phase.dwell_fraction(ctx.now_ms);
        let start = self.config.ramp_start_fraction;
        if fraction < start {
            return None;
        }
        Some(1.0 - smoothstep((fraction - start) / (1.0 - start)))
    }

    pub fn update(&mut self, signals: &Observables, ctx: &mut EngineContext) -> MorphDescriptor {
        let desired = self.desired_target(ctx);

        match self.state {
            TopologyState::Settled { current } => {
                self.deferred = None;
                if desired != current {
                    self.state = TopologyState::Transitioning {
                        from: current,
                        to: desired,
                        progress: 0.0,
                    };
                    ctx.diagnostics.emit(EventKind::TopologyTransitionStarted {
                        from: current,
                        to: desired,
                    });
                }
            }
            TopologyState::Transitioning { to, .. } => {
                if desired != to && self.deferred != Some(desired) {
                    self.deferred = Some(desired);
                    ctx.diagnostics.emit(EventKind::TopologyRetargetDeferred {
                        target: to,
                        desired,
                    });
                }
            }
        }

        if let TopologyState::Transitioning { from, to, progress } = self.state {
            let slowdown = if self.morph.last_delta.abs() > self.config.spike_threshold {
                self.config.slowdown_factor
            } else {
                1.0
            };
            let progress = (progress + self.config.transition_rate * slowdown).min(1.0);
            if progress >= self.config.completion_threshold {
                self.state = TopologyState::Settled { current: to };
                ctx.diagnostics
                    .emit(EventKind::TopologyTransitionCompleted { topology: to });
            } else {
                self.state = TopologyState::Transitioning { from, to, progress };
            }
        }

        let authoritative = match (self.ramp_value(ctx), self.state) {
            (Some(ramp), _) => ramp,
            (None, TopologyState::Transitioning { progress, .. }) => progress,
            (None, TopologyState::Settled { .. }) => 1.0,
        };
        self.morph
            .ease_toward(authoritative, self.config.ease_rate, self.config.max_delta);

        ctx.topology = TopologySnapshot {
            current: self.state.current(),
            target: self.state.target(),
            progress: self.state.progress(),
            morph: self.morph.value,
        };

        let recursion = sanitize(
            signals.recursion.round(),
            1.0,
            1.0,
            self.config.max_recursion_depth.max(1) as f64,
        );
        let strands = sanitize(
            signals.strand_count.round(),
            1.0,
            1.0,
            self.config.max_strand_count.max(1) as f64,
        );
        MorphDescriptor {
            from: self.state.current(),
            to: self.state.target(),
            progress: self.morph.value,
            recursion_depth: recursion.value as u32,
            strand_count: strands.value as u32,
            coherence: sanitize(signals.coherence, 0.0, 0.0, 1.0).value,
        }
    }
}
