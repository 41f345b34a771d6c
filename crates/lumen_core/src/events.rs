use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::cadence::AuxProcess;
use crate::quality::QualityTier;
use crate::topology::Topology;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warn,
}

/// Payload of a diagnostic, one variant per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// A non-finite value was replaced by its fallback.
    NumericRepair { name: String, fallback: f64 },
    /// A finite value fell outside its declared range and was clamped.
    ValueClamped {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },
    /// Something proposed moving the phase index by more than one.
    IllegalPhaseJump {
        from: u32,
        proposed: u32,
        committed: u32,
    },
    /// Something proposed a backwards move that is not the restart wrap.
    IllegalPhaseRegression { from: u32, proposed: u32 },
    PhaseAdvanced { from: u32, to: u32, forced: bool },
    PhaseWrapped { from: u32, to: u32 },
    /// The threshold predicate was bypassed because no signal improved for `stalled_ms`.
    LivenessFallback { index: u32, stalled_ms: f64 },
    TopologyTransitionStarted { from: Topology, to: Topology },
    TopologyTransitionCompleted { topology: Topology },
    /// A new desired topology arrived while a transition was in flight.
    TopologyRetargetDeferred { target: Topology, desired: Topology },
    TopologyOverrideIgnored { requested: Topology },
    QualityTierChanged {
        from: QualityTier,
        to: QualityTier,
        average_ms: f64,
    },
    /// A monitored frame-cost sample was not finite and was skipped.
    FrameCostRejected,
    OverridePinned { name: String },
    OverrideExpired { name: String },
    ManualModeChanged { enabled: bool },
    SubsystemDisabled { process: AuxProcess, reason: String },
    ScheduledEffectFired { task: u64, parameter: String },
    ScheduledTasksCancelled { generation: u64, count: usize },
    EngineStarted { generation: u64 },
    EngineReset { generation: u64 },
}

impl EventKind {
    pub fn severity(&self) -> Severity {
        match self {
            EventKind::ValueClamped { .. } => Severity::Debug,
            EventKind::NumericRepair { .. }
            | EventKind::IllegalPhaseJump { .. }
            | EventKind::IllegalPhaseRegression { .. }
            | EventKind::TopologyRetargetDeferred { .. }
            | EventKind::FrameCostRejected
            | EventKind::LivenessFallback { .. }
            | EventKind::SubsystemDisabled { .. } => Severity::Warn,
            _ => Severity::Info,
        }
    }

    /// True for the kinds that signal a defect elsewhere in the pipeline.
    pub fn is_defect(&self) -> bool {
        matches!(
            self,
            EventKind::IllegalPhaseJump { .. } | EventKind::IllegalPhaseRegression { .. }
        )
    }
}

/// A diagnostic stamped with the tick it was raised on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub tick: u64,
    pub now_ms: f64,
    #[serde(flatten)]
    pub kind: EventKind,
}

pub trait EventSink {
    fn emit(&mut self, event: &Event);
}

/// Forwards events to the `tracing` subscriber installed by the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&mut self, event: &Event) {
        match event.kind.severity() {
            Severity::Debug => {
                tracing::debug!(tick = event.tick, now_ms = event.now_ms, event = ?event.kind)
            }
            Severity::Info => {
                tracing::info!(tick = event.tick, now_ms = event.now_ms, event = ?event.kind)
            }
            Severity::Warn => {
                tracing::warn!(tick = event.tick, now_ms = event.now_ms, event = ?event.kind)
            }
        }
    }
}

/// Shared in-memory sink. Clones observe the same buffer.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    events: Rc<RefCell<Vec<Event>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    pub fn count(&self, predicate: impl Fn(&EventKind) -> bool) -> usize {
        self.events
            .borrow()
            .iter()
            .filter(|event| predicate(&event.kind))
            .count()
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }
}

impl EventSink for RecordingSink {
    fn emit(&mut self, event: &Event) {
        self.events.borrow_mut().push(event.clone());
    }
}

pub struct Diagnostics {
    sinks: Vec<Box<dyn EventSink>>,
    recent: VecDeque<Event>,
    capacity: usize,
    tick: u64,
    now_ms: f64,
}

impl Diagnostics {
    pub fn new(capacity: usize) -> Self {
        Self {
            sinks: Vec::new(),
            recent: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            tick: 0,
            now_ms: 0.0,
        }
    }

    pub fn subscribe(&mut self, sink: Box<dyn EventSink>) {
        self.sinks.push(sink);
    }

    /// Sets the tick and timestamp attached to subsequent events.
    pub fn stamp(&mut self, tick: u64, now_ms: f64) {
        self.tick = tick;
        self.now_ms = now_ms;
    }

    pub fn emit(&mut self, kind: EventKind) {
        let event = Event {
            tick: self.tick,
            now_ms: self.now_ms,
            kind,
        };
        for sink in self.sinks.iter_mut() {
            sink.emit(&event);
        }
        if self.capacity == 0 {
            return;
        }
        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(event);
    }

    pub fn recent(&self) -> impl Iterator<Item = &Event> {
        self.recent.iter()
    }

    pub fn drain(&mut self) -> Vec<Event> {
        self.recent.drain(..).collect()
    }
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diagnostics")
            .field("sinks", &self.sinks.len())
            .field("recent", &self.recent.len())
            .field("capacity", &self.capacity)
            .field("tick", &self.tick)
            .finish()
    }
}
