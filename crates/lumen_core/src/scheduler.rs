use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub u64);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum ScheduledEffect {
    /// Multiplies one derived parameter by `factor` for `duration_ms`.
    Perturbation {
        parameter: String,
        factor: f64,
        duration_ms: f64,
    },
}

/// An effect to schedule `delay_ms` after the engine starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEffectConfig {
    pub delay_ms: f64,
    #[serde(flatten)]
    pub effect: ScheduledEffect,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledTask {
    pub id: TaskId,
    pub generation: u64,
    pub due_ms: f64,
    pub effect: ScheduledEffect,
}

#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    generation: u64,
    next_id: u64,
    tasks: Vec<ScheduledTask>,
}

impl Scheduler {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            next_id: 0,
            tasks: Vec::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    pub fn schedule(&mut self, now_ms: f64, delay_ms: f64, effect: ScheduledEffect) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        let delay_ms = if delay_ms.is_finite() {
            delay_ms.max(0.0)
        } else {
            0.0
        };
        self.tasks.push(ScheduledTask {
            id,
            generation: self.generation,
            due_ms: now_ms + delay_ms,
            effect,
        });
        id
    }

    pub fn cancel(&mut self, id: TaskId) -> bool {
        let before = self.tasks.len();
        self.tasks.retain(|task| task.id != id);
        self.tasks.len() != before
    }

    /// Removes and returns every task of the live generation due at `now_ms`, ordered by
    /// due time then id.
    pub fn poll(&mut self, now_ms: f64) -> Vec<ScheduledTask> {
        let generation = self.generation;
        self.tasks.retain(|task| task.generation == generation);

        let (mut due, pending): (Vec<_>, Vec<_>) = self
            .tasks
            .drain(..)
            .partition(|task| task.due_ms <= now_ms);
        self.tasks = pending;
        due.sort_by(|a, b| a.due_ms.total_cmp(&b.due_ms).then(a.id.cmp(&b.id)));
        due
    }

    /// Invalidates every outstanding task and starts a new generation. Returns how many
    /// tasks were dropped.
    pub fn reset(&mut self) -> usize {
        let dropped = self.tasks.len();
        self.tasks.clear();
        self.generation += 1;
        dropped
    }
}

/// A perturbation currently in effect.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveEffect {
    pub parameter: String,
    pub factor: f64,
    pub until_ms: f64,
}
