use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::events::{Diagnostics, EventKind};

/// A monitored parameter value: numeric or a toggle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Number(f64),
    Flag(bool),
}

impl ParamValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ParamValue::Number(v) => Some(*v),
            ParamValue::Flag(_) => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            ParamValue::Flag(v) => Some(*v),
            ParamValue::Number(_) => None,
        }
    }

    /// Whether `other` is a change relative to `self`: numeric deltas above `epsilon`,
    /// any boolean inequality, or a change of kind.
    pub fn differs(&self, other: &ParamValue, epsilon: f64) -> bool {
        match (self, other) {
            (ParamValue::Number(a), ParamValue::Number(b)) => (a - b).abs() > epsilon,
            (ParamValue::Flag(a), ParamValue::Flag(b)) => a != b,
            _ => true,
        }
    }

    fn is_valid(&self) -> bool {
        match self {
            ParamValue::Number(v) => v.is_finite(),
            ParamValue::Flag(_) => true,
        }
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Number(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Flag(value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct OverrideConfig {
    pub ttl_ms: f64,
    /// Numeric changes at or below this are treated as noise.
    pub epsilon: f64,
}

impl Default for OverrideConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 15_000.0,
            epsilon: 1e-3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverrideRecord {
    pub name: String,
    pub value: ParamValue,
    pub timestamp_ms: f64,
    pub ttl_ms: f64,
}

impl OverrideRecord {
    fn is_live(&self, now_ms: f64) -> bool {
        now_ms - self.timestamp_ms <= self.ttl_ms
    }
}

#[derive(Debug, Clone)]
pub struct OverrideArbiter {
    config: OverrideConfig,
    /// Last value each collaborator reported.
    observed: BTreeMap<String, ParamValue>,
    /// Last value handed out for each name.
    published: BTreeMap<String, ParamValue>,
    records: BTreeMap<String, OverrideRecord>,
    manual_mode: bool,
}

impl OverrideArbiter {
    pub fn new(config: OverrideConfig) -> Self {
        Self {
            config,
            observed: BTreeMap::new(),
            published: BTreeMap::new(),
            records: BTreeMap::new(),
            manual_mode: false,
        }
    }

    /// Pins `current` when it moved away from both the previous report and the last published
    /// value. A collaborator that echoes the published value or keeps holding an old edit
    /// registers nothing. The first sighting of an unpublished name only seeds the table.
    pub fn observe(
        &mut self,
        name: &str,
        current: ParamValue,
        now_ms: f64,
        diagnostics: &mut Diagnostics,
    ) {
        if !current.is_valid() {
            diagnostics.emit(EventKind::NumericRepair {
                name: name.to_string(),
                fallback: self
                    .published
                    .get(name)
                    .and_then(ParamValue::as_number)
                    .unwrap_or(0.0),
            });
            return;
        }

        let epsilon = self.config.epsilon;
        let published = self.published.get(name);
        let changed = match self.observed.get(name).or(published) {
            Some(previous) => {
                previous.differs(&current, epsilon)
                    && published.map_or(true, |echo| echo.differs(&current, epsilon))
            }
            None => false,
        };
        self.observed.insert(name.to_string(), current);

        if changed {
            let fresh = !self.records.contains_key(name);
            self.records.insert(
                name.to_string(),
                OverrideRecord {
                    name: name.to_string(),
                    value: current,
                    timestamp_ms: now_ms,
                    ttl_ms: self.config.ttl_ms,
                },
            );
            if fresh {
                diagnostics.emit(EventKind::OverridePinned {
                    name: name.to_string(),
                });
            }
        }
    }

    /// Records the value handed to the collaborator, so an echo of it is not a user edit.
    pub fn sync(&mut self, name: &str, published: ParamValue) {
        if published.is_valid() {
            self.published.insert(name.to_string(), published);
        }
    }

    /// True while a record for `name` exists and is inside its ttl. Expired records are
    /// removed here.
    pub fn is_pinned(&mut self, name: &str, now_ms: f64, diagnostics: &mut Diagnostics) -> bool {
        match self.records.get(name) {
            Some(record) if record.is_live(now_ms) => true,
            Some(_) => {
                self.records.remove(name);
                diagnostics.emit(EventKind::OverrideExpired {
                    name: name.to_string(),
                });
                false
            }
            None => false,
        }
    }

    /// The pinned value when `name` is pinned, otherwise `automatic`. In manual mode the
    /// last published value wins even without a live record.
    pub fn apply(
        &mut self,
        name: &str,
        automatic: ParamValue,
        now_ms: f64,
        diagnostics: &mut Diagnostics,
    ) -> ParamValue {
        if self.is_pinned(name, now_ms, diagnostics) {
            if let Some(record) = self.records.get(name) {
                return record.value;
            }
        }
        if self.manual_mode {
            if let Some(known) = self.published.get(name).or_else(|| self.observed.get(name)) {
                return *known;
            }
        }
        automatic
    }

    /// Drops every expired record, including names nobody queried since they expired.
    pub fn sweep(&mut self, now_ms: f64, diagnostics: &mut Diagnostics) -> usize {
        let expired: Vec<String> = self
            .records
            .values()
            .filter(|record| !record.is_live(now_ms))
            .map(|record| record.name.clone())
            .collect();
        for name in &expired {
            self.records.remove(name);
            diagnostics.emit(EventKind::OverrideExpired { name: name.clone() });
        }
        expired.len()
    }

    pub fn set_manual_mode(&mut self, enabled: bool) {
        self.manual_mode = enabled;
    }

    pub fn manual_mode(&self) -> bool {
        self.manual_mode
    }

    pub fn records(&self) -> impl Iterator<Item = &OverrideRecord> {
        self.records.values()
    }

    pub fn pinned_count(&self) -> usize {
        self.records.len()
    }
}
