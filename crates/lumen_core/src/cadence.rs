use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Auxiliary process identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuxProcess {
    /// Cross-entity phase-locking scan
    ResonanceScan,
    /// Bulk purge of expired override records
    OverrideSweep,
}

impl AuxProcess {
    pub fn all() -> [AuxProcess; 2] {
        [AuxProcess::ResonanceScan, AuxProcess::OverrideSweep]
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            AuxProcess::ResonanceScan => "Resonance Scan",
            AuxProcess::OverrideSweep => "Override Sweep",
        }
    }

    /// Ticks between executions by default.
    pub fn default_stride(&self) -> u32 {
        match self {
            AuxProcess::ResonanceScan => 6,
            AuxProcess::OverrideSweep => 60,
        }
    }

    /// Whether the stride scales with the quality tier.
    pub fn scales_with_tier(&self) -> bool {
        matches!(self, AuxProcess::ResonanceScan)
    }
}

/// Per-process strides (ticks between executions, 0 disables).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CadenceConfig {
    strides: BTreeMap<AuxProcess, u32>,
}

impl CadenceConfig {
    pub fn new() -> Self {
        let strides = AuxProcess::all()
            .into_iter()
            .map(|p| (p, p.default_stride()))
            .collect();
        Self { strides }
    }

    pub fn stride(&self, process: AuxProcess) -> u32 {
        self.strides
            .get(&process)
            .copied()
            .unwrap_or_else(|| process.default_stride())
    }

    pub fn set_stride(&mut self, process: AuxProcess, stride: u32) {
        self.strides.insert(process, stride);
    }

    /// Stride after applying a tier multiplier to processes that scale with the tier.
    pub fn effective_stride(&self, process: AuxProcess, tier_multiplier: u32) -> u32 {
        let stride = self.stride(process);
        if process.scales_with_tier() {
            stride.saturating_mul(tier_multiplier.max(1))
        } else {
            stride
        }
    }

    pub fn should_execute(&self, process: AuxProcess, tick: u64, tier_multiplier: u32) -> bool {
        match self.effective_stride(process, tier_multiplier) {
            0 => false,
            stride => tick % stride as u64 == 0,
        }
    }
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self::new()
    }
}
