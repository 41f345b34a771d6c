use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cadence::{AuxProcess, CadenceConfig};
use crate::derive::{spec_for, DerivationConfig};
use crate::overrides::OverrideConfig;
use crate::phase::{PhaseConfig, StallPolicy};
use crate::quality::{QualityConfig, QualityTier};
use crate::resonance::ResonanceSettings;
use crate::scheduler::{ScheduledEffect, ScheduledEffectConfig};
use crate::topology::TopologyConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid `{field}`: {reason}")]
    Invalid { field: String, reason: String },
    #[error("failed to parse engine configuration: {0}")]
    Json(#[from] serde_json::Error),
}

fn ensure(condition: bool, field: &str, reason: &str) -> Result<(), ConfigError> {
    if condition {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field: field.to_string(),
            reason: reason.to_string(),
        })
    }
}

fn ensure_duration(value: f64, field: &str) -> Result<(), ConfigError> {
    ensure(
        value.is_finite() && value >= 0.0,
        field,
        "must be a finite, non-negative duration",
    )
}

fn ensure_rate(value: f64, field: &str) -> Result<(), ConfigError> {
    ensure(
        value.is_finite() && value > 0.0 && value <= 1.0,
        field,
        "must lie in (0, 1]",
    )
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Recent events kept for `drain_events`; 0 keeps none.
    pub ring_capacity: usize,
    /// Subscribe a `TracingSink` at construction.
    pub forward_to_tracing: bool,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 256,
            forward_to_tracing: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub phase: PhaseConfig,
    pub topology: TopologyConfig,
    pub quality: QualityConfig,
    pub overrides: OverrideConfig,
    pub derivation: DerivationConfig,
    pub cadence: CadenceConfig,
    pub resonance: ResonanceSettings,
    pub effects: Vec<ScheduledEffectConfig>,
    pub diagnostics: DiagnosticsConfig,
    /// Seed of the jitter applied to scheduled perturbation factors.
    pub seed: u64,
    /// Relative jitter of perturbation factors, in `[0, 1)`.
    pub perturbation_jitter: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            phase: PhaseConfig::default(),
            topology: TopologyConfig::default(),
            quality: QualityConfig::default(),
            overrides: OverrideConfig::default(),
            derivation: DerivationConfig::default(),
            cadence: CadenceConfig::default(),
            resonance: ResonanceSettings::default(),
            effects: Vec::new(),
            diagnostics: DiagnosticsConfig::default(),
            seed: 0x5eed,
            perturbation_jitter: 0.1,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_phase()?;
        self.validate_topology()?;
        self.validate_quality()?;
        self.validate_overrides()?;
        self.validate_derivation()?;
        self.validate_aux()?;
        self.validate_effects()
    }

    fn validate_phase(&self) -> Result<(), ConfigError> {
        let phase = &self.phase;
        ensure(phase.max_phase >= 1, "phase.max_phase", "must be at least 1")?;
        ensure(
            phase.restart_floor < phase.max_phase,
            "phase.restart_floor",
            "must be below max_phase",
        )?;
        ensure_duration(phase.dwell_ms, "phase.dwell_ms")?;
        ensure_duration(phase.observation_dwell_ms, "phase.observation_dwell_ms")?;
        ensure_duration(phase.terminal_hold_ms, "phase.terminal_hold_ms")?;
        ensure(
            phase.observation_first <= phase.observation_last,
            "phase.observation_first",
            "must not exceed observation_last",
        )?;
        ensure(
            phase.improvement_epsilon.is_finite() && phase.improvement_epsilon >= 0.0,
            "phase.improvement_epsilon",
            "must be finite and non-negative",
        )?;
        ensure(
            !phase.requirements.is_empty(),
            "phase.requirements",
            "must contain at least one entry",
        )?;
        ensure(
            phase
                .requirements
                .iter()
                .all(|r| r.min_particles.is_finite() && r.min_field.is_finite()),
            "phase.requirements",
            "entries must be finite",
        )?;
        if let StallPolicy::TimeOnly { stall_ms } = phase.stall_policy {
            ensure(
                stall_ms.is_finite() && stall_ms > 0.0,
                "phase.stall_policy.stall_ms",
                "must be positive",
            )?;
        }
        Ok(())
    }

    fn validate_topology(&self) -> Result<(), ConfigError> {
        let topology = &self.topology;
        ensure(
            topology.ranges.first().map(|r| r.first_phase) == Some(0),
            "topology.ranges",
            "must start at phase 0",
        )?;
        ensure(
            topology
                .ranges
                .windows(2)
                .all(|w| w[0].first_phase < w[1].first_phase),
            "topology.ranges",
            "must be sorted by first_phase without duplicates",
        )?;
        ensure_rate(topology.transition_rate, "topology.transition_rate")?;
        ensure_rate(topology.completion_threshold, "topology.completion_threshold")?;
        ensure_rate(topology.slowdown_factor, "topology.slowdown_factor")?;
        ensure_rate(topology.ease_rate, "topology.ease_rate")?;
        ensure_rate(topology.max_delta, "topology.max_delta")?;
        ensure(
            topology.spike_threshold.is_finite() && topology.spike_threshold >= 0.0,
            "topology.spike_threshold",
            "must be finite and non-negative",
        )?;
        ensure(
            (0.0..=1.0).contains(&topology.ramp_start_fraction),
            "topology.ramp_start_fraction",
            "must lie in [0, 1]",
        )
    }

    fn validate_quality(&self) -> Result<(), ConfigError> {
        let quality = &self.quality;
        ensure(quality.window >= 1, "quality.window", "must be at least 1")?;
        ensure(
            (1..=quality.window).contains(&quality.min_samples),
            "quality.min_samples",
            "must lie in [1, window]",
        )?;
        ensure(
            quality.max_sample_ms.is_finite() && quality.max_sample_ms > 0.0,
            "quality.max_sample_ms",
            "must be positive",
        )?;

        let t = &quality.thresholds;
        let all = [
            t.down_from_high,
            t.up_to_high,
            t.down_from_medium,
            t.up_to_medium,
            t.down_from_low,
            t.up_to_low,
        ];
        ensure(
            all.iter().all(|v| v.is_finite() && *v > 0.0),
            "quality.thresholds",
            "must be positive and finite",
        )?;
        ensure(
            t.up_to_high < t.down_from_high,
            "quality.thresholds.up_to_high",
            "must be below down_from_high",
        )?;
        ensure(
            t.up_to_medium < t.down_from_medium,
            "quality.thresholds.up_to_medium",
            "must be below down_from_medium",
        )?;
        ensure(
            t.up_to_low < t.down_from_low,
            "quality.thresholds.up_to_low",
            "must be below down_from_low",
        )?;
        ensure(
            t.down_from_high < t.down_from_medium && t.down_from_medium < t.down_from_low,
            "quality.thresholds",
            "downgrade thresholds must increase toward lower tiers",
        )?;

        for tier in QualityTier::all() {
            let profile = quality.profile(tier);
            let field = format!("quality.{}", tier.name());
            ensure(
                [
                    profile.base_brightness,
                    profile.base_size,
                    profile.base_domain_scale,
                    profile.intensity_ceiling,
                ]
                .iter()
                .all(|v| v.is_finite() && *v >= 0.0),
                &field,
                "profile values must be finite and non-negative",
            )?;
            ensure(
                profile.stride_multiplier >= 1,
                &field,
                "stride_multiplier must be at least 1",
            )?;
        }
        Ok(())
    }

    fn validate_overrides(&self) -> Result<(), ConfigError> {
        ensure(
            self.overrides.ttl_ms.is_finite() && self.overrides.ttl_ms > 0.0,
            "overrides.ttl_ms",
            "must be positive",
        )?;
        ensure(
            self.overrides.epsilon.is_finite() && self.overrides.epsilon >= 0.0,
            "overrides.epsilon",
            "must be finite and non-negative",
        )
    }

    fn validate_derivation(&self) -> Result<(), ConfigError> {
        let derivation = &self.derivation;
        ensure(
            !derivation.multipliers.is_empty(),
            "derivation.multipliers",
            "must contain at least one entry",
        )?;
        ensure(
            derivation.multipliers.iter().all(|m| {
                [m.brightness, m.size, m.domain_scale, m.intensity, m.rotation]
                    .iter()
                    .all(|v| v.is_finite())
            }),
            "derivation.multipliers",
            "entries must be finite",
        )?;
        ensure_rate(derivation.blend_rate, "derivation.blend_rate")?;
        ensure(
            derivation.field_reference.is_finite() && derivation.field_reference > 0.0,
            "derivation.field_reference",
            "must be positive",
        )
    }

    fn validate_aux(&self) -> Result<(), ConfigError> {
        ensure(
            self.resonance.max_samples >= 1,
            "resonance.max_samples",
            "must be at least 1",
        )?;
        ensure(
            self.resonance.lock_tolerance.is_finite() && self.resonance.lock_tolerance >= 0.0,
            "resonance.lock_tolerance",
            "must be finite and non-negative",
        )?;
        ensure(
            self.cadence.stride(AuxProcess::ResonanceScan) <= 100_000
                && self.cadence.stride(AuxProcess::OverrideSweep) <= 100_000,
            "cadence.strides",
            "must not exceed 100000 ticks",
        )?;
        ensure(
            self.perturbation_jitter.is_finite() && (0.0..1.0).contains(&self.perturbation_jitter),
            "perturbation_jitter",
            "must lie in [0, 1)",
        )
    }

    fn validate_effects(&self) -> Result<(), ConfigError> {
        for (i, entry) in self.effects.iter().enumerate() {
            ensure_duration(entry.delay_ms, &format!("effects[{i}].delay_ms"))?;
            match &entry.effect {
                ScheduledEffect::Perturbation {
                    parameter,
                    factor,
                    duration_ms,
                } => {
                    ensure(
                        spec_for(parameter).is_some(),
                        &format!("effects[{i}].parameter"),
                        "must name a numeric output parameter",
                    )?;
                    ensure(
                        factor.is_finite() && *factor > 0.0,
                        &format!("effects[{i}].factor"),
                        "must be positive",
                    )?;
                    ensure(
                        duration_ms.is_finite() && *duration_ms > 0.0,
                        &format!("effects[{i}].duration_ms"),
                        "must be positive",
                    )?;
                }
            }
        }
        Ok(())
    }
}
