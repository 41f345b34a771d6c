use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::overrides::ParamValue;
use crate::quality::TierProfile;
use crate::sanitize::{guard_noted, Bounds, RepairNote};

pub const BRIGHTNESS: &str = "brightness";
pub const SIZE: &str = "size";
pub const DOMAIN_SCALE: &str = "domain_scale";
pub const INTENSITY: &str = "intensity";
pub const MORPH: &str = "morph";
pub const ROTATION_SPEED: &str = "rotation_speed";
pub const RESONANCE: &str = "resonance";
pub const BLOOM: &str = "bloom";
pub const TRAILS: &str = "trails";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub bounds: Bounds,
}

/// Every numeric output with its declared range and fallback.
pub const NUMERIC_PARAMS: [ParamSpec; 7] = [
    ParamSpec {
        name: BRIGHTNESS,
        bounds: Bounds::new(0.1, 50.0, 1.0),
    },
    ParamSpec {
        name: SIZE,
        bounds: Bounds::new(1.0, 2_000.0, 100.0),
    },
    ParamSpec {
        name: DOMAIN_SCALE,
        bounds: Bounds::new(0.1, 100.0, 8.0),
    },
    ParamSpec {
        name: INTENSITY,
        bounds: Bounds::new(0.0, 10.0, 1.0),
    },
    ParamSpec {
        name: MORPH,
        bounds: Bounds::new(0.0, 1.0, 1.0),
    },
    ParamSpec {
        name: ROTATION_SPEED,
        bounds: Bounds::new(0.0, 5.0, 0.5),
    },
    ParamSpec {
        name: RESONANCE,
        bounds: Bounds::new(0.0, 1.0, 0.0),
    },
];

pub const FLAG_PARAMS: [&str; 2] = [BLOOM, TRAILS];

pub fn spec_for(name: &str) -> Option<&'static ParamSpec> {
    NUMERIC_PARAMS.iter().find(|spec| spec.name == name)
}

/// Per-phase scaling factors applied on top of the tier profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseMultipliers {
    pub brightness: f64,
    pub size: f64,
    pub domain_scale: f64,
    pub intensity: f64,
    pub rotation: f64,
}

impl PhaseMultipliers {
    pub const IDENTITY: PhaseMultipliers = PhaseMultipliers {
        brightness: 1.0,
        size: 1.0,
        domain_scale: 1.0,
        intensity: 1.0,
        rotation: 1.0,
    };

    fn lerp(&self, other: &PhaseMultipliers, t: f64) -> PhaseMultipliers {
        let mix = |a: f64, b: f64| a + (b - a) * t;
        PhaseMultipliers {
            brightness: mix(self.brightness, other.brightness),
            size: mix(self.size, other.size),
            domain_scale: mix(self.domain_scale, other.domain_scale),
            intensity: mix(self.intensity, other.intensity),
            rotation: mix(self.rotation, other.rotation),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DerivationConfig {
    /// Indexed by phase; phases past the end use the last entry.
    pub multipliers: Vec<PhaseMultipliers>,
    /// Fraction of the remaining distance the phase blend covers per tick.
    pub blend_rate: f64,
    /// Field strength at which the field contribution reaches half its range.
    pub field_reference: f64,
}

impl Default for DerivationConfig {
    fn default() -> Self {
        let phases = 13;
        Self {
            multipliers: (0..phases)
                .map(|i| {
                    let t = i as f64 / (phases - 1) as f64;
                    PhaseMultipliers {
                        brightness: 0.6 + 1.4 * t,
                        size: 0.5 + t,
                        domain_scale: 0.5 + 2.5 * t,
                        intensity: 0.2 + 0.8 * t,
                        rotation: 0.2 + 0.6 * t,
                    }
                })
                .collect(),
            blend_rate: 0.05,
            field_reference: 1.0,
        }
    }
}

/// Linear interpolation between the table entries bracketing `blend`.
pub fn phase_multiplier(table: &[PhaseMultipliers], blend: f64) -> PhaseMultipliers {
    let Some(last) = table.len().checked_sub(1) else {
        return PhaseMultipliers::IDENTITY;
    };
    let blend = if blend.is_finite() {
        blend.clamp(0.0, last as f64)
    } else {
        0.0
    };
    let lo = blend.floor() as usize;
    let hi = (lo + 1).min(last);
    table[lo].lerp(&table[hi], blend - lo as f64)
}

/// Eases the discrete phase index into a continuous value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseBlend {
    value: f64,
}

impl PhaseBlend {
    pub fn new(index: u32) -> Self {
        Self {
            value: index as f64,
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// Moves toward `index` by `rate` of the remaining distance, never more than `rate`
    /// phases per tick. A wrap back to the floor is swept at the same pace as an advance.
    pub fn step(&mut self, index: u32, rate: f64) -> f64 {
        let target = index as f64;
        if !self.value.is_finite() {
            self.value = target;
            return self.value;
        }
        let rate = rate.clamp(0.0, 1.0);
        self.value += ((target - self.value) * rate).clamp(-rate, rate);
        if (target - self.value).abs() < 1e-3 {
            self.value = target;
        }
        self.value
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Perturbation {
    pub parameter: String,
    pub factor: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct DerivationInputs<'a> {
    pub profile: &'a TierProfile,
    pub phase_blend: f64,
    pub morph: f64,
    pub field_strength: f64,
    pub coherence: f64,
    pub resonance: f64,
    pub perturbations: &'a [Perturbation],
}

/// Immutable name → value map handed to the renderer.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct ParameterBag {
    values: BTreeMap<String, ParamValue>,
}

impl ParameterBag {
    pub(crate) fn from_map(values: BTreeMap<String, ParamValue>) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<ParamValue> {
        self.values.get(name).copied()
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|v| v.as_number())
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(|v| v.as_flag())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ParamValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Derived {
    pub values: BTreeMap<String, ParamValue>,
    pub notes: Vec<RepairNote>,
}

pub fn derive(config: &DerivationConfig, inputs: &DerivationInputs) -> Derived {
    let mult = phase_multiplier(&config.multipliers, inputs.phase_blend);
    let profile = inputs.profile;

    let reference = if config.field_reference > 0.0 {
        config.field_reference
    } else {
        1.0
    };
    let field = inputs.field_strength.max(0.0);
    let field_norm = field / (field + reference);
    let coherence = inputs.coherence.clamp(0.0, 1.0);

    let raw = [
        (
            BRIGHTNESS,
            profile.base_brightness * mult.brightness * (0.75 + 0.5 * field_norm),
        ),
        (SIZE, profile.base_size * mult.size),
        (DOMAIN_SCALE, profile.base_domain_scale * mult.domain_scale),
        (
            INTENSITY,
            (mult.intensity * (1.0 + 4.0 * field_norm)).min(profile.intensity_ceiling),
        ),
        (MORPH, inputs.morph),
        (ROTATION_SPEED, mult.rotation * (0.5 + 0.5 * coherence)),
        (RESONANCE, inputs.resonance),
    ];

    let mut values = BTreeMap::new();
    let mut notes = Vec::new();
    for (name, value) in raw {
        let factor: f64 = inputs
            .perturbations
            .iter()
            .filter(|p| p.parameter == name)
            .map(|p| p.factor)
            .product();
        let bounds = spec_for(name).map(|s| s.bounds).unwrap_or_else(Bounds::unit);
        let clean = guard_noted(name, value * factor, bounds, &mut notes);
        values.insert(name.to_string(), ParamValue::Number(clean));
    }
    values.insert(BLOOM.to_string(), ParamValue::Flag(profile.bloom));
    values.insert(TRAILS.to_string(), ParamValue::Flag(profile.trails));

    Derived { values, notes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::{QualityConfig, QualityTier};
    use crate::sanitize::Repair;

    fn inputs<'a>(profile: &'a TierProfile, perturbations: &'a [Perturbation]) -> DerivationInputs<'a> {
        DerivationInputs {
            profile,
            phase_blend: 3.4,
            morph: 0.7,
            field_strength: 2.0,
            coherence: 0.4,
            resonance: 0.2,
            perturbations,
        }
    }

    #[test]
    fn derive_is_deterministic() {
        let config = DerivationConfig::default();
        let quality = QualityConfig::default();
        let profile = quality.profile(QualityTier::Medium);
        let a = derive(&config, &inputs(profile, &[]));
        let b = derive(&config, &inputs(profile, &[]));
        assert_eq!(a, b);
    }

    #[test]
    fn outputs_are_finite_and_in_range_for_hostile_inputs() {
        let config = DerivationConfig::default();
        let profile = TierProfile {
            base_brightness: f64::INFINITY,
            base_size: f64::NAN,
            base_domain_scale: 1e300,
            intensity_ceiling: f64::NAN,
            stride_multiplier: 1,
            bloom: true,
            trails: false,
        };
        let spikes = [Perturbation {
            parameter: SIZE.to_string(),
            factor: f64::INFINITY,
        }];
        let derived = derive(
            &config,
            &DerivationInputs {
                phase_blend: f64::NAN,
                morph: -3.0,
                field_strength: f64::NEG_INFINITY,
                coherence: f64::NAN,
                resonance: 7.0,
                ..inputs(&profile, &spikes)
            },
        );
        for spec in NUMERIC_PARAMS {
            let value = derived.values[spec.name].as_number().unwrap();
            assert!(value.is_finite(), "{} not finite", spec.name);
            assert!(value >= spec.bounds.min && value <= spec.bounds.max, "{} = {value}", spec.name);
        }
        assert!(derived.notes.iter().any(|n| n.repair == Repair::NonFinite));
    }

    #[test]
    fn multiplier_interpolates_between_bracketing_entries() {
        let table = vec![
            PhaseMultipliers::IDENTITY,
            PhaseMultipliers {
                brightness: 3.0,
                ..PhaseMultipliers::IDENTITY
            },
        ];
        assert!((phase_multiplier(&table, 0.5).brightness - 2.0).abs() < 1e-12);
        assert!((phase_multiplier(&table, 9.0).brightness - 3.0).abs() < 1e-12);
        assert_eq!(phase_multiplier(&[], 2.0), PhaseMultipliers::IDENTITY);
    }

    #[test]
    fn higher_tiers_are_brighter() {
        let config = DerivationConfig::default();
        let quality = QualityConfig::default();
        let low = derive(&config, &inputs(quality.profile(QualityTier::Low), &[]));
        let high = derive(&config, &inputs(quality.profile(QualityTier::High), &[]));
        let b = |d: &Derived| d.values[BRIGHTNESS].as_number().unwrap();
        assert!(b(&high) > b(&low));
        assert_eq!(high.values[BLOOM], ParamValue::Flag(true));
        assert_eq!(low.values[TRAILS], ParamValue::Flag(false));
    }

    #[test]
    fn intensity_respects_tier_ceiling() {
        let config = DerivationConfig::default();
        let quality = QualityConfig::default();
        let profile = quality.profile(QualityTier::Emergency);
        let derived = derive(
            &config,
            &DerivationInputs {
                field_strength: 1_000.0,
                phase_blend: 12.0,
                ..inputs(profile, &[])
            },
        );
        let intensity = derived.values[INTENSITY].as_number().unwrap();
        assert!(intensity <= profile.intensity_ceiling + 1e-12);
    }

    #[test]
    fn perturbation_scales_one_parameter() {
        let config = DerivationConfig::default();
        let quality = QualityConfig::default();
        let profile = quality.profile(QualityTier::High);
        let plain = derive(&config, &inputs(profile, &[]));
        let spikes = [Perturbation {
            parameter: BRIGHTNESS.to_string(),
            factor: 2.0,
        }];
        let perturbed = derive(&config, &inputs(profile, &spikes));
        let b = |d: &Derived, n: &str| d.values[n].as_number().unwrap();
        assert!((b(&perturbed, BRIGHTNESS) - 2.0 * b(&plain, BRIGHTNESS)).abs() < 1e-9);
        assert_eq!(b(&perturbed, SIZE), b(&plain, SIZE));
    }

    #[test]
    fn blend_eases_toward_the_index() {
        let mut blend = PhaseBlend::new(0);
        blend.step(1, 0.5);
        assert!((blend.value() - 0.5).abs() < 1e-12);
        for _ in 0..40 {
            blend.step(1, 0.5);
        }
        assert_eq!(blend.value(), 1.0);
    }

    #[test]
    fn wrap_is_swept_at_the_advance_pace() {
        let mut blend = PhaseBlend::new(12);
        let mut previous = blend.value();
        let mut ticks = 0;
        while blend.value() != 2.0 {
            let value = blend.step(2, 0.05);
            assert!(previous - value <= 0.05 + 1e-12, "jumped {previous} -> {value}");
            assert!(value >= 2.0);
            previous = value;
            ticks += 1;
            assert!(ticks < 1_000);
        }
        assert!(ticks >= 200);
    }
}
