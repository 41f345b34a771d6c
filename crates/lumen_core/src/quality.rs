use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::context::EngineContext;
use crate::events::EventKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Emergency,
    Low,
    Medium,
    High,
}

impl QualityTier {
    pub fn all() -> [QualityTier; 4] {
        [
            QualityTier::Emergency,
            QualityTier::Low,
            QualityTier::Medium,
            QualityTier::High,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            QualityTier::Emergency => "emergency",
            QualityTier::Low => "low",
            QualityTier::Medium => "medium",
            QualityTier::High => "high",
        }
    }

    pub fn up(self) -> QualityTier {
        match self {
            QualityTier::Emergency => QualityTier::Low,
            QualityTier::Low => QualityTier::Medium,
            QualityTier::Medium | QualityTier::High => QualityTier::High,
        }
    }

    pub fn down(self) -> QualityTier {
        match self {
            QualityTier::High => QualityTier::Medium,
            QualityTier::Medium => QualityTier::Low,
            QualityTier::Low | QualityTier::Emergency => QualityTier::Emergency,
        }
    }
}

/// Static scaling profile of one tier, consumed by parameter derivation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierProfile {
    pub base_brightness: f64,
    pub base_size: f64,
    pub base_domain_scale: f64,
    /// Upper bound on the derived intensity at this tier.
    pub intensity_ceiling: f64,
    /// Multiplier applied to auxiliary analysis strides (1 = configured stride).
    pub stride_multiplier: u32,
    pub bloom: bool,
    pub trails: bool,
}

/// Hysteresis thresholds, in milliseconds of rolling-average frame cost.
///
/// Each boundary between adjacent tiers has an upgrade threshold strictly below its
/// downgrade threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierThresholds {
    pub down_from_high: f64,
    pub up_to_high: f64,
    pub down_from_medium: f64,
    pub up_to_medium: f64,
    pub down_from_low: f64,
    pub up_to_low: f64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            down_from_high: 28.0,
            up_to_high: 18.0,
            down_from_medium: 40.0,
            up_to_medium: 30.0,
            down_from_low: 80.0,
            up_to_low: 60.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub initial_tier: QualityTier,
    /// Number of frame-cost samples in the rolling average.
    pub window: usize,
    /// Samples required before the first decision.
    pub min_samples: usize,
    /// Ticks that must pass after a change before the next one.
    pub cooldown_ticks: u32,
    /// Samples above this are treated as this value (stalls, tab switches).
    pub max_sample_ms: f64,
    pub thresholds: TierThresholds,
    pub emergency: TierProfile,
    pub low: TierProfile,
    pub medium: TierProfile,
    pub high: TierProfile,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            initial_tier: QualityTier::High,
            window: 20,
            min_samples: 1,
            cooldown_ticks: 3,
            max_sample_ms: 1_000.0,
            thresholds: TierThresholds::default(),
            emergency: TierProfile {
                base_brightness: 0.6,
                base_size: 40.0,
                base_domain_scale: 4.0,
                intensity_ceiling: 1.5,
                stride_multiplier: 8,
                bloom: false,
                trails: false,
            },
            low: TierProfile {
                base_brightness: 0.9,
                base_size: 80.0,
                base_domain_scale: 6.0,
                intensity_ceiling: 3.0,
                stride_multiplier: 4,
                bloom: false,
                trails: false,
            },
            medium: TierProfile {
                base_brightness: 1.2,
                base_size: 140.0,
                base_domain_scale: 8.0,
                intensity_ceiling: 6.0,
                stride_multiplier: 2,
                bloom: true,
                trails: false,
            },
            high: TierProfile {
                base_brightness: 1.5,
                base_size: 220.0,
                base_domain_scale: 10.0,
                intensity_ceiling: 10.0,
                stride_multiplier: 1,
                bloom: true,
                trails: true,
            },
        }
    }
}

impl QualityConfig {
    pub fn profile(&self, tier: QualityTier) -> &TierProfile {
        match tier {
            QualityTier::Emergency => &self.emergency,
            QualityTier::Low => &self.low,
            QualityTier::Medium => &self.medium,
            QualityTier::High => &self.high,
        }
    }
}

/// Rolling mean over the last `capacity` frame costs.
#[derive(Debug, Clone)]
pub struct FrameCostWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl FrameCostWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
        }
    }
}

#[derive(Debug, Clone)]
pub struct QualityController {
    config: QualityConfig,
    tier: QualityTier,
    window: FrameCostWindow,
    ticks_since_change: u32,
}

impl QualityController {
    pub fn new(config: QualityConfig) -> Self {
        let window = FrameCostWindow::new(config.window);
        Self {
            tier: config.initial_tier,
            window,
            ticks_since_change: config.cooldown_ticks,
            config,
        }
    }

    pub fn tier(&self) -> QualityTier {
        self.tier
    }

    pub fn profile(&self) -> &TierProfile {
        self.config.profile(self.tier)
    }

    pub fn average_ms(&self) -> Option<f64> {
        self.window.average()
    }

    /// Tier the thresholds select for `average_ms` when sitting at `tier`, before cooldown.
    pub fn decide(thresholds: &TierThresholds, tier: QualityTier, average_ms: f64) -> QualityTier {
        let (down_above, up_below) = match tier {
            QualityTier::High => (Some(thresholds.down_from_high), None),
            QualityTier::Medium => (Some(thresholds.down_from_medium), Some(thresholds.up_to_high)),
            QualityTier::Low => (Some(thresholds.down_from_low), Some(thresholds.up_to_medium)),
            QualityTier::Emergency => (None, Some(thresholds.up_to_low)),
        };
        if down_above.is_some_and(|limit| average_ms > limit) {
            tier.down()
        } else if up_below.is_some_and(|limit| average_ms < limit) {
            tier.up()
        } else {
            tier
        }
    }

    /// Feeds one frame-cost sample and moves at most one tier.
    pub fn update(&mut self, frame_cost_ms: f64, ctx: &mut EngineContext) -> QualityTier {
        self.ticks_since_change = self.ticks_since_change.saturating_add(1);

        if frame_cost_ms.is_finite() {
            self.window
                .push(frame_cost_ms.clamp(0.0, self.config.max_sample_ms));
        } else {
            ctx.diagnostics.emit(EventKind::FrameCostRejected);
        }

        if self.window.len() >= self.config.min_samples
            && self.ticks_since_change >= self.config.cooldown_ticks
        {
            if let Some(average_ms) = self.window.average() {
                let next = Self::decide(&self.config.thresholds, self.tier, average_ms);
                if next != self.tier {
                    ctx.diagnostics.emit(EventKind::QualityTierChanged {
                        from: self.tier,
                        to: next,
                        average_ms,
                    });
                    self.tier = next;
                    self.ticks_since_change = 0;
                }
            }
        }

        ctx.quality_tier = self.tier;
        self.tier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;

    fn ctx() -> EngineContext {
        EngineContext::new(16)
    }

    #[test]
    fn window_averages_recent_samples() {
        let mut window = FrameCostWindow::new(3);
        assert_eq!(window.average(), None);
        for s in [10.0, 20.0, 30.0, 40.0] {
            window.push(s);
        }
        assert_eq!(window.len(), 3);
        assert!((window.average().unwrap() - 30.0).abs() < 1e-12);
    }

    #[test]
    fn decide_uses_asymmetric_thresholds() {
        let t = TierThresholds::default();
        assert_eq!(QualityController::decide(&t, QualityTier::High, 29.0), QualityTier::Medium);
        assert_eq!(QualityController::decide(&t, QualityTier::Medium, 29.0), QualityTier::Medium);
        assert_eq!(QualityController::decide(&t, QualityTier::Medium, 17.0), QualityTier::High);
        assert_eq!(QualityController::decide(&t, QualityTier::Low, 35.0), QualityTier::Low);
        assert_eq!(QualityController::decide(&t, QualityTier::Low, 81.0), QualityTier::Emergency);
        assert_eq!(QualityController::decide(&t, QualityTier::Emergency, 59.0), QualityTier::Low);
        assert_eq!(QualityController::decide(&t, QualityTier::Emergency, 70.0), QualityTier::Emergency);
    }

    #[test]
    fn oscillation_at_a_threshold_changes_tier_at_most_once() {
        let mut controller = QualityController::new(QualityConfig {
            window: 1,
            cooldown_ticks: 0,
            ..QualityConfig::default()
        });
        let mut ctx = ctx();
        let mut changes = 0;
        let mut last = controller.tier();
        for i in 0..400 {
            let cost = if i % 2 == 0 { 27.0 } else { 29.0 };
            let tier = controller.update(cost, &mut ctx);
            if tier != last {
                changes += 1;
                last = tier;
            }
        }
        assert!(changes <= 1, "tier flapped {changes} times");
        assert_eq!(controller.tier(), QualityTier::Medium);
    }

    #[test]
    fn cost_burst_steps_down_without_bouncing_back() {
        let mut controller = QualityController::new(QualityConfig::default());
        let mut ctx = ctx();
        for _ in 0..20 {
            controller.update(16.0, &mut ctx);
        }
        assert_eq!(controller.tier(), QualityTier::High);

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(controller.update(250.0, &mut ctx));
        }
        assert_eq!(controller.tier(), QualityTier::Low);
        let first_low = seen.iter().position(|t| *t == QualityTier::Low).unwrap();
        assert!(seen[first_low..].iter().all(|t| *t == QualityTier::Low));
        assert!(!seen.iter().skip(1).any(|t| *t == QualityTier::High));
    }

    #[test]
    fn moves_one_tier_per_decision() {
        let mut controller = QualityController::new(QualityConfig {
            cooldown_ticks: 0,
            window: 1,
            ..QualityConfig::default()
        });
        let mut ctx = ctx();
        assert_eq!(controller.update(500.0, &mut ctx), QualityTier::Medium);
        assert_eq!(controller.update(500.0, &mut ctx), QualityTier::Low);
        assert_eq!(controller.update(500.0, &mut ctx), QualityTier::Emergency);
        assert_eq!(ctx.quality_tier, QualityTier::Emergency);
    }

    #[test]
    fn non_finite_samples_are_skipped_and_reported() {
        let sink = RecordingSink::new();
        let mut ctx = ctx();
        ctx.diagnostics.subscribe(Box::new(sink.clone()));
        let mut controller = QualityController::new(QualityConfig::default());
        controller.update(f64::NAN, &mut ctx);
        controller.update(f64::INFINITY, &mut ctx);
        assert_eq!(controller.average_ms(), None);
        assert_eq!(controller.tier(), QualityTier::High);
        assert_eq!(sink.count(|k| matches!(k, EventKind::FrameCostRejected)), 2);
    }

    #[test]
    fn recovers_after_load_drops() {
        let mut controller = QualityController::new(QualityConfig {
            initial_tier: QualityTier::Low,
            window: 4,
            ..QualityConfig::default()
        });
        let mut ctx = ctx();
        for _ in 0..40 {
            controller.update(10.0, &mut ctx);
        }
        assert_eq!(controller.tier(), QualityTier::High);
    }
}
