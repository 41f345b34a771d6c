//! Runs the engine against a synthetic frame-cost signal without a renderer.
//!
//! Usage: `lumen_headless [config.json] [seconds]`

use std::f64::consts::TAU;

use anyhow::{Context, Result};
use lumen_core::config::EngineConfig;
use lumen_core::engine::{Engine, TickInput};
use lumen_core::phase::Observables;

const FRAME_MS: f64 = 1_000.0 / 60.0;

fn load_config(path: Option<&str>) -> Result<EngineConfig> {
    match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {path}"))?;
            EngineConfig::from_json(&json).with_context(|| format!("Invalid config in {path}"))
        }
        None => Ok(EngineConfig::default()),
    }
}

/// Frame cost with a slow sine drift and a load spike every 40 seconds.
fn synthetic_frame_cost(now_ms: f64) -> f64 {
    let drift = 14.0 + 6.0 * (now_ms / 9_000.0 * TAU).sin();
    let spike = if (now_ms % 40_000.0) < 2_000.0 { 60.0 } else { 0.0 };
    drift + spike
}

fn synthetic_observables(now_ms: f64) -> Observables {
    let seconds = now_ms / 1_000.0;
    Observables {
        particle_count: 40.0 * seconds,
        field_strength: 0.01 * seconds,
        coherence: 0.5 + 0.4 * (seconds / 7.0).sin(),
        recursion: 1.0 + (seconds / 20.0).floor(),
        strand_count: 4.0 + (seconds / 5.0).floor(),
    }
}

fn main() -> Result<()> {
    #[cfg(not(target_arch = "wasm32"))]
    lumen_core::logging::init_tracing()?;

    let mut args = std::env::args().skip(1);
    let config_path = args.next();
    let seconds: f64 = match args.next() {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("Invalid duration '{raw}'"))?,
        None => 120.0,
    };

    let config = load_config(config_path.as_deref())?;
    let mut engine = Engine::new(config)?;
    engine.start(0.0);

    let ticks = (seconds * 1_000.0 / FRAME_MS).ceil() as u64;
    let mut last_phase = None;
    for tick in 1..=ticks {
        let now_ms = tick as f64 * FRAME_MS;
        let entity_phases = (0..32)
            .map(|i| (now_ms / 1_000.0 + i as f64 * 0.05).rem_euclid(TAU))
            .collect();
        let out = engine.tick(&TickInput {
            now_ms,
            frame_cost_ms: synthetic_frame_cost(now_ms),
            observables: synthetic_observables(now_ms),
            entity_phases,
            ..TickInput::default()
        });

        if last_phase != Some(out.status.phase_index) {
            last_phase = Some(out.status.phase_index);
            tracing::info!(
                t_ms = now_ms,
                phase = %out.status.phase_name,
                topology = %out.status.topology_name,
                tier = out.status.quality_tier.name(),
                "phase entered"
            );
        }
        engine.drain_events();
    }

    let status = engine.status();
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
