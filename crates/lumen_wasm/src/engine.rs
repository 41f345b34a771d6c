use anyhow::{Context, Result};
use js_sys::Float64Array;
use lumen_core::config::EngineConfig;
use lumen_core::derive::NUMERIC_PARAMS;
use lumen_core::engine::{Engine, TickInput};
use lumen_core::topology::Topology;
use serde_wasm_bindgen::{from_value, to_value};
use wasm_bindgen::prelude::*;

fn js_error(err: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&err.to_string())
}

pub(crate) fn build_engine(config_json: Option<&str>) -> Result<Engine> {
    let config = match config_json {
        Some(json) if !json.trim().is_empty() => {
            EngineConfig::from_json(json).context("Invalid engine configuration")?
        }
        _ => EngineConfig::default(),
    };
    Engine::new(config).context("Failed to build engine")
}

pub(crate) fn parse_topology(name: Option<&str>) -> Result<Option<Topology>> {
    match name {
        None => Ok(None),
        Some(name) if name.trim().is_empty() => Ok(None),
        Some(name) => Ok(Some(name.parse()?)),
    }
}

#[wasm_bindgen]
pub struct WasmEngine {
    engine: Engine,
}

impl WasmEngine {
    /// Numeric outputs in `NUMERIC_PARAMS` order after a tick without monitored values.
    pub(crate) fn tick_numbers(&mut self, now_ms: f64, frame_cost_ms: f64) -> Vec<f64> {
        let out = self.engine.tick(&TickInput {
            now_ms,
            frame_cost_ms,
            ..TickInput::default()
        });
        NUMERIC_PARAMS
            .iter()
            .map(|spec| out.params.number(spec.name).unwrap_or(spec.bounds.fallback))
            .collect()
    }
}

#[wasm_bindgen]
impl WasmEngine {
    #[wasm_bindgen(constructor)]
    pub fn new(config_json: Option<String>) -> Result<WasmEngine, JsValue> {
        console_error_panic_hook::set_once();
        let engine = build_engine(config_json.as_deref()).map_err(|e| js_error(format!("{e:#}")))?;
        Ok(WasmEngine { engine })
    }

    /// Names of the values returned by `tick_values`, in order.
    pub fn param_names() -> Vec<String> {
        NUMERIC_PARAMS.iter().map(|spec| spec.name.to_string()).collect()
    }

    pub fn start(&mut self, now_ms: f64) {
        self.engine.start(now_ms);
    }

    pub fn reset(&mut self) {
        self.engine.reset();
    }

    pub fn is_running(&self) -> bool {
        self.engine.is_running()
    }

    /// Runs one tick. `input` has the shape of `TickInput`; missing fields default.
    pub fn tick(&mut self, input: JsValue) -> Result<JsValue, JsValue> {
        let input: TickInput = if input.is_undefined() || input.is_null() {
            TickInput::default()
        } else {
            from_value(input).map_err(|e| js_error(format!("Invalid tick input: {}", e)))?
        };
        let output = self.engine.tick(&input);
        to_value(&output).map_err(|e| js_error(format!("Serialization error: {}", e)))
    }

    /// Allocation-light tick for hosts that do not report monitored values.
    pub fn tick_values(&mut self, now_ms: f64, frame_cost_ms: f64) -> Float64Array {
        let values = self.tick_numbers(now_ms, frame_cost_ms);
        Float64Array::from(values.as_slice())
    }

    pub fn status(&self) -> Result<JsValue, JsValue> {
        to_value(&self.engine.status()).map_err(|e| js_error(format!("Serialization error: {}", e)))
    }

    /// Returns the phase index after the step.
    pub fn force_advance_phase(&mut self) -> Result<u32, JsValue> {
        self.engine.force_advance_phase().map_err(js_error)?;
        Ok(self.engine.phase_index())
    }

    pub fn set_manual_mode(&mut self, enabled: bool) {
        self.engine.set_manual_mode(enabled);
    }

    /// Accepts a lowercase topology name, or nothing to clear the override.
    pub fn set_topology_override(&mut self, name: Option<String>) -> Result<(), JsValue> {
        let topology = parse_topology(name.as_deref()).map_err(js_error)?;
        self.engine.set_topology_override(topology);
        Ok(())
    }

    pub fn drain_events(&mut self) -> Result<JsValue, JsValue> {
        let events = self.engine.drain_events();
        to_value(&events).map_err(|e| js_error(format!("Serialization error: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_engine_builds_without_config() {
        assert!(build_engine(None).is_ok());
        assert!(build_engine(Some("  ")).is_ok());
    }

    #[test]
    fn invalid_config_reports_the_field() {
        let err = build_engine(Some(r#"{"overrides": {"ttl_ms": 0}}"#)).expect_err("ttl");
        assert!(format!("{err:#}").contains("overrides.ttl_ms"));
    }

    #[test]
    fn topology_names_parse() {
        assert_eq!(parse_topology(Some("Torus")).expect("torus"), Some(Topology::Torus));
        assert_eq!(parse_topology(None).expect("none"), None);
        assert!(parse_topology(Some("klein")).is_err());
    }

    #[test]
    fn tick_numbers_follow_param_order() {
        let mut wasm = WasmEngine {
            engine: build_engine(Some(r#"{"diagnostics": {"forward_to_tracing": false}}"#))
                .expect("engine"),
        };
        let values = wasm.tick_numbers(16.0, 10.0);
        assert_eq!(values.len(), NUMERIC_PARAMS.len());
        for (value, spec) in values.iter().zip(NUMERIC_PARAMS.iter()) {
            assert!(*value >= spec.bounds.min && *value <= spec.bounds.max);
        }
    }
}
