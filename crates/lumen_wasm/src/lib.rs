mod engine;

pub use engine::WasmEngine;
