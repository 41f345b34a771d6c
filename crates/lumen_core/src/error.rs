use thiserror::Error;

use crate::config::ConfigError;

/// Errors returned by the engine control surface. The tick loop itself never fails.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("the phase sequence is auto-running; reset the engine first")]
    AutoRunning,
    #[error("unknown topology '{0}'")]
    UnknownTopology(String),
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}
