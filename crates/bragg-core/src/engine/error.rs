use super::allocator::AllocationError;
use super::config::ConfigError;
use crate::core::io::ArrayIoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {source}")]
    Config {
        #[from]
        source: ConfigError,
    },

    #[error("Device {device} is unavailable: {reason}")]
    Device { device: i32, reason: String },

    #[error("Array file error: {source}")]
    Io {
        #[from]
        source: ArrayIoError,
    },

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Image became non-finite at iteration {iteration}")]
    Divergence { iteration: usize },

    #[error("Operation '{operation}' is not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("Shape mismatch: expected {expected:?}, found {found:?}")]
    Shape {
        expected: [usize; 3],
        found: [usize; 3],
    },

    #[error("Breeding failed: {0}")]
    Breeding(String),

    #[error("Resource allocation failed: {source}")]
    Allocation {
        #[from]
        source: AllocationError,
    },

    #[error("Worker communication failed: {0}")]
    Communication(String),

    #[error("Workflow phase '{phase}' failed: {reason}")]
    PhaseFailed { phase: &'static str, reason: String },
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io {
            source: ArrayIoError::Io(err),
        }
    }
}
