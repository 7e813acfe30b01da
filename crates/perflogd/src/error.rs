//! Error types for perflogd
//!
//! The sampling loop favors fast, visible failure: every variant raised inside
//! the loop terminates it and is handed back to the caller from
//! [`SamplingEngine::stop`](crate::SamplingEngine::stop).

use crate::types::SubflowId;
use thiserror::Error;

/// Errors that can occur in perflogd
#[derive(Debug, Error)]
pub enum PerflogError {
    /// Bad sampling parameters (feature selection, interval, config file values)
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Statistics were returned for a subflow the address query does not know about
    #[error("Subflow info not found for subflow id: {subflow_id}")]
    SubflowInfoMissing {
        /// The subflow id present in the statistics query.
        subflow_id: SubflowId,
    },

    /// Registration, sample write, or store open/close failed
    #[error("Persistence failure: {operation}: {message}")]
    Persistence {
        /// The store operation that failed (e.g., "register_subflow").
        operation: String,
        /// Error message.
        message: String,
    },

    /// Socket telemetry query failed
    #[error("Telemetry error: {0}")]
    Telemetry(String),

    /// Engine lifecycle misuse (e.g., `run` on an engine that already ran)
    #[error("Invalid engine state: {0}")]
    InvalidState(String),

    /// The background sampling thread panicked
    #[error("Sampling loop panicked")]
    LoopPanicked,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PerflogError {
    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }

    /// Creates a persistence error.
    pub fn persistence(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Persistence {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Creates a telemetry error.
    pub fn telemetry(message: impl std::fmt::Display) -> Self {
        Self::Telemetry(message.to_string())
    }
}

/// Result type alias for perflogd operations
pub type Result<T> = std::result::Result<T, PerflogError>;
