//! Error types for the starfail daemon

use thiserror::Error;

use crate::domain_types::MemberName;

/// Daemon-level error kinds.
///
/// Collector errors never appear here: they are captured inside Samples and
/// only influence scoring and eligibility. This enum covers the failures that
/// cross component boundaries.
#[derive(Debug, Error)]
pub enum StarfailError {
    /// Invalid or missing configuration.
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A referenced member does not exist in the registry.
    #[error("member not found: {0}")]
    MemberNotFound(MemberName),

    /// The routing engine disagreed with the applied decision.
    #[error("controller conflict: {0}")]
    ControllerConflict(String),

    /// The telemetry RAM cap would be violated; handled by shedding, only
    /// surfaced when shedding itself cannot make room.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The local bus or routing engine is unreachable.
    #[error("external dependency unavailable: {0}")]
    ExternalDependency(String),

    /// Persisted-state I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted-state or RPC payload (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias for daemon-level operations.
pub type Result<T> = std::result::Result<T, StarfailError>;
