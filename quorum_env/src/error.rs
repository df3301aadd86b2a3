//! Error types for the quorum token simulator.

use thiserror::Error;

/// Errors that surface out of a simulation run.
///
/// Protocol-level anomalies (stale writes, unmatched replies, omitted
/// messages, refused transforms) are resolved locally and never show up
/// here.
#[derive(Debug, Error)]
pub enum SimError {
    /// Configuration values are inconsistent or out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A referenced agent does not exist in the simulation
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    /// The replay schedule did not drain within the step ceiling
    #[error("Replay did not drain after {steps} steps ({remaining} entries left)")]
    RunawayReplay { steps: u64, remaining: usize },

    /// Reading or writing a persisted artifact failed
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl SimError {
    /// Creates a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Creates an unknown-agent error.
    pub fn unknown_agent(agent: impl std::fmt::Display) -> Self {
        Self::UnknownAgent(agent.to_string())
    }

    /// Creates a persistence error.
    pub fn persistence(msg: impl std::fmt::Display) -> Self {
        Self::Persistence(msg.to_string())
    }
}
