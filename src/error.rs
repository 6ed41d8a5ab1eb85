//! Error types for the murmur audio scheduler.

use serde::{Deserialize, Serialize};

/// Top-level error type for the scheduler, its tasks and the audio sink.
#[derive(Debug, thiserror::Error)]
pub enum MurmurError {
    /// Output device cannot be opened or refuses to play.
    #[error("device error: {0}")]
    Device(String),

    /// Missing, unreadable or undecodable media file.
    #[error("media error: {0}")]
    Media(String),

    /// A task's internal step exceeded its time budget.
    #[error("timeout: {0}")]
    Timeout(String),

    /// API misuse such as starting a task twice or an invalid state transition.
    #[error("programmer error: {0}")]
    Programmer(String),

    /// The task observed its cancel signal and unwound.
    #[error("task cancelled")]
    Cancelled,

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// An external collaborator (synthesizer, text source, reply stream) failed.
    #[error("collaborator error: {0}")]
    Collaborator(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MurmurError {
    /// Coarse classification used in run history.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Device(_) => FailureKind::Device,
            Self::Media(_) | Self::Io(_) => FailureKind::Media,
            Self::Timeout(_) => FailureKind::Timeout,
            Self::Programmer(_) => FailureKind::Programmer,
            Self::Collaborator(_) => FailureKind::Collaborator,
            Self::Cancelled | Self::Config(_) | Self::Channel(_) => FailureKind::Other,
        }
    }
}

/// Failure category recorded for a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Device,
    Media,
    Timeout,
    Programmer,
    Collaborator,
    Other,
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, MurmurError>;
