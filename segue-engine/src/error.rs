//! Error types for segue-engine
//!
//! Defines engine error types using thiserror. Most engine operations
//! degrade to a logged no-op rather than erroring; these errors surface at
//! the host seam and during construction.

use thiserror::Error;

/// Main error type for segue-engine
#[derive(Error, Debug)]
pub enum Error {
    /// Shared configuration or common-crate errors
    #[error(transparent)]
    Common(#[from] segue_common::Error),

    /// Host does not provide an audio API
    #[error("Audio API unsupported")]
    AudioUnsupported,

    /// Host rejected construction of an audio node
    #[error("Node construction failed: {0}")]
    NodeConstruction(String),

    /// Host rejected a connect/disconnect/automation call
    #[error("Audio host error: {0}")]
    Host(String),

    /// Media element refused to start playback
    #[error("Playback error: {0}")]
    Playback(String),

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Convenience Result type using segue-engine Error
pub type Result<T> = std::result::Result<T, Error>;
