//! Error handling for the network-server core
//!
//! The hot path never escalates to process termination: every variant here
//! degrades to "no downlink was sent this window". The processor returns
//! `Ok(None)` for expected steady-state drops (unknown device, stale
//! counter, missed deadline) and reserves the error variants for conditions
//! the caller may want to log at a higher severity.

use thiserror::Error;

/// Network-server error type
#[derive(Error, Debug)]
pub enum LnsError {
    /// Unparseable or truncated frame bytes
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] lorawan::WireError),

    /// MAC command codec failure on the downlink (trusted) path
    #[error("MAC codec error: {0}")]
    MacCodec(#[from] lorawan::MacError),

    /// Expected steady-state rejection (replay, gateway mismatch, ...)
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// Receive-window budget exhausted before the work could finish
    #[error("time budget exhausted: {0}")]
    TimeBudgetExhausted(String),

    /// External collaborator unreachable or erroring
    #[error("collaborator error: {0}")]
    Collaborator(String),

    /// Frequency/datarate outside every configured region
    #[error("region error: {0}")]
    Region(String),

    /// Invalid service or device configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl LnsError {
    pub fn collaborator(err: impl std::fmt::Display) -> Self {
        LnsError::Collaborator(err.to_string())
    }
}

/// Result alias used throughout the service
pub type Result<T> = std::result::Result<T, LnsError>;
