//! Unified error handling for tetherd.
//!
//! Domain errors are small thiserror enums; `anyhow` is used only at
//! the binary boundary. Errors that reach a peer always produce a
//! final readable protocol line before the connection closes.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors that can occur while setting up a listener.
#[derive(Debug, Error)]
pub enum ListenError {
    #[error("address already in use: {0}")]
    AddressInUse(SocketAddr),

    #[error("invalid port: {0}")]
    InvalidPort(u16),

    #[error("could not resolve bind address: {0}")]
    ResolutionFailed(String),

    #[error("tls setup failed: {0}")]
    Tls(String),

    #[error("listen error: {0}")]
    Io(#[from] std::io::Error),
}

impl ListenError {
    /// Get a static error code string for log labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AddressInUse(_) => "address_in_use",
            Self::InvalidPort(_) => "invalid_port",
            Self::ResolutionFailed(_) => "resolution_failed",
            Self::Tls(_) => "tls_setup",
            Self::Io(_) => "io",
        }
    }
}

/// Errors surfaced by replay buffer operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    /// `set_capacity` above the process-wide ceiling without force.
    /// The buffer is left unchanged.
    #[error("requested capacity {requested} exceeds ceiling {ceiling}")]
    CapacityRejected { requested: usize, ceiling: usize },

    /// `render` on an index past the end. Programmer error with
    /// correct callers; fails loudly rather than returning empty data.
    #[error("buffer index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },
}
