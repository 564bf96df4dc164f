//! Error types for the tunrelay engine

use std::io;
use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Main error type for the relay engine
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Packet too short: expected {expected}, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("Invalid IP version: {0}")]
    InvalidIpVersion(u8),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Tunnel device closed")]
    DeviceClosed,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl RelayError {
    /// True for per-packet decode failures that the caller drops silently.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            RelayError::InvalidPacket(_)
                | RelayError::PacketTooShort { .. }
                | RelayError::InvalidIpVersion(_)
                | RelayError::Unsupported(_)
        )
    }
}
