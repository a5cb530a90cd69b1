// error.rs - Error types for the EtherNet/IP PLC emulator

use std::time::Duration;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PlcError>;

/// Errors surfaced by the PLC emulator.
///
/// Protocol-level failures that a client should see (missing tag, bad
/// transfer number, unknown service) are *not* errors here - they travel
/// back to the client inside the CIP reply status. This enum covers the
/// failures the host program has to deal with: socket trouble, malformed
/// configuration inputs and shutdown conditions.
#[derive(Debug, Error)]
pub enum PlcError {
    /// Underlying socket or file I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A read or write missed its deadline
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Malformed frame, path or payload
    #[error("protocol error: {0}")]
    Protocol(String),

    /// EDS file could not be parsed
    #[error("EDS error: {0}")]
    Eds(String),

    /// Tag construction or update rejected
    #[error("tag error: {0}")]
    Tag(String),

    /// JSON symbol database could not be decoded
    #[error("JSON import error: {0}")]
    Json(#[from] serde_json::Error),
}
