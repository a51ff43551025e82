use std::io;

use thiserror::Error;

/// Errors returned by the packetline event loop.
#[derive(Debug, Error)]
pub enum Error {
    /// io_uring or socket operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Ring setup failed (e.g., unsupported kernel features).
    #[error("ring setup: {0}")]
    RingSetup(String),
    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Config(String),
    /// Malformed endpoint URI.
    #[error("invalid endpoint URI: {0}")]
    InvalidUri(String),
}

/// Errors returned when publishing an outbound datagram.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The owning port has been removed or the loop has shut down.
    #[error("port closed")]
    PortClosed,
}
