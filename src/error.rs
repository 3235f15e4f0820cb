//! Error types for the IIOD client
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using IiodError
pub type Result<T> = std::result::Result<T, IiodError>;

/// Unified error type for IIOD client operations
#[derive(Debug, Error)]
pub enum IiodError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Protocol Errors
    // -------------------------------------------------------------------------
    /// A command argument cannot be rendered on the wire. The command never
    /// reaches the transport.
    #[error("Encoding error in {command} command: {reason}")]
    Encoding { command: String, reason: String },

    /// The reply stream can no longer be trusted; the stream is recreated.
    #[error("Protocol framing error: {0}")]
    ProtocolFraming(String),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    // -------------------------------------------------------------------------
    // Connection Errors
    // -------------------------------------------------------------------------
    #[error("Transport error: {0}")]
    Transport(String),

    /// Retry budget exhausted or retry disabled. Terminal for the connection.
    #[error("Connection in broken state: retry attempts exhausted{}", cause_suffix(.cause))]
    ConnectionBroken { cause: Option<String> },

    /// The connection was shut down on request while the command was pending.
    #[error("Stream connection ended and command aborted")]
    StreamClosed,

    #[error("Connection is not ready for commands")]
    NotReady,

    #[error("Another command is already awaiting a reply")]
    CommandInFlight,

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

fn cause_suffix(cause: &Option<String>) -> String {
    match cause {
        Some(cause) => format!(" ({})", cause),
        None => String::new(),
    }
}

impl IiodError {
    /// True for errors that end the connection for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, IiodError::ConnectionBroken { .. } | IiodError::StreamClosed)
    }
}
