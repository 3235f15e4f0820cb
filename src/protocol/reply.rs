//! Reply definitions
//!
//! Represents decoded replies from the daemon.

use bytes::Bytes;

use crate::error::{IiodError, Result};

/// Daemon version as reported by `VERSION`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub maj: u32,
    pub min: u32,
    /// Opaque build tag (usually a git hash)
    pub tag: String,
}

/// A decoded reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Answer to `VERSION`
    Version(Version),

    /// Bare status: 0 = success without payload, negative = daemon error code
    Status(i64),

    /// Length-prefixed text payload
    Text(String),

    /// Length-prefixed raw payload (buffer reads)
    Binary(Bytes),

    /// The command was written and no reply is expected
    Written,
}

impl Reply {
    pub fn as_version(&self) -> Option<&Version> {
        match self {
            Reply::Version(version) => Some(version),
            _ => None,
        }
    }

    pub fn as_status(&self) -> Option<i64> {
        match self {
            Reply::Status(code) => Some(*code),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Reply::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::Binary(bytes) => Some(bytes),
            Reply::Text(text) => Some(text.as_bytes()),
            _ => None,
        }
    }

    /// Negative status codes are the daemon reporting a failure (`-errno`)
    pub fn is_error_code(&self) -> bool {
        matches!(self, Reply::Status(code) if *code < 0)
    }

    /// Status code of a bare status reply, or an error for any other shape
    pub fn into_result_code(self) -> Result<i64> {
        match self {
            Reply::Status(code) => Ok(code),
            other => Err(IiodError::UnexpectedReply(format!(
                "expected status code, got {:?}",
                other
            ))),
        }
    }
}
