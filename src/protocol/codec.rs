//! Protocol codec
//!
//! Encoding of command lines and incremental decoding of replies.
//!
//! ## Wire Format
//!
//! ### Request (Command) Format
//! ```text
//! <CODE> <arg1> <arg2> ... <argN>\r\n
//! ```
//!
//! ### Reply Formats
//! ```text
//! Version:  MAJ.MIN.tag\n
//! Status:   <code>\n                       code <= 0
//! Text:     <n>\n<payload of n bytes>\n    \r before \n is tolerated
//! Binary:   <n>\n<n raw bytes>             no terminator, may contain \n
//! ```
//!
//! Replies may arrive split across any number of transport reads. The
//! decoder keeps the unconsumed tail between calls and only drops it on a
//! fatal framing error.

use bytes::{Bytes, BytesMut};

use crate::error::{IiodError, Result};
use super::{Arg, Command, CommandCode, ReplyKind, Reply, Version};

/// Maximum payload size a length line may declare (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Maximum length of a version or status line
pub const MAX_LINE_LENGTH: usize = 4096;

/// Line terminator for outbound commands
const COMMAND_TERMINATOR: &[u8] = b"\r\n";

// =============================================================================
// Command Encoding
// =============================================================================

/// Encode a command to its wire line
///
/// Format: `CODE arg arg ...\r\n`. Fails without producing any bytes if an
/// argument cannot be represented as a single token.
pub fn encode_command(command: &Command) -> Result<Vec<u8>> {
    encode_line(command.code(), command.args())
}

/// Encode a code and argument list to a wire line
pub fn encode_line(code: CommandCode, args: &[Arg]) -> Result<Vec<u8>> {
    let mut line = Vec::with_capacity(16 + args.len() * 8);
    line.extend_from_slice(code.as_str().as_bytes());

    for arg in args {
        if let Arg::Text(text) = arg {
            validate_token(code, text)?;
        }
        line.push(b' ');
        line.extend_from_slice(arg.to_string().as_bytes());
    }

    line.extend_from_slice(COMMAND_TERMINATOR);
    Ok(line)
}

/// Arguments are space separated with no escaping, so a token must be
/// non-empty and free of whitespace and control bytes.
fn validate_token(code: CommandCode, token: &str) -> Result<()> {
    if token.is_empty() {
        return Err(IiodError::Encoding {
            command: code.to_string(),
            reason: "empty argument".to_string(),
        });
    }

    if let Some(bad) = token.chars().find(|c| c.is_whitespace() || c.is_control()) {
        return Err(IiodError::Encoding {
            command: code.to_string(),
            reason: format!("argument {:?} contains invalid character {:?}", token, bad),
        });
    }

    Ok(())
}

/// A command line parsed back from the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub code: CommandCode,
    pub args: Vec<String>,
}

/// Decode a single command line (including its `\r\n`)
pub fn decode_command_line(bytes: &[u8]) -> Result<CommandLine> {
    let body = bytes.strip_suffix(COMMAND_TERMINATOR).ok_or_else(|| {
        IiodError::ProtocolFraming("command line is not terminated by CRLF".to_string())
    })?;

    let text = std::str::from_utf8(body).map_err(|_| {
        IiodError::ProtocolFraming("command line is not valid UTF-8".to_string())
    })?;

    let mut tokens = text.split(' ');
    let keyword = tokens.next().unwrap_or_default();
    let code = CommandCode::from_keyword(keyword).ok_or_else(|| {
        IiodError::ProtocolFraming(format!("unknown command keyword {:?}", keyword))
    })?;

    let args = tokens.map(str::to_string).collect::<Vec<_>>();
    if args.iter().any(String::is_empty) {
        return Err(IiodError::ProtocolFraming(format!(
            "empty argument in {} command line",
            code
        )));
    }

    Ok(CommandLine { code, args })
}

// =============================================================================
// Reply Decoding
// =============================================================================

/// Result of feeding bytes to the decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// A full reply was assembled
    Complete(Reply),

    /// The reply is not complete yet; everything received so far is kept
    NeedMoreData,
}

/// Incremental reply decoder
///
/// `decode` errors are fatal framing errors: the decoder has already reset
/// itself and the stream must be recreated.
#[derive(Debug, Default)]
pub struct ReplyDecoder {
    /// Unconsumed received bytes
    pending: BytesMut,

    /// Prefix of `pending` already searched for a line terminator
    scanned: usize,

    /// Lines extracted for the reply being assembled
    lines: Vec<String>,
}

impl ReplyDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all buffered state
    pub fn reset(&mut self) {
        self.pending.clear();
        self.scanned = 0;
        self.lines.clear();
    }

    /// Bytes received but not yet consumed by a reply
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn collected_lines(&self) -> &[String] {
        &self.lines
    }

    /// Append `data` and try to complete a reply of shape `kind`
    ///
    /// Bytes trailing a raw payload are fatal. After a complete line-framed
    /// reply any surplus bytes stay buffered; the caller decides what
    /// unsolicited data means.
    pub fn decode(&mut self, data: &[u8], kind: ReplyKind) -> Result<DecodeOutcome> {
        self.pending.extend_from_slice(data);

        let outcome = match kind {
            ReplyKind::Version => self.decode_version(),
            ReplyKind::Status => self.decode_status(false),
            ReplyKind::Binary => self.decode_status(true),
            ReplyKind::None => Err(IiodError::ProtocolFraming(
                "received data for a command that expects no reply".to_string(),
            )),
        };

        match outcome {
            Ok(DecodeOutcome::Complete(reply)) => {
                self.lines.clear();
                Ok(DecodeOutcome::Complete(reply))
            }
            Ok(DecodeOutcome::NeedMoreData) => Ok(DecodeOutcome::NeedMoreData),
            Err(e) => {
                tracing::debug!(
                    pending = self.pending.len(),
                    lines = self.lines.len(),
                    "Decoder reset after framing error"
                );
                self.reset();
                Err(e)
            }
        }
    }

    /// `MAJ.MIN.tag\n`
    fn decode_version(&mut self) -> Result<DecodeOutcome> {
        match self.next_line(MAX_LINE_LENGTH)? {
            Some(line) => Ok(DecodeOutcome::Complete(Reply::Version(parse_version(&line)?))),
            None => Ok(DecodeOutcome::NeedMoreData),
        }
    }

    /// Status line, then a length-matched text line or raw byte run
    fn decode_status(&mut self, binary: bool) -> Result<DecodeOutcome> {
        if self.lines.is_empty() {
            let Some(line) = self.next_line(MAX_LINE_LENGTH)? else {
                return Ok(DecodeOutcome::NeedMoreData);
            };

            // A non-integer first line cannot begin any valid reply, so it is
            // rejected as soon as it is complete rather than after a second line
            let code = parse_status(&line)?;
            if code <= 0 {
                return Ok(DecodeOutcome::Complete(Reply::Status(code)));
            }

            self.lines.push(line);
        }

        let expected = declared_length(&self.lines[0])?;

        if binary {
            if self.pending.len() < expected {
                return Ok(DecodeOutcome::NeedMoreData);
            }
            // Only one command is outstanding, so nothing may follow the payload
            if self.pending.len() > expected {
                return Err(IiodError::ProtocolFraming(format!(
                    "declared length {} but {} raw bytes received",
                    expected,
                    self.pending.len()
                )));
            }
            let payload: Bytes = self.pending.split_to(expected).freeze();
            self.scanned = 0;
            return Ok(DecodeOutcome::Complete(Reply::Binary(payload)));
        }

        // One extra byte for an optional '\r'
        let Some(line) = self.next_line(expected + 1)? else {
            return Ok(DecodeOutcome::NeedMoreData);
        };

        if line.len() != expected {
            return Err(IiodError::ProtocolFraming(format!(
                "declared length {} but payload line has {} bytes",
                expected,
                line.len()
            )));
        }

        self.lines.push(line.clone());
        Ok(DecodeOutcome::Complete(Reply::Text(line)))
    }

    /// Extract the next `\n` terminated line, stripping a trailing `\r`
    ///
    /// Returns `Ok(None)` when no terminator has arrived yet. An unterminated
    /// run longer than `limit` can never become a valid line and is fatal.
    fn next_line(&mut self, limit: usize) -> Result<Option<String>> {
        let newline = self.pending[self.scanned..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|pos| self.scanned + pos);

        let Some(end) = newline else {
            self.scanned = self.pending.len();
            if self.pending.len() > limit {
                return Err(IiodError::ProtocolFraming(format!(
                    "no line terminator within {} bytes",
                    limit
                )));
            }
            return Ok(None);
        };

        let mut raw = self.pending.split_to(end + 1);
        self.scanned = 0;
        raw.truncate(end);
        if raw.last() == Some(&b'\r') {
            raw.truncate(raw.len() - 1);
        }

        String::from_utf8(raw.to_vec())
            .map(Some)
            .map_err(|_| IiodError::ProtocolFraming("reply line is not valid UTF-8".to_string()))
    }
}

fn parse_status(line: &str) -> Result<i64> {
    line.parse::<i64>().map_err(|_| {
        IiodError::ProtocolFraming(format!("expected integer status line, got {:?}", line))
    })
}

fn declared_length(line: &str) -> Result<usize> {
    let length = line.parse::<usize>().map_err(|_| {
        IiodError::ProtocolFraming(format!("expected payload length, got {:?}", line))
    })?;

    if length > MAX_PAYLOAD_SIZE {
        return Err(IiodError::ProtocolFraming(format!(
            "payload too large: {} bytes (max {})",
            length, MAX_PAYLOAD_SIZE
        )));
    }

    Ok(length)
}

/// Parse `MAJ.MIN.tail`; `tail` is trimmed and kept opaque
pub fn parse_version(line: &str) -> Result<Version> {
    let mut parts = line.splitn(3, '.');
    let (Some(maj), Some(min), Some(tag)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(IiodError::ProtocolFraming(format!(
            "malformed version line {:?}",
            line
        )));
    };

    let maj = maj.trim().parse::<u32>().map_err(|_| {
        IiodError::ProtocolFraming(format!("invalid major version {:?}", maj))
    })?;
    let min = min.trim().parse::<u32>().map_err(|_| {
        IiodError::ProtocolFraming(format!("invalid minor version {:?}", min))
    })?;

    Ok(Version {
        maj,
        min,
        tag: tag.trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_line_keeps_partial_tail() {
        let mut decoder = ReplyDecoder::new();
        assert_eq!(
            decoder.decode(b"12", ReplyKind::Status).unwrap(),
            DecodeOutcome::NeedMoreData
        );
        assert_eq!(decoder.pending_len(), 2);
        assert_eq!(decoder.scanned, 2);

        assert_eq!(
            decoder.decode(b"\n", ReplyKind::Status).unwrap(),
            DecodeOutcome::NeedMoreData
        );
        assert_eq!(decoder.collected_lines(), ["12"]);
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn test_crlf_stripped() {
        let mut decoder = ReplyDecoder::new();
        assert_eq!(
            decoder.decode(b"-22\r\n", ReplyKind::Status).unwrap(),
            DecodeOutcome::Complete(Reply::Status(-22))
        );
    }

    #[test]
    fn test_parse_version_trims_tag() {
        let version = parse_version("0.33.g1234abc  ").unwrap();
        assert_eq!(version.maj, 0);
        assert_eq!(version.min, 33);
        assert_eq!(version.tag, "g1234abc");
    }
}
