//! Protocol Module
//!
//! Defines the IIOD line protocol spoken over the client connection.
//!
//! ## Protocol Format
//!
//! ### Request Format
//! ```text
//! ┌──────────┬─────┬───────┬─────┬───────┬──────┐
//! │  CODE    │ ' ' │ arg1  │ ' ' │ argN  │ \r\n │
//! └──────────┴─────┴───────┴─────┴───────┴──────┘
//! ```
//!
//! ### Commands
//! - VERSION                                        -> version line
//! - PRINT                                          -> length + XML context
//! - TIMEOUT <ms>                                   -> status
//! - GETTRIG <device>                               -> status or length + name
//! - SETTRIG <device> [<trigger>]                   -> status
//! - READ <device> <INPUT|OUTPUT> <channel> <attr>  -> status or length + value
//! - OPEN <device> <samples> <mask> [CYCLIC]        -> status
//! - READBUF <device> <bytes>                       -> status or length + raw bytes
//! - EXIT                                           -> no reply
//!
//! ### Reply Format
//! ```text
//! ┌──────────────┬──────┬─────────────────────────────┐
//! │ status/len   │ \n   │ payload (len > 0 only)      │
//! └──────────────┴──────┴─────────────────────────────┘
//! ```
//!
//! ### Status Codes
//! - 0:   OK, no payload
//! - < 0: daemon error (negated errno)
//! - > 0: payload length

mod command;
mod reply;
mod codec;

pub use command::{Arg, Command, CommandCode, Continuation, Direction, ReplyKind, WriteHook};
pub use reply::{Reply, Version};
pub use codec::{
    decode_command_line, encode_command, encode_line, parse_version, CommandLine,
    DecodeOutcome, ReplyDecoder, MAX_LINE_LENGTH, MAX_PAYLOAD_SIZE,
};
