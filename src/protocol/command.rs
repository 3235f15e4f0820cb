//! Command definitions
//!
//! Represents requests sent to the daemon.

use std::fmt;

use crate::error::Result;
use super::Reply;

/// Callback receiving the outcome of a command. Invoked exactly once.
pub type Continuation = Box<dyn FnOnce(Result<Reply>) + Send + 'static>;

/// Side-effect run once the encoded command has been handed to the transport
pub type WriteHook = Box<dyn FnOnce() + Send + 'static>;

/// Request kinds understood by the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandCode {
    Help,
    Version,
    Print,
    Timeout,
    GetTrig,
    SetTrig,
    Read,
    ReadBuf,
    Write,
    WriteBuf,
    Open,
    Exit,
}

/// Shape of the reply a command produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// `MAJ.MIN.tag` line
    Version,
    /// Integer status line, optionally followed by a length-matched text line
    Status,
    /// Integer status line, optionally followed by length-matched raw bytes
    Binary,
    /// Nothing comes back
    None,
}

impl CommandCode {
    const ALL: [CommandCode; 12] = [
        CommandCode::Help,
        CommandCode::Version,
        CommandCode::Print,
        CommandCode::Timeout,
        CommandCode::GetTrig,
        CommandCode::SetTrig,
        CommandCode::Read,
        CommandCode::ReadBuf,
        CommandCode::Write,
        CommandCode::WriteBuf,
        CommandCode::Open,
        CommandCode::Exit,
    ];

    /// Keyword used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandCode::Help => "HELP",
            CommandCode::Version => "VERSION",
            CommandCode::Print => "PRINT",
            CommandCode::Timeout => "TIMEOUT",
            CommandCode::GetTrig => "GETTRIG",
            CommandCode::SetTrig => "SETTRIG",
            CommandCode::Read => "READ",
            CommandCode::ReadBuf => "READBUF",
            CommandCode::Write => "WRITE",
            CommandCode::WriteBuf => "WRITEBUF",
            CommandCode::Open => "OPEN",
            CommandCode::Exit => "EXIT",
        }
    }

    /// Parse a wire keyword
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|code| code.as_str() == keyword)
    }

    /// Reply shape the decoder must expect for this code
    pub fn reply_kind(&self) -> ReplyKind {
        match self {
            CommandCode::Version => ReplyKind::Version,
            CommandCode::ReadBuf => ReplyKind::Binary,
            CommandCode::Exit => ReplyKind::None,
            CommandCode::Help
            | CommandCode::Print
            | CommandCode::Timeout
            | CommandCode::GetTrig
            | CommandCode::SetTrig
            | CommandCode::Read
            | CommandCode::Write
            | CommandCode::WriteBuf
            | CommandCode::Open => ReplyKind::Status,
        }
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel direction for attribute access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Input => "INPUT",
            Direction::Output => "OUTPUT",
        }
    }
}

/// A single command argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    /// Passed through verbatim
    Text(String),
    /// Rendered in base 10; wide enough for any `i64` or `u64` count
    Int(i128),
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Text(text) => f.write_str(text),
            Arg::Int(value) => write!(f, "{}", value),
        }
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::Text(value.to_string())
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Arg::Text(value)
    }
}

impl From<Direction> for Arg {
    fn from(value: Direction) -> Self {
        Arg::Text(value.as_str().to_string())
    }
}

impl From<i64> for Arg {
    fn from(value: i64) -> Self {
        Arg::Int(value.into())
    }
}

impl From<u32> for Arg {
    fn from(value: u32) -> Self {
        Arg::Int(value.into())
    }
}

impl From<u64> for Arg {
    fn from(value: u64) -> Self {
        Arg::Int(value.into())
    }
}

impl From<usize> for Arg {
    fn from(value: usize) -> Self {
        Arg::from(value as u64)
    }
}

/// One request, owned by the connection from submission until resolved
pub struct Command {
    code: CommandCode,
    args: Vec<Arg>,
    expects_reply: bool,
    on_write: Option<WriteHook>,
    continuation: Continuation,
}

impl Command {
    /// Create a command expecting a reply
    pub fn new<F>(code: CommandCode, args: Vec<Arg>, continuation: F) -> Self
    where
        F: FnOnce(Result<Reply>) + Send + 'static,
    {
        Self {
            code,
            args,
            expects_reply: code.reply_kind() != ReplyKind::None,
            on_write: None,
            continuation: Box::new(continuation),
        }
    }

    /// Mark the command as fire-and-forget
    pub fn without_reply(mut self) -> Self {
        self.expects_reply = false;
        self
    }

    /// Run `hook` right after the command is written, before any reply
    pub fn on_write<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_write = Some(Box::new(hook));
        self
    }

    pub fn code(&self) -> CommandCode {
        self.code
    }

    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    pub fn expects_reply(&self) -> bool {
        self.expects_reply
    }

    /// Take the write hook, leaving none behind
    pub(crate) fn take_write_hook(&mut self) -> Option<WriteHook> {
        self.on_write.take()
    }

    /// Consume the command, handing back its continuation
    pub(crate) fn into_continuation(self) -> Continuation {
        self.continuation
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("code", &self.code)
            .field("args", &self.args)
            .field("expects_reply", &self.expects_reply)
            .field("on_write", &self.on_write.is_some())
            .finish()
    }
}
