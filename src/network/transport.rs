//! Transport boundary
//!
//! The connection manager drives any ordered, reliable byte stream through
//! these traits. Signals travel back as [`TransportEvent`]s tagged with the
//! epoch of the stream that produced them.

use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use crossbeam::channel::Sender;

use crate::config::Config;

/// Signal raised by a stream
#[derive(Debug)]
pub enum TransportEvent {
    /// The stream finished connecting
    Connected,

    /// Bytes arrived, in order
    Data(Bytes),

    /// Socket-level failure
    Error(io::Error),

    /// The peer finished sending
    End,

    /// The stream is fully closed
    Close,
}

/// Message processed by the client dispatcher
#[derive(Debug)]
pub enum LoopEvent {
    /// Transport signal from the stream with the given epoch
    Transport { epoch: u64, event: TransportEvent },

    /// Re-read timer deadlines
    Wake,

    /// Stop the dispatcher
    Stop,
}

/// Where a stream delivers its signals
#[derive(Debug, Clone)]
pub struct EventSink {
    epoch: u64,
    tx: Sender<LoopEvent>,
}

impl EventSink {
    pub fn new(epoch: u64, tx: Sender<LoopEvent>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Deliver an event. Returns false once nobody is listening any more.
    pub fn send(&self, event: TransportEvent) -> bool {
        self.tx
            .send(LoopEvent::Transport {
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }
}

/// An open (or opening) byte stream
pub trait Stream: Send {
    /// Whether `write` may currently be called
    fn is_writable(&self) -> bool;

    /// Write all of `bytes`
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Half-close after pending writes; `End`/`Close` follow
    fn shutdown(&mut self);

    /// Tear the stream down immediately; no further events are expected
    fn destroy(&mut self);
}

/// Factory for streams
pub trait Connector: Send {
    /// Start connecting to `addr`. Completion or failure is reported on
    /// `events`, never through the return value.
    fn connect(&mut self, addr: SocketAddr, config: &Config, events: EventSink) -> Box<dyn Stream>;
}
