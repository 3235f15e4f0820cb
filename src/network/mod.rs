//! Network Module
//!
//! Connection lifecycle and transport handling.
//!
//! ## Architecture
//! - One stream thread per TCP connection, reporting through an event channel
//! - One connection manager per client, driven one event at a time
//! - Reconnects scheduled on a single cancellable timer

mod connection;
mod tcp;
mod timer;
mod transport;

pub use connection::{run_effects, ConnectionManager, ConnectionState, Effect, Notification};
pub use tcp::TcpConnector;
pub use timer::RetryTimer;
pub use transport::{Connector, EventSink, LoopEvent, Stream, TransportEvent};
