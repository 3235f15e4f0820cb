//! Connection Manager
//!
//! Owns the stream, the single in-flight command slot and the retry
//! bookkeeping for one daemon connection.
//!
//! ## State Machine
//! ```text
//!  Disconnected ──► Connecting ──► Connected ──► Ready
//!       ▲               │              │           │
//!       │               └──────────────┴─────┬─────┘
//!       │                  error/close/end   ▼
//!   (timer fires) ◄── Retrying ◄─────────── Ended ──► Closed
//!                                                      ▲
//!  Ready ──(shutdown)──► Closing ──(end/close)─────────┘
//! ```
//!
//! The manager never calls user code. Continuations, write hooks and
//! notifications are queued as [`Effect`]s in the order they happen; the
//! owner drains them with [`ConnectionManager::take_effects`] and runs them
//! after releasing any lock it holds on the manager.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::Sender;

use crate::config::Config;
use crate::error::{IiodError, Result};
use crate::protocol::{
    encode_command, Command, Continuation, DecodeOutcome, Reply, ReplyDecoder, WriteHook,
};
use crate::retry::{RetryDecision, RetryPolicy};
use super::timer::RetryTimer;
use super::transport::{Connector, EventSink, LoopEvent, Stream, TransportEvent};

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Ready,
    Retrying,
    Closing,
    Ended,
    Closed,
}

/// Event surfaced to observers of the connection
#[derive(Debug, Clone)]
pub enum Notification {
    /// The stream connected
    Connect,

    /// Commands may be submitted
    Ready,

    /// A reconnect has been scheduled
    Reconnecting {
        delay: Duration,
        attempt: u32,
        cause: Option<String>,
    },

    /// The stream went away (once per disconnect episode)
    End,

    Error(Arc<IiodError>),
}

impl Notification {
    /// Event name as used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Notification::Connect => "connect",
            Notification::Ready => "ready",
            Notification::Reconnecting { .. } => "reconnecting",
            Notification::End => "end",
            Notification::Error(_) => "error",
        }
    }
}

/// Deferred side effect produced by the manager
pub enum Effect {
    Notify(Notification),
    Written(WriteHook),
    Resolve {
        continuation: Continuation,
        result: Result<Reply>,
    },
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::Notify(notification) => f.debug_tuple("Notify").field(notification).finish(),
            Effect::Written(_) => f.write_str("Written"),
            Effect::Resolve { result, .. } => {
                f.debug_struct("Resolve").field("result", result).finish()
            }
        }
    }
}

/// Run effects in order, handing notifications to `notify`
pub fn run_effects<N>(effects: Vec<Effect>, mut notify: N)
where
    N: FnMut(Notification),
{
    for effect in effects {
        match effect {
            Effect::Notify(notification) => notify(notification),
            Effect::Written(hook) => hook(),
            Effect::Resolve {
                continuation,
                result,
            } => continuation(result),
        }
    }
}

/// Why the stream is considered gone
#[derive(Debug, Clone, Copy)]
enum GoneReason {
    Error,
    Close,
    End,
}

/// State machine for one daemon connection
pub struct ConnectionManager {
    config: Config,
    addr: SocketAddr,
    policy: RetryPolicy,
    connector: Box<dyn Connector>,
    events: Sender<LoopEvent>,

    /// Current stream and its epoch; events from other epochs are stale
    stream: Option<Box<dyn Stream>>,
    epoch: u64,
    state: ConnectionState,
    decoder: ReplyDecoder,

    /// Command awaiting a reply on the current stream
    current: Option<Command>,

    /// Command that was in flight when the stream died. It stays pending
    /// until the caller resends it, retries run out, or the connection closes.
    parked: Option<Command>,

    retry_attempts: u32,
    timer: RetryTimer,

    /// User asked for shutdown, or retries are exhausted: never reconnect
    closing: bool,
    emitted_end: bool,
    times_connected: u64,

    effects: Vec<Effect>,
    span: tracing::Span,
}

impl ConnectionManager {
    /// Create a manager; resolves the address but does not connect yet
    pub fn new(
        config: Config,
        connector: Box<dyn Connector>,
        events: Sender<LoopEvent>,
    ) -> Result<Self> {
        let addr = config.resolve()?;
        let span = tracing::debug_span!("iiod_connection", addr = %addr);

        Ok(Self {
            policy: config.retry_policy(),
            config,
            addr,
            connector,
            events,
            stream: None,
            epoch: 0,
            state: ConnectionState::Disconnected,
            decoder: ReplyDecoder::new(),
            current: None,
            parked: None,
            retry_attempts: 0,
            timer: RetryTimer::new(),
            closing: false,
            emitted_end: false,
            times_connected: 0,
            effects: Vec::new(),
            span,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Epoch of the current stream
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// A command is waiting for its reply, or was interrupted by a reconnect
    pub fn has_outstanding(&self) -> bool {
        self.current.is_some() || self.parked.is_some()
    }

    /// The outstanding command was cut off by a lost stream and has not been
    /// written again
    pub fn has_interrupted(&self) -> bool {
        self.parked.is_some()
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    pub fn times_connected(&self) -> u64 {
        self.times_connected
    }

    /// When the pending reconnect should fire, if one is scheduled
    pub fn retry_deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    /// Drain queued effects
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the first stream
    pub fn start(&mut self) {
        if self.state == ConnectionState::Disconnected && !self.closing {
            self.create_stream();
        }
    }

    /// Graceful close without sending anything. Pending work fails with
    /// [`IiodError::StreamClosed`].
    pub fn shutdown(&mut self) {
        let span = self.span.clone();
        let _enter = span.enter();

        if self.closing && self.stream.is_none() {
            return;
        }

        if self.timer.cancel() {
            tracing::debug!("Cancelled pending reconnect");
        }
        self.closing = true;
        self.fail_pending(|| IiodError::StreamClosed);

        match self.state {
            ConnectionState::Connected | ConnectionState::Ready => {
                if let Some(stream) = self.stream.as_mut() {
                    stream.shutdown();
                }
                self.state = ConnectionState::Closing;
                tracing::debug!("Closing connection");
            }
            ConnectionState::Closing => {}
            _ => {
                self.teardown_stream();
                self.state = ConnectionState::Closed;
                tracing::debug!("Connection closed before it was established");
            }
        }
    }

    /// Close immediately, without waiting for the transport to confirm
    pub(crate) fn force_close(&mut self) {
        self.shutdown();
        self.teardown_stream();
        self.state = ConnectionState::Closed;
    }

    /// Fire the reconnect timer if it is due
    pub fn poll_retry_timer(&mut self, now: Instant) {
        if !self.timer.fire_if_due(now) {
            return;
        }

        let span = self.span.clone();
        let _enter = span.enter();

        if self.closing {
            return;
        }

        tracing::debug!(attempt = self.retry_attempts, "Retrying connection");
        self.state = ConnectionState::Disconnected;
        self.create_stream();
    }

    fn create_stream(&mut self) {
        self.teardown_stream();
        self.decoder.reset();

        self.epoch += 1;
        let sink = EventSink::new(self.epoch, self.events.clone());
        self.stream = Some(self.connector.connect(self.addr, &self.config, sink));
        self.state = ConnectionState::Connecting;

        tracing::debug!(epoch = self.epoch, "Connecting");
    }

    fn teardown_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.destroy();
        }
        self.decoder.reset();
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Submit a command. Returns true if it was written to the transport.
    ///
    /// When false is returned the continuation has already been scheduled
    /// with the reason.
    pub fn submit(&mut self, command: Command) -> bool {
        let span = self.span.clone();
        let _enter = span.enter();

        let writable = self.stream.as_ref().map(|s| s.is_writable()).unwrap_or(false);
        if self.state != ConnectionState::Ready || !writable {
            tracing::debug!(code = %command.code(), state = ?self.state, "Not ready for write");
            self.resolve(command, Err(IiodError::NotReady));
            return false;
        }

        if self.has_outstanding() {
            tracing::debug!(code = %command.code(), "Rejected, a command is already in flight");
            self.resolve(command, Err(IiodError::CommandInFlight));
            return false;
        }

        self.send(command)
    }

    /// Write the interrupted command again on the current stream. Returns
    /// true if it was written.
    ///
    /// Nothing happens unless the connection is ready; the command stays
    /// pending and no continuation runs.
    pub fn resend_interrupted(&mut self) -> bool {
        let span = self.span.clone();
        let _enter = span.enter();

        let writable = self.stream.as_ref().map(|s| s.is_writable()).unwrap_or(false);
        if self.state != ConnectionState::Ready || !writable || self.current.is_some() {
            return false;
        }

        match self.parked.take() {
            Some(command) => {
                tracing::debug!(code = %command.code(), "Resending interrupted command");
                self.send(command)
            }
            None => false,
        }
    }

    fn send(&mut self, mut command: Command) -> bool {
        let line = match encode_command(&command) {
            Ok(line) => line,
            Err(e) => {
                tracing::debug!("Invalid command: {}", e);
                self.resolve(command, Err(e));
                return false;
            }
        };

        tracing::trace!("Send {}", String::from_utf8_lossy(&line).trim_end());

        let written = match self.stream.as_mut() {
            Some(stream) => stream.write(&line),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no stream")),
        };

        let hook = command.take_write_hook();

        if let Err(e) = written {
            if command.expects_reply() {
                self.current = Some(command);
            } else {
                let cause = format!("write failed: {}", e);
                self.resolve(command, Err(IiodError::Transport(cause)));
            }
            self.on_error(e);
            return false;
        }

        if let Some(hook) = hook {
            self.effects.push(Effect::Written(hook));
        }

        if command.expects_reply() {
            self.current = Some(command);
        } else {
            self.resolve(command, Ok(Reply::Written));
        }
        true
    }

    // =========================================================================
    // Transport Events
    // =========================================================================

    /// Handle a signal from the stream with the given epoch
    pub fn handle_transport_event(&mut self, epoch: u64, event: TransportEvent) {
        let span = self.span.clone();
        let _enter = span.enter();

        if epoch != self.epoch || self.stream.is_none() {
            tracing::trace!(epoch, current = self.epoch, "Ignoring event from stale stream");
            return;
        }

        match event {
            TransportEvent::Connected => self.on_connect(),
            TransportEvent::Data(bytes) => self.on_data(bytes),
            TransportEvent::Error(e) => self.on_error(e),
            TransportEvent::Close => self.connection_gone(GoneReason::Close, None),
            TransportEvent::End => self.connection_gone(GoneReason::End, None),
        }
    }

    fn on_connect(&mut self) {
        if self.state != ConnectionState::Connecting {
            tracing::warn!(state = ?self.state, "Unexpected connect signal");
            return;
        }

        self.state = ConnectionState::Connected;
        self.times_connected += 1;
        self.emitted_end = false;
        self.retry_attempts = 0;
        self.timer.cancel();
        tracing::info!("Stream connected to {}", self.config.address_label());
        self.notify(Notification::Connect);

        // No handshake: connected means ready
        self.state = ConnectionState::Ready;
        self.notify(Notification::Ready);

        if let Some(command) = self.parked.as_ref() {
            tracing::info!(code = %command.code(), "Interrupted command awaits resend");
        }
    }

    fn on_data(&mut self, bytes: Bytes) {
        tracing::trace!(len = bytes.len(), "Received {:?}", String::from_utf8_lossy(&bytes));

        if self.closing {
            tracing::debug!(len = bytes.len(), "Discarding data received while closing");
            return;
        }

        let Some(command) = self.current.as_ref() else {
            self.on_framing_error(format!("{} unsolicited bytes received", bytes.len()));
            return;
        };
        let kind = command.code().reply_kind();

        match self.decoder.decode(&bytes, kind) {
            Ok(DecodeOutcome::Complete(reply)) => {
                // A reply followed by stray bytes comes from a desynchronized
                // stream and is not delivered
                let surplus = self.decoder.pending_len();
                if surplus > 0 {
                    self.on_framing_error(format!("{} bytes trailing a complete reply", surplus));
                    return;
                }
                if let Some(command) = self.current.take() {
                    tracing::debug!(code = %command.code(), "Reply complete");
                    self.resolve(command, Ok(reply));
                }
            }
            Ok(DecodeOutcome::NeedMoreData) => {}
            Err(IiodError::ProtocolFraming(message)) => self.on_framing_error(message),
            Err(e) => self.on_framing_error(e.to_string()),
        }
    }

    /// The byte stream is out of sync: fail the in-flight command and
    /// recreate the stream without touching the retry budget.
    fn on_framing_error(&mut self, message: String) {
        tracing::warn!("Fatal framing error: {}", message);

        if let Some(command) = self.current.take() {
            self.resolve(command, Err(IiodError::ProtocolFraming(message.clone())));
        }
        self.notify(Notification::Error(Arc::new(IiodError::ProtocolFraming(message))));

        if !self.emitted_end {
            self.emitted_end = true;
            self.notify(Notification::End);
        }

        if self.closing {
            self.teardown_stream();
            self.state = ConnectionState::Closed;
            return;
        }

        self.create_stream();
    }

    fn on_error(&mut self, error: io::Error) {
        if self.closing {
            tracing::debug!("Ignoring error while closing: {}", error);
            return;
        }

        let message = format!(
            "iiod connection to {} failed - {}",
            self.config.address_label(),
            error
        );
        tracing::debug!("{}", message);

        // With retries on, the error is only surfaced once they run out
        if !self.policy.is_enabled() {
            self.notify(Notification::Error(Arc::new(IiodError::Transport(message.clone()))));
        }

        self.connection_gone(GoneReason::Error, Some(message));
    }

    fn connection_gone(&mut self, why: GoneReason, cause: Option<String>) {
        if self.timer.is_active() {
            return;
        }

        tracing::debug!(?why, "Connection is gone");
        self.state = ConnectionState::Ended;

        // End and close are collapsed into one notification per episode
        if !self.emitted_end {
            self.emitted_end = true;
            self.notify(Notification::End);
        }

        if self.closing {
            tracing::debug!("Connection ended by shutdown, not retrying");
            self.fail_pending(|| IiodError::StreamClosed);
            self.teardown_stream();
            self.state = ConnectionState::Closed;
            return;
        }

        match self.policy.decide(self.retry_attempts) {
            RetryDecision::GiveUp => {
                tracing::error!(
                    attempts = self.retry_attempts,
                    "Connection broken, giving up on {}",
                    self.config.address_label()
                );
                self.fail_pending(|| IiodError::ConnectionBroken {
                    cause: cause.clone(),
                });
                self.closing = true;
                self.teardown_stream();
                self.state = ConnectionState::Closed;
                self.notify(Notification::Error(Arc::new(IiodError::ConnectionBroken {
                    cause,
                })));
            }
            RetryDecision::Proceed { attempt, delay } => {
                self.retry_attempts = attempt;
                if let Some(command) = self.current.take() {
                    self.parked = Some(command);
                }
                self.teardown_stream();
                self.state = ConnectionState::Retrying;
                self.timer.schedule(Instant::now(), delay);

                tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");
                self.notify(Notification::Reconnecting {
                    delay,
                    attempt,
                    cause,
                });
            }
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn notify(&mut self, notification: Notification) {
        self.effects.push(Effect::Notify(notification));
    }

    fn resolve(&mut self, command: Command, result: Result<Reply>) {
        self.effects.push(Effect::Resolve {
            continuation: command.into_continuation(),
            result,
        });
    }

    fn fail_pending<F>(&mut self, error: F)
    where
        F: Fn() -> IiodError,
    {
        for command in [self.current.take(), self.parked.take()].into_iter().flatten() {
            tracing::debug!(code = %command.code(), "Aborting pending command");
            self.resolve(command, Err(error()));
        }
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("addr", &self.addr)
            .field("state", &self.state)
            .field("epoch", &self.epoch)
            .field("current", &self.current)
            .field("parked", &self.parked)
            .field("retry_attempts", &self.retry_attempts)
            .field("closing", &self.closing)
            .finish()
    }
}
