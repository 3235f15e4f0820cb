//! Client facade
//!
//! Public operations that build a [`Command`] and hand it to the connection.
//! Every operation returns immediately; the outcome arrives through the
//! callback, exactly once.
//!
//! ## Threading
//! A dispatcher thread applies transport events and retry timer expirations
//! to the connection manager. Facade calls lock the same manager directly,
//! so state changes happen one at a time. Callbacks run after the lock is
//! released, on whichever thread produced them, and may submit the next
//! command.
//!
//! ## Reconnects
//! A command in flight when the stream is lost is never written again on
//! its own. It keeps its callback pending; the caller either resends it
//! with [`Client::resend`] after the next `Ready` notification or lets it
//! fail when retries run out or the client is closed.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{IiodError, Result};
use crate::network::{
    run_effects, ConnectionManager, ConnectionState, Connector, LoopEvent, Notification,
    TcpConnector,
};
use crate::protocol::{Arg, Command, CommandCode, Direction, Reply};

/// Handle to one daemon connection
pub struct Client {
    shared: Arc<Shared>,
    dispatcher: Option<JoinHandle<()>>,
}

struct Shared {
    manager: Mutex<ConnectionManager>,
    subscribers: Mutex<Vec<Sender<Notification>>>,
    events: Sender<LoopEvent>,
}

impl Shared {
    /// Run `f` under the manager lock, then run the effects it produced
    fn with_manager<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut ConnectionManager) -> R,
    {
        let (result, effects) = {
            let mut manager = self.manager.lock();
            let result = f(&mut manager);
            (result, manager.take_effects())
        };

        run_effects(effects, |notification| self.publish(notification));
        result
    }

    fn publish(&self, notification: Notification) {
        tracing::trace!(event = notification.name(), "Notify");
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(notification.clone()).is_ok());
    }

    /// Let the dispatcher pick up a changed retry deadline
    fn wake(&self) {
        let _ = self.events.send(LoopEvent::Wake);
    }
}

impl Client {
    /// Create a client over TCP and start connecting
    pub fn connect(config: Config) -> Result<Self> {
        let client = Self::new(config)?;
        client.start();
        Ok(client)
    }

    /// Create a client over TCP without connecting yet, so that
    /// subscribers can be registered before the first notification
    pub fn new(config: Config) -> Result<Self> {
        Self::with_connector(config, TcpConnector::new())
    }

    /// Create a client over a custom transport without connecting yet
    pub fn with_connector<C>(config: Config, connector: C) -> Result<Self>
    where
        C: Connector + 'static,
    {
        let (events, receiver) = channel::unbounded();
        let manager = ConnectionManager::new(config, Box::new(connector), events.clone())?;

        let shared = Arc::new(Shared {
            manager: Mutex::new(manager),
            subscribers: Mutex::new(Vec::new()),
            events,
        });

        let dispatcher_shared = Arc::clone(&shared);
        let dispatcher = thread::Builder::new()
            .name("iiod-dispatch".to_string())
            .spawn(move || dispatch_loop(dispatcher_shared, receiver))?;

        Ok(Self {
            shared,
            dispatcher: Some(dispatcher),
        })
    }

    /// Open the first stream
    pub fn start(&self) {
        self.shared.with_manager(|manager| manager.start());
    }

    /// Receive every notification from now on
    pub fn subscribe(&self) -> Receiver<Notification> {
        let (tx, rx) = channel::unbounded();
        self.shared.subscribers.lock().push(tx);
        rx
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.manager.lock().state()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.manager.lock().is_ready()
    }

    /// Submit a prepared command. Returns true if it was written.
    pub fn submit(&self, command: Command) -> bool {
        let sent = self.shared.with_manager(|manager| manager.submit(command));
        self.shared.wake();
        sent
    }

    /// True while a command cut off by a reconnect waits for [`Client::resend`]
    pub fn has_interrupted(&self) -> bool {
        self.shared.manager.lock().has_interrupted()
    }

    /// Write the command interrupted by a reconnect again, once the new
    /// stream is ready. Returns true if it was written.
    ///
    /// The daemon session behind the new stream is fresh: state set up by
    /// earlier commands (an `OPEN`ed buffer, a timeout) is gone.
    pub fn resend(&self) -> bool {
        let sent = self.shared.with_manager(|manager| manager.resend_interrupted());
        self.shared.wake();
        sent
    }

    // =========================================================================
    // Daemon Operations
    // =========================================================================

    /// `VERSION`
    pub fn version<F>(&self, callback: F) -> bool
    where
        F: FnOnce(Result<Reply>) + Send + 'static,
    {
        self.submit(Command::new(CommandCode::Version, Vec::new(), callback))
    }

    /// `PRINT`: XML description of the context
    pub fn print<F>(&self, callback: F) -> bool
    where
        F: FnOnce(Result<Reply>) + Send + 'static,
    {
        self.submit(Command::new(CommandCode::Print, Vec::new(), callback))
    }

    /// `TIMEOUT <ms>`
    pub fn timeout<F>(&self, timeout_ms: u64, callback: F) -> bool
    where
        F: FnOnce(Result<Reply>) + Send + 'static,
    {
        self.submit(Command::new(
            CommandCode::Timeout,
            vec![Arg::from(timeout_ms)],
            callback,
        ))
    }

    /// `GETTRIG <device>`
    pub fn gettrig<F>(&self, device: &str, callback: F) -> bool
    where
        F: FnOnce(Result<Reply>) + Send + 'static,
    {
        self.submit(Command::new(
            CommandCode::GetTrig,
            vec![Arg::from(device)],
            callback,
        ))
    }

    /// `SETTRIG <device> [<trigger>]`; no trigger detaches the current one
    pub fn settrig<F>(&self, device: &str, trigger: Option<&str>, callback: F) -> bool
    where
        F: FnOnce(Result<Reply>) + Send + 'static,
    {
        let mut args = vec![Arg::from(device)];
        if let Some(trigger) = trigger {
            args.push(Arg::from(trigger));
        }
        self.submit(Command::new(CommandCode::SetTrig, args, callback))
    }

    /// `READ <device> <INPUT|OUTPUT> <channel> <attribute>`
    pub fn read<F>(
        &self,
        device: &str,
        direction: Direction,
        channel: &str,
        attribute: &str,
        callback: F,
    ) -> bool
    where
        F: FnOnce(Result<Reply>) + Send + 'static,
    {
        self.submit(Command::new(
            CommandCode::Read,
            vec![
                Arg::from(device),
                Arg::from(direction),
                Arg::from(channel),
                Arg::from(attribute),
            ],
            callback,
        ))
    }

    /// `OPEN <device> <samples_count> <mask> [CYCLIC]`
    ///
    /// `samples_count` sizes the kernel buffer; in cyclic mode the first
    /// buffer pushed to the hardware repeats continuously.
    pub fn open<F>(
        &self,
        device: &str,
        samples_count: usize,
        mask: &str,
        cyclic: bool,
        callback: F,
    ) -> bool
    where
        F: FnOnce(Result<Reply>) + Send + 'static,
    {
        let mut args = vec![Arg::from(device), Arg::from(samples_count), Arg::from(mask)];
        if cyclic {
            args.push(Arg::from("CYCLIC"));
        }
        self.submit(Command::new(CommandCode::Open, args, callback))
    }

    /// `READBUF <device> <bytes_count>`: raw samples
    pub fn readbuf<F>(&self, device: &str, bytes_count: usize, callback: F) -> bool
    where
        F: FnOnce(Result<Reply>) + Send + 'static,
    {
        self.submit(Command::new(
            CommandCode::ReadBuf,
            vec![Arg::from(device), Arg::from(bytes_count)],
            callback,
        ))
    }

    /// Send `EXIT`, then close. Returns true if `EXIT` was written.
    pub fn exit(&self) -> bool {
        let sent = self.shared.with_manager(|manager| {
            let exit = Command::new(CommandCode::Exit, Vec::new(), |_| {}).without_reply();
            let sent = manager.submit(exit);
            manager.shutdown();
            sent
        });
        self.shared.wake();
        sent
    }

    /// Close without sending anything
    pub fn end(&self) {
        self.shared.with_manager(|manager| manager.shutdown());
        self.shared.wake();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shared.with_manager(|manager| manager.force_close());
        let _ = self.shared.events.send(LoopEvent::Stop);

        if let Some(handle) = self.dispatcher.take() {
            // Dropped from inside a callback: the dispatcher exits on its own
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

/// Apply transport events and timer expirations until stopped
fn dispatch_loop(shared: Arc<Shared>, receiver: Receiver<LoopEvent>) {
    loop {
        let deadline = shared.manager.lock().retry_deadline();
        let received = match deadline {
            Some(deadline) => receiver.recv_deadline(deadline),
            None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(LoopEvent::Transport { epoch, event }) => {
                shared.with_manager(|manager| manager.handle_transport_event(epoch, event));
            }
            Ok(LoopEvent::Wake) => {}
            Ok(LoopEvent::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                shared.with_manager(|manager| manager.poll_retry_timer(Instant::now()));
            }
        }
    }

    tracing::debug!("Dispatcher stopped");
}

// =============================================================================
// Blocking Helpers
// =============================================================================

/// Receiving end of [`reply_channel`]
#[derive(Debug)]
pub struct ReplyReceiver {
    rx: Receiver<Result<Reply>>,
}

impl ReplyReceiver {
    /// Block until the reply arrives. Must not be called from a callback.
    pub fn wait(self) -> Result<Reply> {
        self.rx.recv().unwrap_or(Err(IiodError::StreamClosed))
    }

    /// Block for at most `timeout`; `None` if nothing arrived yet
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Reply>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(IiodError::StreamClosed)),
        }
    }
}

/// A callback paired with a receiver, for callers that prefer to block
pub fn reply_channel() -> (impl FnOnce(Result<Reply>) + Send + 'static, ReplyReceiver) {
    let (tx, rx) = channel::bounded(1);
    let callback = move |result: Result<Reply>| {
        let _ = tx.send(result);
    };
    (callback, ReplyReceiver { rx })
}
