//! End-to-end tests for the Client facade
//!
//! Each test runs a scripted daemon on a loopback listener and talks to it
//! through the real TCP transport.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver};
use iiod_client::{
    reply_channel, Client, Config, ConnectionState, Direction, IiodError, Notification, Reply,
};

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Scripted Daemon
// =============================================================================

/// What the daemon does with one received command line
enum Answer {
    /// Write each chunk separately, pausing in between
    Chunks(Vec<Vec<u8>>),
    /// Drop the connection without answering
    Hangup,
}

struct FakeDaemon {
    addr: SocketAddr,
    seen: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl FakeDaemon {
    /// Serve `connections` connections one after the other
    fn spawn<F>(connections: usize, respond: F) -> Self
    where
        F: Fn(usize, &str) -> Answer + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);

        let handle = thread::spawn(move || {
            for index in 0..connections {
                let (mut stream, _) = match listener.accept() {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                let mut reader = BufReader::new(stream.try_clone().unwrap());

                loop {
                    let mut line = String::new();
                    match reader.read_line(&mut line) {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                    let line = line.trim_end().to_string();
                    log.lock().unwrap().push(line.clone());

                    match respond(index, &line) {
                        Answer::Chunks(chunks) => {
                            for chunk in chunks {
                                if stream.write_all(&chunk).is_err() {
                                    break;
                                }
                                let _ = stream.flush();
                                thread::sleep(Duration::from_millis(10));
                            }
                        }
                        Answer::Hangup => break,
                    }
                }
            }
        });

        Self { addr, seen, handle }
    }

    fn config(&self) -> Config {
        Config::builder()
            .host("127.0.0.1")
            .port(self.addr.port())
            .retry_delay_ms(50)
            .build()
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn chunks(parts: &[&[u8]]) -> Answer {
    Answer::Chunks(parts.iter().map(|p| p.to_vec()).collect())
}

/// Common replies of a healthy daemon
fn standard_reply(line: &str) -> Answer {
    match line {
        "VERSION" => chunks(&[b"0.33.a1b2c3d\n"]),
        "PRINT" => chunks(&[b"10\n<cont", b"ext/>\n"]),
        "EXIT" => Answer::Hangup,
        _ if line.starts_with("TIMEOUT") || line.starts_with("OPEN") => chunks(&[b"0\n"]),
        _ => chunks(&[b"-22\n"]),
    }
}

fn started_client(config: Config) -> (Client, Receiver<Notification>) {
    let client = Client::new(config).unwrap();
    let notifications = client.subscribe();
    client.start();
    (client, notifications)
}

/// Wait for a notification matching `pred`, collecting the names seen on the way
fn wait_for<P>(notifications: &Receiver<Notification>, pred: P) -> Vec<&'static str>
where
    P: Fn(&Notification) -> bool,
{
    let deadline = Instant::now() + WAIT;
    let mut names = Vec::new();
    loop {
        let notification = notifications
            .recv_deadline(deadline)
            .expect("notification did not arrive in time");
        names.push(notification.name());
        if pred(&notification) {
            return names;
        }
    }
}

fn wait_ready(notifications: &Receiver<Notification>) -> Vec<&'static str> {
    wait_for(notifications, |n| matches!(n, Notification::Ready))
}

fn wait_state(client: &Client, state: ConnectionState) {
    let deadline = Instant::now() + WAIT;
    while client.state() != state {
        assert!(Instant::now() < deadline, "state stuck at {:?}", client.state());
        thread::sleep(Duration::from_millis(10));
    }
}

// =============================================================================
// Command Tests
// =============================================================================

#[test]
fn test_version_and_print() {
    let daemon = FakeDaemon::spawn(1, |_, line| standard_reply(line));
    let (client, notifications) = started_client(daemon.config());
    assert_eq!(wait_ready(&notifications), vec!["connect", "ready"]);

    let (callback, receiver) = reply_channel();
    assert!(client.version(callback));
    let reply = receiver.wait().unwrap();
    let version = reply.as_version().unwrap();
    assert_eq!((version.maj, version.min), (0, 33));
    assert_eq!(version.tag, "a1b2c3d");

    let (callback, receiver) = reply_channel();
    assert!(client.print(callback));
    assert_eq!(receiver.wait().unwrap(), Reply::Text("<context/>".to_string()));

    assert_eq!(daemon.seen(), vec!["VERSION", "PRINT"]);
}

#[test]
fn test_read_error_code() {
    let daemon = FakeDaemon::spawn(1, |_, line| standard_reply(line));
    let (client, notifications) = started_client(daemon.config());
    wait_ready(&notifications);

    let (callback, receiver) = reply_channel();
    client.read("iio:device0", Direction::Input, "voltage0", "raw", callback);
    let reply = receiver.wait().unwrap();

    assert!(reply.is_error_code());
    assert_eq!(reply.as_status(), Some(-22));
    assert_eq!(daemon.seen(), vec!["READ iio:device0 INPUT voltage0 raw"]);
}

#[test]
fn test_open_then_binary_readbuf() {
    let daemon = FakeDaemon::spawn(1, |_, line| match line {
        "READBUF iio:device0 8" => chunks(&[b"8\n\x01\x0a", b"\x0d\x0a\x00", b"\xff\x10\x20"]),
        _ => standard_reply(line),
    });
    let (client, notifications) = started_client(daemon.config());
    wait_ready(&notifications);

    let (callback, receiver) = reply_channel();
    client.open("iio:device0", 400, "00000001", false, callback);
    assert_eq!(receiver.wait().unwrap(), Reply::Status(0));

    let (callback, receiver) = reply_channel();
    client.readbuf("iio:device0", 8, callback);
    let reply = receiver.wait().unwrap();
    assert_eq!(
        reply.as_bytes().unwrap(),
        &[0x01, 0x0a, 0x0d, 0x0a, 0x00, 0xff, 0x10, 0x20][..]
    );

    assert_eq!(
        daemon.seen(),
        vec!["OPEN iio:device0 400 00000001", "READBUF iio:device0 8"]
    );
}

#[test]
fn test_submit_before_start_is_not_ready() {
    let daemon = FakeDaemon::spawn(1, |_, line| standard_reply(line));
    let client = Client::new(daemon.config()).unwrap();

    let (callback, receiver) = reply_channel();
    assert!(!client.version(callback));
    assert!(matches!(receiver.wait(), Err(IiodError::NotReady)));
}

#[test]
fn test_callback_chains_next_command() {
    let daemon = FakeDaemon::spawn(1, |_, line| standard_reply(line));
    let (client, notifications) = started_client(daemon.config());
    let client = Arc::new(client);
    wait_ready(&notifications);

    let (tx, rx) = channel::bounded(1);
    let chained = Arc::clone(&client);
    client.timeout(2500, move |result| {
        assert_eq!(result.unwrap(), Reply::Status(0));
        chained.print(move |result| {
            let _ = tx.send(result);
        });
    });

    let reply = rx.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(reply, Reply::Text("<context/>".to_string()));
    assert_eq!(daemon.seen(), vec!["TIMEOUT 2500", "PRINT"]);
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_interrupted_command_waits_for_resend() {
    // The first connection hangs up on the first command
    let daemon = FakeDaemon::spawn(2, |index, line| {
        if index == 0 {
            Answer::Hangup
        } else {
            standard_reply(line)
        }
    });
    let (client, notifications) = started_client(daemon.config());
    wait_ready(&notifications);

    let (callback, receiver) = reply_channel();
    assert!(client.version(callback));

    let names = wait_for(&notifications, |n| matches!(n, Notification::Ready));
    assert_eq!(names, vec!["end", "reconnecting", "connect", "ready"]);

    // Nothing is replayed behind the caller's back
    assert!(receiver.wait_timeout(Duration::from_millis(200)).is_none());
    assert!(client.has_interrupted());
    assert_eq!(daemon.seen(), vec!["VERSION"]);

    assert!(client.resend());
    let reply = receiver.wait_timeout(WAIT).expect("reply after resend").unwrap();
    assert!(reply.as_version().is_some());
    assert!(!client.has_interrupted());
    assert_eq!(daemon.seen(), vec!["VERSION", "VERSION"]);
}

#[test]
fn test_connection_refused_without_retry() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let config = Config::builder()
        .host("127.0.0.1")
        .port(addr.port())
        .retry_on(false)
        .build();

    let (client, notifications) = started_client(config);
    wait_for(&notifications, |n| {
        matches!(n, Notification::Error(e) if matches!(**e, IiodError::ConnectionBroken { .. }))
    });

    wait_state(&client, ConnectionState::Closed);
    let (callback, receiver) = reply_channel();
    assert!(!client.version(callback));
    assert!(matches!(receiver.wait(), Err(IiodError::NotReady)));
}

#[test]
fn test_exit_closes_connection() {
    let daemon = FakeDaemon::spawn(1, |_, line| standard_reply(line));
    let (client, notifications) = started_client(daemon.config());
    wait_ready(&notifications);

    assert!(client.exit());
    wait_for(&notifications, |n| matches!(n, Notification::End));
    wait_state(&client, ConnectionState::Closed);

    drop(client);
    let FakeDaemon { seen, handle, .. } = daemon;
    handle.join().unwrap();
    assert_eq!(seen.lock().unwrap().clone(), vec!["EXIT"]);
}

#[test]
fn test_end_fails_outstanding_command() {
    // Never answers PRINT
    let daemon = FakeDaemon::spawn(1, |_, line| match line {
        "PRINT" => Answer::Chunks(Vec::new()),
        _ => standard_reply(line),
    });
    let (client, notifications) = started_client(daemon.config());
    wait_ready(&notifications);

    let (callback, receiver) = reply_channel();
    assert!(client.print(callback));
    client.end();

    assert!(matches!(receiver.wait(), Err(IiodError::StreamClosed)));
    wait_state(&client, ConnectionState::Closed);
}
