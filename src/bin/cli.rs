//! IIOD CLI Client
//!
//! Command-line interface for talking to an IIO daemon.

use std::process;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use iiod_client::{
    reply_channel, AddressFamily, Client, Config, Direction, IiodError, Notification, Reply,
    Result,
};
use tracing_subscriber::{fmt, EnvFilter};

/// How often a blocked call checks for reconnects
const REPLY_POLL: Duration = Duration::from_millis(100);

/// IIOD CLI
#[derive(Parser, Debug)]
#[command(name = "iiod-cli")]
#[command(about = "CLI for the IIO daemon line protocol")]
#[command(version)]
struct Args {
    /// Daemon host
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Daemon port
    #[arg(short, long, default_value = "30431")]
    port: u16,

    /// Force IPv4 or IPv6
    #[arg(long, value_enum)]
    family: Option<Family>,

    /// Do not reconnect when the stream is lost
    #[arg(long)]
    no_retry: bool,

    /// Reconnect attempts before giving up
    #[arg(long, default_value = "10")]
    retry_attempts: u32,

    /// Delay between reconnect attempts in milliseconds
    #[arg(long, default_value = "200")]
    retry_delay: u64,

    /// Seconds to wait for the connection and for each reply
    #[arg(short, long, default_value = "10")]
    wait: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Family {
    V4,
    V6,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Io {
    Input,
    Output,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the daemon version
    Version,

    /// Print the XML context description
    Print,

    /// Set the daemon-side I/O timeout
    Timeout {
        /// Timeout in milliseconds
        ms: u64,
    },

    /// Show the trigger of a device
    Gettrig { device: String },

    /// Set (or clear) the trigger of a device
    Settrig {
        device: String,
        trigger: Option<String>,
    },

    /// Read a channel attribute
    Read {
        device: String,
        #[arg(value_enum)]
        direction: Io,
        channel: String,
        attribute: String,
    },

    /// Open a device buffer
    Open {
        device: String,
        /// Samples per buffer
        samples: usize,
        /// Channel mask (hex)
        mask: String,
        /// Repeat the first buffer pushed to the hardware
        #[arg(long)]
        cyclic: bool,
    },

    /// Open a device buffer, then read raw bytes from it
    Readbuf {
        device: String,
        /// Samples per buffer
        #[arg(long, default_value = "400")]
        samples: usize,
        /// Channel mask (hex)
        #[arg(long, default_value = "00000001")]
        mask: String,
        /// Bytes to read
        bytes: usize,
    },

    /// Run the version, print, timeout, read, open, readbuf sequence
    Acquire {
        device: String,
        /// Channel used for the sampling frequency read
        channel: String,
        #[arg(long, default_value = "sampling_frequency")]
        attribute: String,
        #[arg(long, default_value = "2500")]
        timeout_ms: u64,
        #[arg(long, default_value = "400")]
        samples: usize,
        #[arg(long, default_value = "00000001")]
        mask: String,
        /// Number of buffers to read
        #[arg(long, default_value = "1")]
        count: usize,
    },

    /// Ask the daemon to close the connection
    Exit,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,iiod_client=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let family = match args.family {
        Some(Family::V4) => AddressFamily::V4,
        Some(Family::V6) => AddressFamily::V6,
        None => AddressFamily::Auto,
    };

    let config = Config::builder()
        .host(&args.host)
        .port(args.port)
        .family(family)
        .retry_on(!args.no_retry)
        .retry_attempts(args.retry_attempts)
        .retry_delay_ms(args.retry_delay)
        .build();

    tracing::debug!("iiod-cli v{}", iiod_client::VERSION);

    if let Err(e) = run(config, &args) {
        tracing::error!("{}", e);
        process::exit(1);
    }
}

fn run(config: Config, args: &Args) -> Result<()> {
    let wait = Duration::from_secs(args.wait);
    let client = Client::new(config)?;
    let notifications = client.subscribe();
    client.start();

    wait_ready(&notifications, wait)?;

    let session = Session {
        client: &client,
        notifications: &notifications,
        wait,
    };

    match &args.command {
        Commands::Version => show(session.call(|cb| client.version(cb))?),
        Commands::Print => show(session.call(|cb| client.print(cb))?),
        Commands::Timeout { ms } => show(session.call(|cb| client.timeout(*ms, cb))?),
        Commands::Gettrig { device } => show(session.call(|cb| client.gettrig(device, cb))?),
        Commands::Settrig { device, trigger } => {
            show(session.call(|cb| client.settrig(device, trigger.as_deref(), cb))?)
        }
        Commands::Read {
            device,
            direction,
            channel,
            attribute,
        } => {
            let direction = match direction {
                Io::Input => Direction::Input,
                Io::Output => Direction::Output,
            };
            show(session.call(|cb| {
                client.read(device, direction, channel, attribute, cb)
            })?)
        }
        Commands::Open {
            device,
            samples,
            mask,
            cyclic,
        } => show(session.call(|cb| client.open(device, *samples, mask, *cyclic, cb))?),
        Commands::Readbuf {
            device,
            samples,
            mask,
            bytes,
        } => {
            expect_ok(session.call(|cb| client.open(device, *samples, mask, false, cb))?)?;
            show(session.call(|cb| client.readbuf(device, *bytes, cb))?)
        }
        Commands::Acquire {
            device,
            channel,
            attribute,
            timeout_ms,
            samples,
            mask,
            count,
        } => {
            show(session.call(|cb| client.version(cb))?);
            show(session.call(|cb| client.print(cb))?);
            expect_ok(session.call(|cb| client.timeout(*timeout_ms, cb))?)?;
            show(session.call(|cb| {
                client.read(device, Direction::Input, channel, attribute, cb)
            })?);
            expect_ok(session.call(|cb| client.open(device, *samples, mask, false, cb))?)?;

            let started = Instant::now();
            for _ in 0..*count {
                show(session.call(|cb| client.readbuf(device, *samples, cb))?);
            }
            tracing::info!("Read {} buffers in {:?}", count, started.elapsed());
        }
        Commands::Exit => {
            client.exit();
            return Ok(());
        }
    }

    client.end();
    Ok(())
}

/// Block until the connection is ready or has failed for good
fn wait_ready(
    notifications: &crossbeam::channel::Receiver<Notification>,
    wait: Duration,
) -> Result<()> {
    let deadline = Instant::now() + wait;
    loop {
        match notifications.recv_deadline(deadline) {
            Ok(Notification::Ready) => return Ok(()),
            Ok(Notification::Reconnecting { attempt, cause, .. }) => {
                tracing::warn!(
                    "Reconnecting (attempt {}): {}",
                    attempt,
                    cause.unwrap_or_default()
                );
            }
            Ok(Notification::Error(e)) if e.is_terminal() => {
                return Err(IiodError::ConnectionBroken {
                    cause: Some(e.to_string()),
                })
            }
            Ok(other) => tracing::debug!("Notification: {}", other.name()),
            Err(_) => {
                return Err(IiodError::Transport(format!(
                    "no connection within {:?}",
                    wait
                )))
            }
        }
    }
}

/// Blocking request/reply on top of the callback API
struct Session<'a> {
    client: &'a Client,
    notifications: &'a crossbeam::channel::Receiver<Notification>,
    wait: Duration,
}

impl Session<'_> {
    /// Submit through `submit` and block for the reply. A command cut off by
    /// a reconnect is resent once the new stream is ready.
    fn call<S>(&self, submit: S) -> Result<Reply>
    where
        S: FnOnce(Box<dyn FnOnce(Result<Reply>) + Send>) -> bool,
    {
        let (callback, receiver) = reply_channel();
        submit(Box::new(callback));

        let deadline = Instant::now() + self.wait;
        loop {
            if let Some(result) = receiver.wait_timeout(REPLY_POLL) {
                return result;
            }

            while let Ok(notification) = self.notifications.try_recv() {
                if matches!(notification, Notification::Ready) && self.client.has_interrupted() {
                    tracing::warn!("Resending command interrupted by reconnect");
                    self.client.resend();
                }
            }

            if Instant::now() >= deadline {
                return Err(IiodError::Transport(format!(
                    "no reply within {:?}",
                    self.wait
                )));
            }
        }
    }
}

fn expect_ok(reply: Reply) -> Result<()> {
    match reply {
        Reply::Status(code) if code < 0 => Err(IiodError::UnexpectedReply(format!(
            "daemon returned error code {}",
            code
        ))),
        _ => Ok(()),
    }
}

fn show(reply: Reply) {
    match reply {
        Reply::Version(version) => println!("{}.{}.{}", version.maj, version.min, version.tag),
        Reply::Status(code) => println!("{}", code),
        Reply::Text(text) => println!("{}", text),
        Reply::Binary(bytes) => {
            println!("{} bytes", bytes.len());
            for row in bytes.chunks(16) {
                let hex: Vec<String> = row.iter().map(|b| format!("{:02x}", b)).collect();
                println!("  {}", hex.join(" "));
            }
        }
        Reply::Written => {}
    }
}
