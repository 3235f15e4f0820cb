//! TCP transport
//!
//! One thread per stream: it connects, then reads until the socket closes,
//! forwarding everything as [`TransportEvent`]s. Writes happen on the
//! caller's thread through a cloned handle.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::config::Config;
use super::transport::{Connector, EventSink, Stream, TransportEvent};

/// Read chunk size (64 KB)
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Opens plain TCP streams
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for TcpConnector {
    fn connect(&mut self, addr: SocketAddr, config: &Config, events: EventSink) -> Box<dyn Stream> {
        let shared = Arc::new(Shared::default());
        let thread_shared = Arc::clone(&shared);
        let config = config.clone();
        let failure_events = events.clone();

        let spawned = thread::Builder::new()
            .name(format!("iiod-stream-{}", events.epoch()))
            .spawn(move || run_stream(addr, config, thread_shared, events));

        if let Err(e) = spawned {
            tracing::error!("Failed to spawn stream thread: {}", e);
            failure_events.send(TransportEvent::Error(e));
            failure_events.send(TransportEvent::Close);
        }

        Box::new(TcpTransportStream { shared })
    }
}

#[derive(Default)]
struct Shared {
    /// Write handle, present while connected
    writer: Mutex<Option<TcpStream>>,

    /// Write side already shut down
    write_closed: AtomicBool,

    /// Stream torn down by its owner
    destroyed: AtomicBool,
}

/// Owner-side handle of a TCP stream
struct TcpTransportStream {
    shared: Arc<Shared>,
}

impl Stream for TcpTransportStream {
    fn is_writable(&self) -> bool {
        !self.shared.write_closed.load(Ordering::Acquire) && self.shared.writer.lock().is_some()
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.shared.write_closed.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after stream shutdown",
            ));
        }

        let mut writer = self.shared.writer.lock();
        match writer.as_mut() {
            Some(stream) => {
                stream.write_all(bytes)?;
                stream.flush()
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "stream is not connected",
            )),
        }
    }

    fn shutdown(&mut self) {
        if self.shared.write_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(stream) = self.shared.writer.lock().as_ref() {
            if let Err(e) = stream.shutdown(Shutdown::Write) {
                tracing::debug!("Graceful shutdown failed: {}", e);
            }
        }
    }

    fn destroy(&mut self) {
        self.shared.destroyed.store(true, Ordering::Release);
        self.shared.write_closed.store(true, Ordering::Release);
        if let Some(stream) = self.shared.writer.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for TcpTransportStream {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Body of the per-stream thread
fn run_stream(addr: SocketAddr, config: Config, shared: Arc<Shared>, events: EventSink) {
    let mut stream = match TcpStream::connect_timeout(&addr, config.connect_timeout()) {
        Ok(stream) => stream,
        Err(e) => {
            if !shared.destroyed.load(Ordering::Acquire) {
                events.send(TransportEvent::Error(e));
                events.send(TransportEvent::Close);
            }
            return;
        }
    };

    if let Err(e) = configure_socket(&stream, &config) {
        tracing::warn!("Failed to configure socket for {}: {}", addr, e);
    }

    let writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(e) => {
            events.send(TransportEvent::Error(e));
            events.send(TransportEvent::Close);
            return;
        }
    };

    {
        let mut slot = shared.writer.lock();
        if shared.destroyed.load(Ordering::Acquire) {
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
        *slot = Some(writer);
    }

    if !events.send(TransportEvent::Connected) {
        return;
    }

    let mut buffer = BytesMut::with_capacity(READ_CHUNK_SIZE);
    loop {
        buffer.resize(READ_CHUNK_SIZE, 0);
        match stream.read(&mut buffer[..]) {
            Ok(0) => {
                events.send(TransportEvent::End);
                events.send(TransportEvent::Close);
                break;
            }
            Ok(n) => {
                let chunk = buffer.split_to(n).freeze();
                tracing::trace!("Read {} bytes from {}", n, addr);
                if !events.send(TransportEvent::Data(chunk)) {
                    break;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if !shared.destroyed.load(Ordering::Acquire) {
                    events.send(TransportEvent::Error(e));
                    events.send(TransportEvent::Close);
                }
                break;
            }
        }
    }

    shared.writer.lock().take();
}

fn configure_socket(stream: &TcpStream, config: &Config) -> io::Result<()> {
    // Disable Nagle's algorithm for low latency
    stream.set_nodelay(config.no_delay)?;
    set_keepalive(
        stream,
        config.socket_keepalive,
        Duration::from_millis(config.socket_initial_delay_ms),
    )
}

#[cfg(unix)]
fn set_keepalive(stream: &TcpStream, enabled: bool, initial_delay: Duration) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, enabled as libc::c_int)?;

    if enabled && !initial_delay.is_zero() {
        set_keepalive_idle(fd, initial_delay)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_keepalive(_stream: &TcpStream, enabled: bool, _initial_delay: Duration) -> io::Result<()> {
    if enabled {
        tracing::debug!("TCP keepalive is not configurable on this platform");
    }
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_keepalive_idle(fd: std::os::unix::io::RawFd, delay: Duration) -> io::Result<()> {
    let secs = delay.as_secs().clamp(1, libc::c_int::MAX as u64) as libc::c_int;
    setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, secs)
}

#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
fn set_keepalive_idle(_fd: std::os::unix::io::RawFd, _delay: Duration) -> io::Result<()> {
    tracing::debug!("Keepalive idle time is not configurable on this platform");
    Ok(())
}

#[cfg(unix)]
fn setsockopt_int(
    fd: std::os::unix::io::RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    // SAFETY: `fd` is a live socket owned by the caller and `value` outlives the call.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
