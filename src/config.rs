//! Configuration for the IIOD client
//!
//! Centralized configuration with sensible defaults.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use crate::error::{IiodError, Result};
use crate::retry::RetryPolicy;

/// Default TCP port the IIO daemon listens on
pub const DEFAULT_PORT: u16 = 30431;

/// Main configuration for a client connection
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Address Configuration
    // -------------------------------------------------------------------------
    /// Daemon host name or IP literal
    pub host: String,

    /// Daemon TCP port
    pub port: u16,

    /// Address family used when resolving `host`
    pub family: AddressFamily,

    // -------------------------------------------------------------------------
    // Retry Configuration
    // -------------------------------------------------------------------------
    /// Reconnect after the stream is lost
    pub retry_on: bool,

    /// Reconnect attempts before the connection is declared broken
    pub retry_attempts: u32,

    /// Fixed delay between reconnect attempts (milliseconds)
    pub retry_delay_ms: u64,

    // -------------------------------------------------------------------------
    // Socket Configuration
    // -------------------------------------------------------------------------
    /// Enable TCP keepalive on the socket
    pub socket_keepalive: bool,

    /// Idle time before the first keepalive probe (milliseconds, 0 = OS default)
    pub socket_initial_delay_ms: u64,

    /// Connect timeout (milliseconds)
    pub connect_timeout_ms: u64,

    /// Disable Nagle's algorithm
    pub no_delay: bool,
}

/// Address family selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamily {
    /// Use whatever the resolver returns first
    #[default]
    Auto,
    V4,
    V6,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            family: AddressFamily::Auto,
            retry_on: true,
            retry_attempts: 10,
            retry_delay_ms: 200,
            socket_keepalive: true,
            socket_initial_delay_ms: 0,
            connect_timeout_ms: 1000,
            no_delay: true,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// `host:port` as given, for logging
    pub fn address_label(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Resolve host/port to a socket address of the configured family
    pub fn resolve(&self) -> Result<SocketAddr> {
        let candidates = (self.host.as_str(), self.port).to_socket_addrs()?;

        let mut chosen = None;
        for addr in candidates {
            let matches = match self.family {
                AddressFamily::Auto => true,
                AddressFamily::V4 => addr.is_ipv4(),
                AddressFamily::V6 => addr.is_ipv6(),
            };
            if matches {
                chosen = Some(addr);
                break;
            }
        }

        chosen.ok_or_else(|| {
            IiodError::Config(format!(
                "no {:?} address found for {}",
                self.family,
                self.address_label()
            ))
        })
    }

    /// Retry policy derived from the retry settings
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_on,
            self.retry_attempts,
            Duration::from_millis(self.retry_delay_ms),
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the daemon host
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set the daemon port
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Force an address family
    pub fn family(mut self, family: AddressFamily) -> Self {
        self.config.family = family;
        self
    }

    /// Enable or disable reconnecting
    pub fn retry_on(mut self, enabled: bool) -> Self {
        self.config.retry_on = enabled;
        self
    }

    /// Set the maximum number of reconnect attempts
    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.config.retry_attempts = attempts;
        self
    }

    /// Set the delay between reconnect attempts (in milliseconds)
    pub fn retry_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry_delay_ms = ms;
        self
    }

    /// Enable or disable TCP keepalive
    pub fn socket_keepalive(mut self, enabled: bool) -> Self {
        self.config.socket_keepalive = enabled;
        self
    }

    /// Set the keepalive initial delay (in milliseconds)
    pub fn socket_initial_delay_ms(mut self, ms: u64) -> Self {
        self.config.socket_initial_delay_ms = ms;
        self
    }

    /// Set the connect timeout (in milliseconds)
    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.config.connect_timeout_ms = ms;
        self
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.config.no_delay = enabled;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
