//! # iiod-client
//!
//! Client for the IIO daemon (IIOD) line protocol with:
//! - Incremental reply decoding over arbitrarily fragmented reads
//! - Text and length-prefixed binary reply framing
//! - A single in-flight command per connection, resolved exactly once
//! - Reconnect with fixed-delay retry
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Client Facade                          │
//! │      version / print / timeout / read / open / readbuf      │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ Command
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                  Connection Manager                         │
//! │        (state machine, in-flight slot, retry timer)         │
//! └──────────┬───────────────────────────────────┬──────────────┘
//!            │                                   │
//!            ▼                                   ▼
//!   ┌─────────────────┐                 ┌─────────────────┐
//!   │ Protocol Codec  │                 │  Retry Policy   │
//!   │ (encode/decode) │                 │  (give up/go)   │
//!   └─────────────────┘                 └─────────────────┘
//!            ▲
//!            │ bytes
//!   ┌────────┴────────┐
//!   │  TCP Transport  │
//!   └─────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod protocol;
pub mod retry;
pub mod network;
pub mod client;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{IiodError, Result};
pub use config::{AddressFamily, Config};
pub use client::{reply_channel, Client, ReplyReceiver};
pub use network::{ConnectionState, Notification};
pub use protocol::{Direction, Reply, Version};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
