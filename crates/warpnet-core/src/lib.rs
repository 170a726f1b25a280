#![warn(missing_docs)]

//! warpnet-core: foundational types shared by every layer.
//!
//! This crate provides:
//! - Session and poller configuration
//! - Error handling
//! - The transport engine contract the session layer drives
//! - The process-wide engine initialization counter

/// Defaults shared across layers.
pub mod constants {
    /// Peer capacity of a server host unless configured otherwise.
    pub const DEFAULT_MAX_PEERS: usize = 32;
    /// Channels per connection unless configured otherwise.
    pub const DEFAULT_CHANNEL_LIMIT: usize = 2;
    /// Base poll interval in milliseconds.
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2;
    /// Upper bound of the idle poll backoff in milliseconds.
    pub const DEFAULT_MAX_POLL_INTERVAL_MS: u64 = 32;
    /// Capacity of a packet builder unless the caller picks one.
    pub const DEFAULT_PACKET_CAPACITY: usize = 1024;
}

/// Configuration options for sessions and polling.
pub mod config;
/// Process-wide engine init/teardown reference count.
pub mod engine_state;
/// Error types and results.
pub mod error;
/// Transport engine abstraction.
pub mod transport;
