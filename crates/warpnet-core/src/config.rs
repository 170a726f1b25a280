use std::{default::Default, time::Duration};

use crate::constants::{
    DEFAULT_CHANNEL_LIMIT, DEFAULT_MAX_PEERS, DEFAULT_MAX_POLL_INTERVAL_MS, DEFAULT_POLL_INTERVAL_MS,
};

#[derive(Clone, Debug, PartialEq, Eq)]
/// Configuration options for a host session.
///
/// A session clones its config on construction and never mutates it afterwards.
pub struct SessionConfig {
    /// Address to bind (server) or connect to (client).
    pub address: String,
    /// Port to bind (server) or connect to (client).
    pub port: u16,
    /// Number of channels per peer connection.
    pub channel_limit: usize,
    /// Maximum number of simultaneous peers. Only used by servers; clients always use 1.
    pub max_peers: usize,
    /// Incoming bandwidth limit in bytes/sec (0 = unlimited).
    pub incoming_bandwidth: u32,
    /// Outgoing bandwidth limit in bytes/sec (0 = unlimited).
    pub outgoing_bandwidth: u32,
    /// Enable per-packet integrity checksums in the engine.
    pub checksum: bool,
    /// Enable payload compression in the engine.
    pub compression: bool,
    /// Enable the engine's alternate packet framing variant.
    pub new_packet_mode: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 0,
            channel_limit: DEFAULT_CHANNEL_LIMIT,
            max_peers: DEFAULT_MAX_PEERS,
            incoming_bandwidth: 0, // Unlimited
            outgoing_bandwidth: 0, // Unlimited
            checksum: false,
            compression: false,
            new_packet_mode: false,
        }
    }
}

impl SessionConfig {
    /// Config for a server bound to `address:port`.
    pub fn server(address: impl Into<String>, port: u16) -> Self {
        Self { address: address.into(), port, ..Self::default() }
    }

    /// Config for a client connecting to `address:port`.
    pub fn client(address: impl Into<String>, port: u16) -> Self {
        Self { address: address.into(), port, max_peers: 1, ..Self::default() }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Bounds of the adaptive poll interval.
pub struct PollerConfig {
    /// Interval used right after an event was produced.
    pub poll_interval: Duration,
    /// Upper bound of the idle backoff.
    pub max_poll_interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_poll_interval: Duration::from_millis(DEFAULT_MAX_POLL_INTERVAL_MS),
        }
    }
}

impl PollerConfig {
    /// Creates a poller config, swapping the bounds if they are given in the wrong order.
    pub fn new(poll_interval: Duration, max_poll_interval: Duration) -> Self {
        if poll_interval <= max_poll_interval {
            Self { poll_interval, max_poll_interval }
        } else {
            Self { poll_interval: max_poll_interval, max_poll_interval: poll_interval }
        }
    }
}
