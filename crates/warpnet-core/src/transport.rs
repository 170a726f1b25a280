//! Transport engine abstraction for pluggable reliable UDP implementations.

use std::{fmt, net::SocketAddr, ops, sync::Arc, time::Duration};

use crate::error::Result;

/// Engine-side identifier of one peer.
///
/// Chosen by the engine and only meaningful to it; sessions never expose it
/// and translate it to a generation-checked handle instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EnginePeerId(pub u64);

/// Bit set of per-packet flags understood by the engine.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PacketFlags(u32);

impl PacketFlags {
    /// No flags: unreliable, sequenced delivery.
    pub const NONE: PacketFlags = PacketFlags(0);
    /// Packet must be received by the target peer and resent until delivered.
    pub const RELIABLE: PacketFlags = PacketFlags(1 << 0);
    /// Packet will not be sequenced with other packets.
    pub const UNSEQUENCED: PacketFlags = PacketFlags(1 << 1);
    /// Packet data is not copied by the engine; always stripped before reaching it.
    pub const NO_ALLOCATE: PacketFlags = PacketFlags(1 << 2);
    /// Packet is fragmented using unreliable sends if it exceeds the MTU.
    pub const UNRELIABLE_FRAGMENT: PacketFlags = PacketFlags(1 << 3);
    /// Engine must take its own copy of the payload.
    pub const FORCE_COPY: PacketFlags = PacketFlags(1 << 4);
    /// Set by the engine once the packet has been sent.
    pub const SENT: PacketFlags = PacketFlags(1 << 8);

    /// Creates flags from raw bits.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Returns the raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if all bits of `other` are set.
    pub const fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns a copy with the bits of `other` cleared.
    pub const fn without(self, other: PacketFlags) -> Self {
        Self(self.0 & !other.0)
    }

    /// Flags for a reliable or unreliable send.
    pub const fn for_delivery(reliable: bool) -> Self {
        if reliable {
            Self::RELIABLE
        } else {
            Self::NONE
        }
    }
}

impl ops::BitOr for PacketFlags {
    type Output = PacketFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        PacketFlags(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for PacketFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for PacketFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketFlags({:#06x})", self.0)
    }
}

/// Address a server host binds to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindAddress {
    /// IP address string.
    pub address: String,
    /// UDP port.
    pub port: u16,
}

/// Capacity and bandwidth options for host creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostOptions {
    /// Maximum number of peers.
    pub peer_count: usize,
    /// Channels per peer.
    pub channel_limit: usize,
    /// Incoming bandwidth in bytes/sec (0 = unlimited).
    pub incoming_bandwidth: u32,
    /// Outgoing bandwidth in bytes/sec (0 = unlimited).
    pub outgoing_bandwidth: u32,
}

/// One event produced by servicing the engine host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    /// A peer completed its handshake.
    Connect {
        /// Engine peer.
        peer: EnginePeerId,
        /// Remote address, if known.
        address: Option<SocketAddr>,
    },
    /// A peer disconnected or timed out.
    Disconnect {
        /// Engine peer.
        peer: EnginePeerId,
        /// User data sent with the disconnect.
        data: u32,
    },
    /// A packet arrived.
    Receive {
        /// Engine peer.
        peer: EnginePeerId,
        /// Channel the packet arrived on.
        channel: u8,
        /// Packet payload.
        payload: Vec<u8>,
    },
    /// The engine returned an event type this layer does not know.
    Unknown,
}

impl EngineEvent {
    /// Engine peer the event is about.
    pub fn peer(&self) -> Option<EnginePeerId> {
        match self {
            EngineEvent::Connect { peer, .. }
            | EngineEvent::Disconnect { peer, .. }
            | EngineEvent::Receive { peer, .. } => Some(*peer),
            EngineEvent::Unknown => None,
        }
    }
}

/// Event queue of a host that can be waited on without exclusive access to the engine.
///
/// Sessions block on it with their lock released, so sends and disconnects
/// from other threads are not held up by an idle poll.
pub trait EventSource: Send + Sync {
    /// Waits up to `timeout` for the next event of the host.
    fn wait_event(&self, timeout: Duration) -> Result<Option<EngineEvent>>;
}

/// Host and peer primitives of a reliable UDP engine.
///
/// One value owns at most one engine host. `init`/`deinit` are process-wide
/// and are only ever called through [`EngineInitState`](crate::engine_state::EngineInitState).
pub trait TransportEngine: Send + 'static {
    /// Performs the process-wide library initialization.
    fn init(&mut self) -> bool;

    /// Performs the process-wide library teardown.
    fn deinit(&mut self);

    /// Creates the host. `bind` is `None` for client hosts.
    fn create_host(&mut self, bind: Option<&BindAddress>, options: HostOptions) -> Result<()>;

    /// Destroys the host, dropping all peers without notifying them.
    fn destroy_host(&mut self);

    /// Waits up to `timeout` for one event.
    fn host_service(&mut self, timeout: Duration) -> Result<Option<EngineEvent>>;

    /// Shared handle to the current host's event queue, if the engine has one.
    ///
    /// Engines returning `None` are waited on through `host_service`.
    fn event_source(&self) -> Option<Arc<dyn EventSource>> {
        None
    }

    /// Sends all queued packets.
    fn flush(&mut self);

    /// Starts a connection; the handshake completes with a later Connect event.
    fn connect(
        &mut self,
        address: &str,
        port: u16,
        channel_limit: usize,
        data: u32,
    ) -> Result<EnginePeerId>;

    /// Requests a disconnect acknowledged by the peer.
    fn peer_disconnect(&mut self, peer: EnginePeerId, data: u32);

    /// Drops the peer without waiting for acknowledgment.
    fn peer_disconnect_now(&mut self, peer: EnginePeerId, data: u32);

    /// Disconnects once all queued outgoing packets are sent.
    fn peer_disconnect_later(&mut self, peer: EnginePeerId, data: u32);

    /// Queues a packet; a negative status means rejected.
    fn peer_send(&mut self, peer: EnginePeerId, channel: u8, payload: &[u8], flags: PacketFlags)
        -> i32;

    /// Toggles payload compression.
    fn set_compression(&mut self, enabled: bool);

    /// Toggles per-packet checksums.
    fn set_checksum(&mut self, enabled: bool);

    /// Toggles the alternate packet framing variant.
    fn set_new_packet_mode(&mut self, enabled: bool, is_server: bool);
}
