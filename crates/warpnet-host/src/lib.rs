#![warn(missing_docs)]

//! warpnet-host: host sessions, peer registry, event bus and polling over a transport engine.

/// Client role session.
pub mod client;
/// Publish/subscribe registry for session events.
pub mod event_bus;
/// Event types (Event, SessionEvent, EventKind).
pub mod event_types;
/// In-process transport engine.
pub mod loopback;
/// Peer handles and the per-session peer registry.
pub mod peer_registry;
/// Adaptive polling loop.
pub mod poller;
/// Port availability probing.
pub mod port_probe;
/// Server role session.
pub mod server;
/// Shared host session.
pub mod session;

#[cfg(test)]
mod testing;

pub use client::ClientSession;
pub use event_bus::{EventBus, SubscriptionId};
pub use event_types::{Event, EventKind, SessionEvent};
pub use loopback::{LoopbackEngine, LoopbackNetwork};
pub use peer_registry::{PeerHandle, PeerRecord, PeerRegistry};
pub use poller::{AdaptivePoller, PollTarget, PollerControl, PollerHandle};
pub use port_probe::{PortProbe, UdpPortProbe};
pub use server::{BroadcastReport, ServerSession};
pub use session::{DisconnectMode, HostSession, Role, WeakHostSession};
