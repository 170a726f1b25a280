#![warn(missing_docs)]

//! Warpnet: a small public API facade for the workspace.
//!
//! This crate re-exports the types needed to run reliable/unreliable datagram
//! sessions over a transport engine:
//!
//! - Sessions (`ServerSession`, `ClientSession`, `HostSession`)
//! - Events and subscriptions (`Event`, `SessionEvent`, `EventBus`, `EventKind`)
//! - Configuration and errors (`SessionConfig`, `PollerConfig`, `ErrorKind`)
//! - Payload construction (`PacketBuilder`)
//!
//! Example
//! ```no_run
//! use std::time::Duration;
//! use warpnet::prelude::*;
//!
//! let network = LoopbackNetwork::new();
//! let server = ServerSession::create(
//!     LoopbackEngine::new(&network),
//!     SessionConfig::server("127.0.0.1", 7777),
//! )
//! .unwrap();
//! server.events().on_receive(|peer, channel, payload| {
//!     println!("{} sent {} bytes on channel {}", peer, payload.len(), channel);
//! });
//! let serving = server.serve_in_background().unwrap();
//!
//! let client = ClientSession::new(LoopbackEngine::new(&network), SessionConfig::client("127.0.0.1", 7777));
//! client.connect(Duration::from_secs(1)).unwrap();
//!
//! let mut builder = PacketBuilder::new(16);
//! builder.write_u8(1).unwrap().write_u32(0xDEADBEEF, Endianness::Little).unwrap();
//! client.send(0, builder.packet_data(), true);
//!
//! server.stop();
//! serving.join().unwrap();
//! ```

// Core configuration, errors and the engine contract
pub use warpnet_core::{
    config::{PollerConfig, SessionConfig},
    engine_state::EngineInitState,
    error::{ErrorKind, Result},
    transport::{
        BindAddress, EngineEvent, EnginePeerId, EventSource, HostOptions, PacketFlags, TransportEngine,
    },
};
// Sessions, events and polling
pub use warpnet_host::{
    AdaptivePoller, BroadcastReport, ClientSession, DisconnectMode, Event, EventBus, EventKind,
    HostSession, LoopbackEngine, LoopbackNetwork, PeerHandle, PeerRecord, PollTarget, PollerControl,
    PollerHandle, PortProbe, Role, ServerSession, SessionEvent, SubscriptionId, UdpPortProbe,
    WeakHostSession,
};
// Payload construction
pub use warpnet_utilities::{Endianness, PacketBuilder};

/// Convenience prelude with the most commonly used items.
pub mod prelude {
    pub use crate::{
        ClientSession, Endianness, ErrorKind, Event, EventKind, LoopbackEngine, LoopbackNetwork,
        PacketBuilder, PacketFlags, PeerHandle, PollerConfig, ServerSession, SessionConfig,
        SessionEvent,
    };
}
