//! Event types for the session layer.
//!
//! - `Event`: what one `service()` call produced, returned to the caller
//! - `SessionEvent`: everything published on the event bus (events, readiness, errors)
//! - `EventKind`: the closed set of subscriber lists

use std::sync::Arc;

use warpnet_core::error::ErrorKind;

use crate::peer_registry::PeerHandle;

/// Result of servicing the host once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A peer completed its handshake.
    Connect {
        /// The connected peer.
        peer: PeerHandle,
    },
    /// A peer disconnected; its registry entry is already gone.
    Disconnect {
        /// The disconnected peer.
        peer: PeerHandle,
        /// User data sent with the disconnect.
        code: u32,
    },
    /// A packet arrived.
    Receive {
        /// Sender.
        peer: PeerHandle,
        /// Channel the packet arrived on.
        channel: u8,
        /// Packet payload, shared with subscribers.
        payload: Arc<[u8]>,
    },
    /// The engine produced an event type this layer does not know.
    Unknown,
}

impl Event {
    /// Peer the event refers to, if any.
    pub fn peer(&self) -> Option<PeerHandle> {
        match self {
            Event::Connect { peer } | Event::Disconnect { peer, .. } | Event::Receive { peer, .. } => {
                Some(*peer)
            }
            Event::Unknown => None,
        }
    }

    /// The bus publication for this event. `Unknown` is published as an error.
    pub fn to_session_event(&self) -> SessionEvent {
        match self {
            Event::Connect { peer } => SessionEvent::Connect { peer: *peer },
            Event::Disconnect { peer, code } => SessionEvent::Disconnect { peer: *peer, code: *code },
            Event::Receive { peer, channel, payload } => {
                SessionEvent::Receive { peer: *peer, channel: *channel, payload: payload.clone() }
            }
            Event::Unknown => SessionEvent::Error(ErrorKind::UnknownEventType),
        }
    }
}

/// Publication on the event bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// The server host is bound and its serving loop is about to start.
    Ready,
    /// A peer completed its handshake.
    Connect {
        /// The connected peer.
        peer: PeerHandle,
    },
    /// A peer disconnected.
    Disconnect {
        /// The disconnected peer.
        peer: PeerHandle,
        /// User data sent with the disconnect.
        code: u32,
    },
    /// A packet arrived.
    Receive {
        /// Sender.
        peer: PeerHandle,
        /// Channel the packet arrived on.
        channel: u8,
        /// Packet payload.
        payload: Arc<[u8]>,
    },
    /// A failure that was also reported to the caller.
    Error(ErrorKind),
}

impl SessionEvent {
    /// Subscriber list this publication goes to.
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::Ready => EventKind::Ready,
            SessionEvent::Connect { .. } => EventKind::Connect,
            SessionEvent::Disconnect { .. } => EventKind::Disconnect,
            SessionEvent::Receive { .. } => EventKind::Receive,
            SessionEvent::Error(_) => EventKind::Error,
        }
    }
}

/// Closed set of event kinds, one subscriber list each.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Server readiness.
    Ready,
    /// Peer connected.
    Connect,
    /// Peer disconnected.
    Disconnect,
    /// Packet received.
    Receive,
    /// Error reported.
    Error,
}

impl EventKind {
    /// Number of kinds.
    pub const COUNT: usize = 5;

    /// All kinds, in list order.
    pub const ALL: [EventKind; EventKind::COUNT] = [
        EventKind::Ready,
        EventKind::Connect,
        EventKind::Disconnect,
        EventKind::Receive,
        EventKind::Error,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            EventKind::Ready => 0,
            EventKind::Connect => 1,
            EventKind::Disconnect => 2,
            EventKind::Receive => 3,
            EventKind::Error => 4,
        }
    }
}
