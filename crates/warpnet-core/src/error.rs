use std::time::Duration;

/// Wrapped result type for session operations.
pub type Result<T> = std::result::Result<T, ErrorKind>;

/// Enum with all possible session errors.
///
/// Errors are `Clone` so the same value can be returned to the caller and
/// published to event subscribers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    /// The transport engine failed to initialize.
    #[error("failed to initialize the transport engine")]
    InitFailed,
    /// The transport engine rejected the host creation request.
    #[error("failed to create host: {0}")]
    HostCreateFailed(String),
    /// The server port is already bound by another socket.
    #[error("port {address}:{port} is already in use")]
    PortInUse {
        /// Address that was probed.
        address: String,
        /// Port that was probed.
        port: u16,
    },
    /// The peer handle does not refer to a registered peer.
    #[error("invalid peer handle")]
    InvalidPeerHandle,
    /// The engine refused to queue a packet.
    #[error("send failed with status {status}")]
    SendFailed {
        /// Status code returned by the engine.
        status: i32,
    },
    /// No connected peer to operate on.
    #[error("not connected")]
    NotConnected,
    /// The connect handshake did not complete in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    /// Only UTF-8 text encoding is supported.
    #[error("unsupported encoding: {0}")]
    UnsupportedEncoding(String),
    /// A write would run past the end of a fixed-capacity buffer.
    #[error("buffer overflow: {requested} bytes requested, {remaining} remaining")]
    BufferOverflow {
        /// Bytes the write needed.
        requested: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },
    /// The engine produced an event of an unknown type.
    #[error("unknown event type")]
    UnknownEventType,
    /// An operation needed a host but none was created yet.
    #[error("host not created")]
    HostNotCreated,
    /// The engine reported a fatal error while servicing the host.
    #[error("transport error: {0}")]
    Transport(String),
}
