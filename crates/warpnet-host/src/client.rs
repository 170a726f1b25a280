//! Client role: connect to a single server and talk to it.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use crossbeam_channel::{after, bounded, select};
use tracing::{debug, warn};
use warpnet_core::{
    config::{PollerConfig, SessionConfig},
    engine_state::EngineInitState,
    error::{ErrorKind, Result},
    transport::{HostOptions, PacketFlags, TransportEngine},
};

use crate::{
    event_bus::EventBus,
    event_types::{EventKind, SessionEvent},
    peer_registry::PeerHandle,
    poller::{AdaptivePoller, PollerControl, PollerHandle},
    session::{HostSession, Role},
};

/// A host session connected to one remote server.
///
/// Instance sends and disconnects target the server peer. Calling them before
/// `connect` or after the connection ended fails with `NotConnected`.
pub struct ClientSession<E: TransportEngine> {
    session: HostSession<E>,
    server_peer: Arc<Mutex<Option<PeerHandle>>>,
    poller_config: PollerConfig,
    control: PollerControl,
    background: Arc<Mutex<Option<PollerHandle>>>,
}

impl<E: TransportEngine> Clone for ClientSession<E> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            server_peer: self.server_peer.clone(),
            poller_config: self.poller_config,
            control: self.control.clone(),
            background: self.background.clone(),
        }
    }
}

impl<E: TransportEngine> fmt::Debug for ClientSession<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("session", &self.session)
            .field("server_peer", &self.server_peer())
            .field("polling", &self.control.is_running())
            .finish()
    }
}

impl<E: TransportEngine> ClientSession<E> {
    /// Creates a client for the server at `config.address:config.port`.
    pub fn new(engine: E, config: SessionConfig) -> Self {
        Self::with_init_state(engine, config, EngineInitState::global())
    }

    /// Creates a client counting engine initialization in `init_state`.
    pub fn with_init_state(engine: E, config: SessionConfig, init_state: &'static EngineInitState) -> Self {
        let session = HostSession::with_init_state(engine, config, Role::Client, init_state);
        let server_peer: Arc<Mutex<Option<PeerHandle>>> = Arc::new(Mutex::new(None));

        let tracked = server_peer.clone();
        session.events().on_disconnect(move |peer, _| {
            let mut current = tracked.lock().unwrap_or_else(PoisonError::into_inner);
            if *current == Some(peer) {
                *current = None;
            }
        });

        Self {
            session,
            server_peer,
            poller_config: PollerConfig::default(),
            control: PollerControl::new(),
            background: Arc::new(Mutex::new(None)),
        }
    }

    /// Replaces the bounds of the poll interval.
    pub fn with_poller_config(mut self, config: PollerConfig) -> Self {
        self.poller_config = config;
        self
    }

    /// Connects to the configured server.
    ///
    /// With a zero `timeout` the call runs the poll loop on the calling thread
    /// and returns only once the loop stops. Otherwise the loop runs in the
    /// background and the call waits up to `timeout` for the handshake; on
    /// expiry the pending peer is dropped, the loop is stopped and
    /// `ConnectTimeout` is returned. A handshake completing after that is ignored.
    ///
    /// Connecting again drops the previous server connection first.
    pub fn connect(&self, timeout: Duration) -> Result<()> {
        self.connect_with_data(timeout, 0)
    }

    /// Like [`connect`](Self::connect), passing `data` to the server with the request.
    pub fn connect_with_data(&self, timeout: Duration, data: u32) -> Result<()> {
        let config = self.session.config().clone();
        self.stop_background();

        // A capacity-1 host has no room for a second connection.
        let previous = self.server_peer_slot().take();
        if let Some(previous) = previous {
            debug!("Dropping previous server peer {} before reconnecting", previous);
            self.session.abandon(previous, 0);
        }

        if !self.session.has_host() {
            let options = HostOptions {
                peer_count: 1,
                channel_limit: config.channel_limit,
                incoming_bandwidth: config.incoming_bandwidth,
                outgoing_bandwidth: config.outgoing_bandwidth,
            };
            self.session.create_host(None, options)?;
        }

        let peer = self.session.connect_peer(&config.address, config.port, data)?;
        *self.server_peer_slot() = Some(peer);

        if timeout.is_zero() {
            return AdaptivePoller::with_control(self.poller_config, self.control.clone()).run(&self.session);
        }

        let (connected_tx, connected_rx) = bounded(1);
        let subscription = self.session.events().subscribe(EventKind::Connect, move |event| {
            if let SessionEvent::Connect { peer: connected } = event {
                if *connected == peer {
                    let _ = connected_tx.try_send(());
                }
            }
        });
        let already_connected = self.session.peer(peer).is_some_and(|record| record.connected);

        let poller = AdaptivePoller::with_control(self.poller_config, self.control.clone());
        match poller.spawn(self.session.clone()) {
            Ok(handle) => *self.background_slot() = Some(handle),
            Err(err) => {
                self.session.events().unsubscribe(subscription);
                return Err(self.session.report(err));
            }
        }

        let connected = if already_connected {
            true
        } else {
            select! {
                recv(connected_rx) -> _ => true,
                recv(after(timeout)) -> _ => false,
            }
        };
        self.session.events().unsubscribe(subscription);

        if connected {
            debug!("Connected to {}:{} as {}", config.address, config.port, peer);
            return Ok(());
        }

        warn!("Connect to {}:{} timed out after {:?}", config.address, config.port, timeout);
        self.control.stop();
        self.session.abandon(peer, 0);
        self.clear_server_peer(peer);
        Err(self.session.report(ErrorKind::ConnectTimeout(timeout)))
    }

    /// Sends `payload` to the server. Returns the engine status, or a negative
    /// value if not connected.
    pub fn send(&self, channel: u8, payload: &[u8], reliable: bool) -> i32 {
        match self.target() {
            Ok(peer) => self.session.send(peer, channel, payload, reliable),
            Err(_) => -1,
        }
    }

    /// Sends UTF-8 text to the server.
    pub fn send_str(&self, channel: u8, text: &str, reliable: bool) -> i32 {
        self.send(channel, text.as_bytes(), reliable)
    }

    /// Sends `bytes` to the server with caller-chosen flags.
    pub fn send_raw(&self, channel: u8, bytes: &[u8], flags: PacketFlags) -> i32 {
        match self.target() {
            Ok(peer) => self.session.send_raw(peer, channel, bytes, flags),
            Err(_) => -1,
        }
    }

    /// Gracefully disconnects from the server.
    pub fn disconnect(&self, data: u32) -> Result<()> {
        let peer = self.target()?;
        let result = self.session.disconnect(peer, data);
        self.clear_server_peer(peer);
        result
    }

    /// Drops the server connection immediately.
    pub fn disconnect_now(&self, data: u32) -> Result<()> {
        let peer = self.target()?;
        let result = self.session.disconnect_now(peer, data);
        self.clear_server_peer(peer);
        result
    }

    /// Disconnects once queued packets are sent.
    pub fn disconnect_later(&self, data: u32) -> Result<()> {
        let peer = self.target()?;
        let result = self.session.disconnect_later(peer, data);
        self.clear_server_peer(peer);
        result
    }

    /// Handle of the server peer, if a connection was started and not ended.
    pub fn server_peer(&self) -> Option<PeerHandle> {
        *self.server_peer_slot()
    }

    /// Returns true once the handshake with the server completed.
    pub fn is_connected(&self) -> bool {
        self.server_peer()
            .and_then(|peer| self.session.peer(peer))
            .is_some_and(|record| record.connected)
    }

    /// Asks the poll loop to exit after its current iteration.
    pub fn stop(&self) {
        self.control.stop();
    }

    /// Waits for the background poll loop to exit.
    pub fn wait(&self) -> Result<()> {
        let handle = self.background_slot().take();
        match handle {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }

    /// Control of the poll loop, usable from subscribers and other threads.
    pub fn poller_control(&self) -> PollerControl {
        self.control.clone()
    }

    /// Underlying host session.
    pub fn session(&self) -> &HostSession<E> {
        &self.session
    }

    /// Event bus of the session.
    pub fn events(&self) -> &EventBus {
        self.session.events()
    }

    fn target(&self) -> Result<PeerHandle> {
        self.server_peer().ok_or_else(|| {
            warn!("Client is not connected");
            self.session.report(ErrorKind::NotConnected)
        })
    }

    fn clear_server_peer(&self, peer: PeerHandle) {
        let mut current = self.server_peer_slot();
        if *current == Some(peer) {
            *current = None;
        }
    }

    fn stop_background(&self) {
        let handle = self.background_slot().take();
        if let Some(handle) = handle {
            handle.stop();
            let _ = handle.join();
        }
    }

    fn server_peer_slot(&self) -> MutexGuard<'_, Option<PeerHandle>> {
        self.server_peer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn background_slot(&self) -> MutexGuard<'_, Option<PollerHandle>> {
        self.background.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
