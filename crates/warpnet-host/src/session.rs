//! Shared host session: lifecycle, servicing, sends and disconnects.

use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use tracing::{debug, trace, warn};
use warpnet_core::{
    config::SessionConfig,
    engine_state::EngineInitState,
    error::{ErrorKind, Result},
    transport::{
        BindAddress, EngineEvent, EnginePeerId, EventSource, HostOptions, PacketFlags, TransportEngine,
    },
};
use warpnet_utilities::format_ip;

use crate::{
    event_bus::EventBus,
    event_types::{Event, SessionEvent},
    peer_registry::{PeerHandle, PeerRecord, PeerRegistry},
};

/// Which side of a connection a session plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Binds an address and accepts peers.
    Server,
    /// Connects to a single remote address.
    Client,
}

/// How a peer connection is torn down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectMode {
    /// Wait for the peer to acknowledge.
    Graceful,
    /// Drop the peer without waiting.
    Immediate,
    /// Send everything already queued, then disconnect.
    Deferred,
}

struct SessionCore<E: TransportEngine> {
    engine: E,
    config: Arc<SessionConfig>,
    role: Role,
    init_state: &'static EngineInitState,
    initialized: bool,
    host_created: bool,
    registry: PeerRegistry,
    events: Option<Arc<dyn EventSource>>,
    // Engine peers given up on; whatever the engine still reports for them is ignored.
    abandoned: HashSet<EnginePeerId>,
    stale_events: u64,
}

impl<E: TransportEngine> SessionCore<E> {
    fn destroy_host(&mut self) {
        if self.host_created {
            self.engine.destroy_host();
            self.host_created = false;
            debug!("{:?} host destroyed", self.role);
        }
        self.events = None;
        self.abandoned.clear();
        self.registry.clear();
    }

    fn translate(&mut self, event: EngineEvent) -> Option<Event> {
        if let Some(peer) = event.peer().filter(|peer| self.abandoned.contains(peer)) {
            if matches!(event, EngineEvent::Disconnect { .. }) {
                self.abandoned.remove(&peer);
            }
            return self.drop_stale("late", peer);
        }
        match event {
            EngineEvent::Connect { peer, address } => {
                let handle = match self.registry.lookup(peer) {
                    Some(handle) => {
                        let _ = self.registry.set_connected(handle);
                        handle
                    }
                    None => self.registry.insert(
                        peer,
                        PeerRecord {
                            connected: true,
                            address: address.as_ref().map(format_ip),
                            port: address.map(|addr| addr.port()),
                        },
                    ),
                };
                debug!("{} connected", handle);
                Some(Event::Connect { peer: handle })
            }
            EngineEvent::Disconnect { peer, data } => match self.registry.lookup(peer) {
                Some(handle) => {
                    let _ = self.registry.remove(handle);
                    debug!("{} disconnected with code {}", handle, data);
                    Some(Event::Disconnect { peer: handle, code: data })
                }
                None => self.drop_stale("disconnect", peer),
            },
            EngineEvent::Receive { peer, channel, payload } => match self.registry.lookup(peer) {
                Some(handle) => {
                    trace!("{} bytes from {} on channel {}", payload.len(), handle, channel);
                    Some(Event::Receive { peer: handle, channel, payload: payload.into() })
                }
                None => self.drop_stale("receive", peer),
            },
            EngineEvent::Unknown => Some(Event::Unknown),
        }
    }

    fn drop_stale(&mut self, what: &str, peer: EnginePeerId) -> Option<Event> {
        self.stale_events += 1;
        debug!("Dropping {} event for removed engine peer {:?}", what, peer);
        None
    }
}

impl<E: TransportEngine> Drop for SessionCore<E> {
    fn drop(&mut self) {
        self.destroy_host();
        if self.initialized {
            self.initialized = false;
            self.init_state.release(&mut self.engine);
        }
    }
}

/// One engine host together with its peer registry and event bus.
///
/// Cloning yields another handle to the same session, which is how a
/// background poller and application code share it. The engine is only ever
/// driven by one call at a time; subscribers run after the session lock is
/// released so they can call back into the session. Such subscribers should
/// hold a [`WeakHostSession`] rather than a clone, since the bus keeps its
/// callbacks alive.
///
/// The host is destroyed and the engine slot released when the last clone drops.
pub struct HostSession<E: TransportEngine> {
    core: Arc<Mutex<SessionCore<E>>>,
    bus: Arc<EventBus>,
    config: Arc<SessionConfig>,
    role: Role,
}

impl<E: TransportEngine> Clone for HostSession<E> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            bus: self.bus.clone(),
            config: self.config.clone(),
            role: self.role,
        }
    }
}

impl<E: TransportEngine> fmt::Debug for HostSession<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostSession")
            .field("role", &self.role)
            .field("config", &self.config)
            .field("bus", &self.bus)
            .finish()
    }
}

impl<E: TransportEngine> HostSession<E> {
    /// Creates a session using the process-wide engine init counter.
    pub fn new(engine: E, config: SessionConfig, role: Role) -> Self {
        Self::with_init_state(engine, config, role, EngineInitState::global())
    }

    /// Creates a session that counts engine initialization in `init_state`.
    pub fn with_init_state(
        engine: E,
        config: SessionConfig,
        role: Role,
        init_state: &'static EngineInitState,
    ) -> Self {
        let config = Arc::new(config);
        let core = SessionCore {
            engine,
            config: config.clone(),
            role,
            init_state,
            initialized: false,
            host_created: false,
            registry: PeerRegistry::new(),
            events: None,
            abandoned: HashSet::new(),
            stale_events: 0,
        };
        Self { core: Arc::new(Mutex::new(core)), bus: Arc::new(EventBus::new()), config, role }
    }

    /// Takes a slot in the engine init counter. Calling it again is a no-op.
    pub fn initialize(&self) -> Result<()> {
        let result = {
            let mut core = self.lock();
            if core.initialized {
                return Ok(());
            }
            let init_state = core.init_state;
            let result = init_state.acquire(&mut core.engine);
            core.initialized = result.is_ok();
            result
        };
        result.map_err(|err| self.report(err))
    }

    /// Creates the engine host, replacing any existing one, then applies the
    /// checksum/compression/packet-mode toggles from the config.
    ///
    /// Initializes the session first if needed.
    pub fn create_host(&self, bind: Option<BindAddress>, options: HostOptions) -> Result<()> {
        self.initialize()?;
        let result = {
            let mut core = self.lock();
            core.destroy_host();
            match core.engine.create_host(bind.as_ref(), options) {
                Ok(()) => {
                    let config = core.config.clone();
                    let is_server = core.role == Role::Server;
                    core.engine.set_checksum(config.checksum);
                    core.engine.set_compression(config.compression);
                    core.engine.set_new_packet_mode(config.new_packet_mode, is_server);
                    core.host_created = true;
                    core.events = core.engine.event_source();
                    debug!("{:?} host created ({:?}, {:?})", core.role, bind, options);
                    Ok(())
                }
                Err(ErrorKind::HostCreateFailed(reason)) => Err(ErrorKind::HostCreateFailed(reason)),
                Err(other) => Err(ErrorKind::HostCreateFailed(other.to_string())),
            }
        };
        result.map_err(|err| self.report(err))
    }

    /// Polls the engine once, waiting up to `timeout` for an event.
    ///
    /// Returns `Ok(None)` before a host exists, on timeout, and for events that
    /// refer to peers this session already removed. Events are applied to the
    /// registry, published on the bus and returned. `Err` is a fatal engine
    /// error; it is published as well.
    ///
    /// When the engine exposes an [`EventSource`] the wait happens with the
    /// session lock released, so other threads can keep sending meanwhile.
    pub fn service(&self, timeout: Duration) -> Result<Option<Event>> {
        match self.poll_engine(timeout) {
            Ok(Some(event)) => {
                self.bus.publish(&event.to_session_event());
                Ok(Some(event))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                warn!("Host service failed: {}", err);
                Err(self.report(err))
            }
        }
    }

    /// Sends `payload` on `channel`, reliably or not.
    ///
    /// Returns the engine status: non-negative if queued, negative if rejected.
    /// Rejections are also published as errors.
    pub fn send(&self, peer: PeerHandle, channel: u8, payload: &[u8], reliable: bool) -> i32 {
        self.dispatch(peer, channel, payload, PacketFlags::for_delivery(reliable))
    }

    /// Sends UTF-8 text as the payload.
    pub fn send_str(&self, peer: PeerHandle, channel: u8, text: &str, reliable: bool) -> i32 {
        self.send(peer, channel, text.as_bytes(), reliable)
    }

    /// Sends `bytes` with caller-chosen flags. `NO_ALLOCATE` is always cleared
    /// so the engine copies the payload.
    pub fn send_raw(&self, peer: PeerHandle, channel: u8, bytes: &[u8], flags: PacketFlags) -> i32 {
        self.dispatch(peer, channel, bytes, flags.without(PacketFlags::NO_ALLOCATE))
    }

    /// Graceful disconnect; the record is removed immediately.
    pub fn disconnect(&self, peer: PeerHandle, data: u32) -> Result<()> {
        self.terminate(peer, data, DisconnectMode::Graceful)
    }

    /// Immediate disconnect; the record is removed immediately.
    pub fn disconnect_now(&self, peer: PeerHandle, data: u32) -> Result<()> {
        self.terminate(peer, data, DisconnectMode::Immediate)
    }

    /// Deferred disconnect; the record is removed immediately.
    pub fn disconnect_later(&self, peer: PeerHandle, data: u32) -> Result<()> {
        self.terminate(peer, data, DisconnectMode::Deferred)
    }

    /// Disconnects with an explicit mode.
    pub fn terminate(&self, peer: PeerHandle, data: u32, mode: DisconnectMode) -> Result<()> {
        let result = {
            let mut core = self.lock();
            core.registry.remove(peer).map(|(engine_peer, _)| {
                match mode {
                    DisconnectMode::Graceful => core.engine.peer_disconnect(engine_peer, data),
                    DisconnectMode::Immediate => core.engine.peer_disconnect_now(engine_peer, data),
                    DisconnectMode::Deferred => core.engine.peer_disconnect_later(engine_peer, data),
                }
                debug!("{:?} disconnect of {} requested", mode, peer);
            })
        };
        result.map_err(|err| self.report(err))
    }

    /// Sends every queued packet without servicing. No-op before a host exists.
    pub fn flush(&self) {
        let mut core = self.lock();
        if core.host_created {
            core.engine.flush();
        }
    }

    /// Destroys the engine host and forgets all peers. Safe to call repeatedly.
    pub fn destroy(&self) {
        self.lock().destroy_host();
    }

    /// Destroys the host and releases this session's engine slot.
    pub fn deinitialize(&self) {
        let mut core = self.lock();
        core.destroy_host();
        if core.initialized {
            core.initialized = false;
            let init_state = core.init_state;
            init_state.release(&mut core.engine);
        }
    }

    /// Event bus of this session.
    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    /// Configuration the session was created with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Role of this session.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns true once `initialize` succeeded.
    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    /// Returns true while an engine host exists.
    pub fn has_host(&self) -> bool {
        self.lock().host_created
    }

    /// Record of a registered peer.
    pub fn peer(&self, peer: PeerHandle) -> Option<PeerRecord> {
        self.lock().registry.get(peer).ok().cloned()
    }

    /// All registered peers in registry order.
    pub fn peers(&self) -> Vec<(PeerHandle, PeerRecord)> {
        self.lock().registry.iter().map(|(handle, record)| (handle, record.clone())).collect()
    }

    /// Handles of connected peers in registry order.
    pub fn connected_peers(&self) -> Vec<PeerHandle> {
        self.lock().registry.connected()
    }

    /// Number of registered peers, connected or pending.
    pub fn peer_count(&self) -> usize {
        self.lock().registry.len()
    }

    /// Events dropped because their peer had already been removed.
    pub fn stale_event_count(&self) -> u64 {
        self.lock().stale_events
    }

    /// A handle that does not keep the session alive.
    ///
    /// Subscribers that call back into their own session should capture one of
    /// these; a strong clone inside a callback keeps the session, and with it
    /// the engine host, alive forever.
    pub fn downgrade(&self) -> WeakHostSession<E> {
        WeakHostSession {
            core: Arc::downgrade(&self.core),
            bus: Arc::downgrade(&self.bus),
            config: self.config.clone(),
            role: self.role,
        }
    }

    /// Starts a connection and registers the pending peer with `connected = false`.
    pub(crate) fn connect_peer(&self, address: &str, port: u16, data: u32) -> Result<PeerHandle> {
        let result = {
            let mut core = self.lock();
            if !core.host_created {
                Err(ErrorKind::HostNotCreated)
            } else {
                let channel_limit = core.config.channel_limit;
                core.engine.connect(address, port, channel_limit, data).map(|engine_peer| {
                    let record = PeerRecord {
                        connected: false,
                        address: Some(address.to_string()),
                        port: Some(port),
                    };
                    core.abandoned.remove(&engine_peer);
                    let handle = core.registry.insert(engine_peer, record);
                    debug!("Connecting to {}:{} as {}", address, port, handle);
                    handle
                })
            }
        };
        result.map_err(|err| self.report(err))
    }

    /// Drops `peer` with an immediate disconnect, without reporting anything,
    /// and ignores any later event the engine produces for it.
    pub(crate) fn abandon(&self, peer: PeerHandle, data: u32) {
        let mut core = self.lock();
        if let Ok((engine_peer, _)) = core.registry.remove(peer) {
            if core.host_created {
                core.engine.peer_disconnect_now(engine_peer, data);
            }
            core.abandoned.insert(engine_peer);
            debug!("Abandoned {}", peer);
        }
    }

    /// Logs and publishes `err`, handing it back for the caller's return value.
    pub(crate) fn report(&self, err: ErrorKind) -> ErrorKind {
        debug!("Reporting session error: {}", err);
        self.bus.publish(&SessionEvent::Error(err.clone()));
        err
    }

    fn dispatch(&self, peer: PeerHandle, channel: u8, payload: &[u8], flags: PacketFlags) -> i32 {
        let outcome = {
            let mut core = self.lock();
            if !core.host_created {
                Err(ErrorKind::HostNotCreated)
            } else {
                core.registry.engine_peer(peer).and_then(|engine_peer| {
                    let status = core.engine.peer_send(engine_peer, channel, payload, flags);
                    if status < 0 {
                        Err(ErrorKind::SendFailed { status })
                    } else {
                        Ok(status)
                    }
                })
            }
        };

        match outcome {
            Ok(status) => status,
            Err(err) => {
                warn!("Send to {} on channel {} rejected: {}", peer, channel, err);
                let status = match err {
                    ErrorKind::SendFailed { status } => status,
                    _ => -1,
                };
                self.report(err);
                status
            }
        }
    }

    fn poll_engine(&self, timeout: Duration) -> Result<Option<Event>> {
        let source = {
            let mut core = self.lock();
            if !core.host_created {
                return Ok(None);
            }
            let source = match core.events.clone() {
                Some(source) if !timeout.is_zero() => source,
                _ => {
                    let polled = core.engine.host_service(timeout)?;
                    return Ok(polled.and_then(|event| core.translate(event)));
                }
            };
            if let Some(event) = core.engine.host_service(Duration::ZERO)? {
                return Ok(core.translate(event));
            }
            source
        };

        let waited = source.wait_event(timeout);
        let mut core = self.lock();
        let same_host = core.host_created
            && core.events.as_ref().is_some_and(|current| Arc::ptr_eq(current, &source));
        if !same_host {
            // The host went away while waiting; its events no longer apply.
            return Ok(None);
        }
        Ok(waited?.and_then(|event| core.translate(event)))
    }

    fn lock(&self) -> MutexGuard<'_, SessionCore<E>> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Non-owning handle to a [`HostSession`], see [`HostSession::downgrade`].
pub struct WeakHostSession<E: TransportEngine> {
    core: Weak<Mutex<SessionCore<E>>>,
    bus: Weak<EventBus>,
    config: Arc<SessionConfig>,
    role: Role,
}

impl<E: TransportEngine> Clone for WeakHostSession<E> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            bus: self.bus.clone(),
            config: self.config.clone(),
            role: self.role,
        }
    }
}

impl<E: TransportEngine> fmt::Debug for WeakHostSession<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakHostSession").field("role", &self.role).finish()
    }
}

impl<E: TransportEngine> WeakHostSession<E> {
    /// The session, unless every strong handle has been dropped.
    pub fn upgrade(&self) -> Option<HostSession<E>> {
        Some(HostSession {
            core: self.core.upgrade()?,
            bus: self.bus.upgrade()?,
            config: self.config.clone(),
            role: self.role,
        })
    }
}
