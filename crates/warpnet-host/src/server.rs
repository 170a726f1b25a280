//! Server role: bind an address and accept many peers.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tracing::{debug, warn};
use warpnet_core::{
    config::{PollerConfig, SessionConfig},
    engine_state::EngineInitState,
    error::{ErrorKind, Result},
    transport::{BindAddress, HostOptions, TransportEngine},
};

use crate::{
    event_bus::EventBus,
    event_types::{Event, SessionEvent},
    peer_registry::PeerHandle,
    poller::{AdaptivePoller, PollTarget, PollerControl, PollerHandle},
    port_probe::{PortProbe, UdpPortProbe},
    session::{HostSession, Role},
};

/// Outcome of a [`ServerSession::broadcast`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Number of peers a send was attempted on.
    pub attempted: usize,
    /// Peers whose send was rejected.
    pub failed: Vec<PeerHandle>,
}

impl BroadcastReport {
    /// Number of sends the engine accepted.
    pub fn delivered(&self) -> usize {
        self.attempted - self.failed.len()
    }
}

/// A host session bound to an address, accepting up to `max_peers` peers.
///
/// The startup sequence is: initialize the engine, probe the port, create the
/// bound host, apply the engine toggles, then arm a one-shot `Ready`
/// publication that fires when the serving loop starts.
pub struct ServerSession<E: TransportEngine> {
    session: HostSession<E>,
    probe: Arc<dyn PortProbe>,
    poller_config: PollerConfig,
    control: PollerControl,
    ready_pending: Arc<AtomicBool>,
}

impl<E: TransportEngine> Clone for ServerSession<E> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            probe: self.probe.clone(),
            poller_config: self.poller_config,
            control: self.control.clone(),
            ready_pending: self.ready_pending.clone(),
        }
    }
}

impl<E: TransportEngine> fmt::Debug for ServerSession<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSession")
            .field("session", &self.session)
            .field("poller_config", &self.poller_config)
            .field("serving", &self.control.is_running())
            .finish()
    }
}

impl<E: TransportEngine> ServerSession<E> {
    /// Creates an unstarted server. Call [`start`](Self::start) before serving.
    pub fn new(engine: E, config: SessionConfig) -> Self {
        Self::with_init_state(engine, config, EngineInitState::global())
    }

    /// Creates an unstarted server counting engine initialization in `init_state`.
    pub fn with_init_state(engine: E, config: SessionConfig, init_state: &'static EngineInitState) -> Self {
        Self {
            session: HostSession::with_init_state(engine, config, Role::Server, init_state),
            probe: Arc::new(UdpPortProbe),
            poller_config: PollerConfig::default(),
            control: PollerControl::new(),
            ready_pending: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Creates a server and runs the full startup sequence.
    ///
    /// On failure no host is left running and the engine slot is released.
    pub fn create(engine: E, config: SessionConfig) -> Result<Self> {
        let server = Self::new(engine, config);
        server.start()?;
        Ok(server)
    }

    /// Replaces the port availability check.
    pub fn with_port_probe<P: PortProbe + 'static>(mut self, probe: P) -> Self {
        self.probe = Arc::new(probe);
        self
    }

    /// Replaces the bounds of the serving loop's poll interval.
    pub fn with_poller_config(mut self, config: PollerConfig) -> Self {
        self.poller_config = config;
        self
    }

    /// Runs the startup sequence.
    pub fn start(&self) -> Result<()> {
        let config = self.session.config().clone();
        self.session.initialize()?;

        if !self.probe.is_available(&config.address, config.port) {
            warn!("Port {}:{} is already in use", config.address, config.port);
            self.session.deinitialize();
            return Err(self.session.report(ErrorKind::PortInUse { address: config.address, port: config.port }));
        }

        let bind = BindAddress { address: config.address.clone(), port: config.port };
        let options = HostOptions {
            peer_count: config.max_peers,
            channel_limit: config.channel_limit,
            incoming_bandwidth: config.incoming_bandwidth,
            outgoing_bandwidth: config.outgoing_bandwidth,
        };
        if let Err(err) = self.session.create_host(Some(bind), options) {
            self.session.deinitialize();
            return Err(err);
        }

        self.ready_pending.store(true, Ordering::SeqCst);
        debug!("Server bound to {}:{} for {} peers", config.address, config.port, config.max_peers);
        Ok(())
    }

    /// Runs the serving loop on the calling thread until [`stop`](Self::stop)
    /// or a fatal transport error.
    pub fn serve(&self) -> Result<()> {
        self.ensure_host()?;
        AdaptivePoller::with_control(self.poller_config, self.control.clone()).run(self)
    }

    /// Runs the serving loop on a background thread.
    pub fn serve_in_background(&self) -> Result<PollerHandle> {
        self.ensure_host()?;
        AdaptivePoller::with_control(self.poller_config, self.control.clone()).spawn(self.clone())
    }

    /// Asks the serving loop to exit after its current iteration.
    pub fn stop(&self) {
        self.control.stop();
    }

    /// Returns true while the serving loop runs.
    pub fn is_serving(&self) -> bool {
        self.control.is_running()
    }

    /// Stops serving, destroys the host and releases the engine slot.
    pub fn shutdown(&self) {
        self.stop();
        self.session.deinitialize();
    }

    /// Sends `payload` to every connected peer, in registry order.
    ///
    /// A rejected send is reported and recorded; the remaining peers are still attempted.
    pub fn broadcast(&self, channel: u8, payload: &[u8], reliable: bool) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for peer in self.session.connected_peers() {
            report.attempted += 1;
            if self.session.send(peer, channel, payload, reliable) < 0 {
                report.failed.push(peer);
            }
        }
        if !report.failed.is_empty() {
            warn!("Broadcast on channel {} failed for {} of {} peers", channel, report.failed.len(), report.attempted);
        }
        report
    }

    /// Underlying host session.
    pub fn session(&self) -> &HostSession<E> {
        &self.session
    }

    /// Event bus of the session.
    pub fn events(&self) -> &EventBus {
        self.session.events()
    }

    /// Control of the serving loop, usable from subscribers and other threads.
    pub fn poller_control(&self) -> PollerControl {
        self.control.clone()
    }

    fn ensure_host(&self) -> Result<()> {
        if self.session.has_host() {
            Ok(())
        } else {
            Err(self.session.report(ErrorKind::HostNotCreated))
        }
    }
}

impl<E: TransportEngine> PollTarget for ServerSession<E> {
    fn service(&self, timeout: Duration) -> Result<Option<Event>> {
        self.session.service(timeout)
    }

    fn on_poll_start(&self) {
        if self.ready_pending.swap(false, Ordering::SeqCst) {
            debug!("Server ready");
            self.session.events().publish(&SessionEvent::Ready);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{atomic::AtomicUsize, Mutex};

    use warpnet_core::transport::{EngineEvent, EnginePeerId};

    use super::*;
    use crate::testing::{fresh_init_state, EngineCall, ScriptedEngine};

    fn server(engine: &ScriptedEngine) -> ServerSession<ScriptedEngine> {
        ServerSession::with_init_state(engine.clone(), SessionConfig::server("0.0.0.0", 7777), fresh_init_state())
            .with_port_probe(|_: &str, _: u16| true)
    }

    fn connect_peers(engine: &ScriptedEngine, server: &ServerSession<ScriptedEngine>, ids: &[u64]) {
        for id in ids {
            engine.push_event(EngineEvent::Connect { peer: EnginePeerId(*id), address: None });
            server.session().service(Duration::ZERO).unwrap();
        }
    }

    #[test]
    fn test_start_binds_with_server_options() {
        let engine = ScriptedEngine::new();
        let server = server(&engine);
        server.start().unwrap();

        let expected = EngineCall::CreateHost(
            Some(BindAddress { address: "0.0.0.0".into(), port: 7777 }),
            HostOptions { peer_count: 32, channel_limit: 2, incoming_bandwidth: 0, outgoing_bandwidth: 0 },
        );
        assert!(engine.calls().contains(&expected));
        assert!(engine.calls().contains(&EngineCall::SetNewPacketMode(false, true)));
    }

    #[test]
    fn test_port_in_use_skips_bind() {
        let engine = ScriptedEngine::new();
        let state = fresh_init_state();
        let server = ServerSession::with_init_state(engine.clone(), SessionConfig::server("0.0.0.0", 7777), state)
            .with_port_probe(|_: &str, _: u16| false);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        server.events().on_error(move |err| sink.lock().unwrap().push(err.clone()));

        let expected = ErrorKind::PortInUse { address: "0.0.0.0".into(), port: 7777 };
        assert_eq!(server.start(), Err(expected.clone()));
        assert_eq!(engine.count(|call| matches!(call, EngineCall::CreateHost(..))), 0);
        assert_eq!(state.count(), 0);
        assert!(!server.session().has_host());
        assert_eq!(errors.lock().unwrap().as_slice(), &[expected]);
    }

    #[test]
    fn test_host_failure_releases_engine() {
        let engine = ScriptedEngine::new();
        engine.fail_create_host();
        let state = fresh_init_state();
        let server = ServerSession::with_init_state(engine.clone(), SessionConfig::server("0.0.0.0", 7777), state)
            .with_port_probe(|_: &str, _: u16| true);

        assert!(matches!(server.start(), Err(ErrorKind::HostCreateFailed(_))));
        assert_eq!(state.count(), 0);
        assert_eq!(engine.count(|call| matches!(call, EngineCall::Deinit)), 1);
    }

    #[test]
    fn test_ready_fires_once() {
        let engine = ScriptedEngine::new();
        let server = server(&engine);
        let readies = Arc::new(AtomicUsize::new(0));
        let r = readies.clone();
        server.events().on_ready(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });

        server.on_poll_start();
        assert_eq!(readies.load(Ordering::SeqCst), 0);

        server.start().unwrap();
        server.on_poll_start();
        server.on_poll_start();
        assert_eq!(readies.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_serve_without_host_fails() {
        let engine = ScriptedEngine::new();
        let server = server(&engine);
        assert_eq!(server.serve(), Err(ErrorKind::HostNotCreated));
        assert!(server.serve_in_background().is_err());
    }

    #[test]
    fn test_broadcast_continues_past_failures() {
        let engine = ScriptedEngine::new();
        let server = server(&engine);
        server.start().unwrap();
        connect_peers(&engine, &server, &[1, 2, 3]);
        engine.reject_sends_to(EnginePeerId(2));

        let report = server.broadcast(0, b"tick", true);
        assert_eq!(report.attempted, 3);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.delivered(), 2);
        let targets: Vec<_> = engine.sends().into_iter().map(|send| send.0).collect();
        assert_eq!(targets, vec![EnginePeerId(1), EnginePeerId(2), EnginePeerId(3)]);
    }

    #[test]
    fn test_broadcast_skips_pending_peers() {
        let engine = ScriptedEngine::new();
        let server = server(&engine);
        server.start().unwrap();
        connect_peers(&engine, &server, &[1]);
        server.session().connect_peer("10.0.0.9", 9000, 0).unwrap();

        let report = server.broadcast(1, b"x", false);
        assert_eq!(report.attempted, 1);
        assert!(report.failed.is_empty());
    }

    #[test]
    fn test_background_serving_stops() {
        let engine = ScriptedEngine::new();
        let server = server(&engine);
        server.start().unwrap();
        let handle = server.serve_in_background().unwrap();
        assert!(server.is_serving());

        server.stop();
        assert_eq!(handle.join(), Ok(()));
        assert!(!server.is_serving());
    }
}
