//! In-process transport engine.
//!
//! Every [`LoopbackEngine`] created from the same [`LoopbackNetwork`] can reach
//! the others by bound address without touching the network stack. Delivery is
//! lossless and in order, so reliable and unreliable sends behave the same.
//! Used for local sessions and for tests.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace};
use warpnet_core::{
    error::{ErrorKind, Result},
    transport::{
        BindAddress, EngineEvent, EnginePeerId, EventSource, HostOptions, PacketFlags, TransportEngine,
    },
};
use warpnet_utilities::parse_ip;

const FIRST_EPHEMERAL_PORT: u16 = 50000;

type EndpointId = u64;

#[derive(Clone, Copy, Debug)]
struct Link {
    endpoint: EndpointId,
    peer: EnginePeerId,
}

#[derive(Debug)]
struct Endpoint {
    address: SocketAddr,
    sender: Sender<EngineEvent>,
    options: HostOptions,
    // `None` until the remote side accepted the connection.
    peers: HashMap<EnginePeerId, Option<Link>>,
}

#[derive(Debug)]
struct NetworkState {
    endpoints: HashMap<EndpointId, Endpoint>,
    bound: HashMap<SocketAddr, EndpointId>,
    next_endpoint: EndpointId,
    next_peer: u64,
    next_port: u16,
}

impl NetworkState {
    fn allocate_port(&mut self, ip: IpAddr) -> u16 {
        loop {
            let port = self.next_port;
            self.next_port = self.next_port.checked_add(1).unwrap_or(FIRST_EPHEMERAL_PORT);
            if !self.bound.contains_key(&SocketAddr::new(ip, port)) {
                return port;
            }
        }
    }

    fn allocate_peer(&mut self) -> EnginePeerId {
        self.next_peer += 1;
        EnginePeerId(self.next_peer)
    }

    fn find(&self, address: &SocketAddr) -> Option<EndpointId> {
        let wildcard = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), address.port());
        self.bound.get(address).or_else(|| self.bound.get(&wildcard)).copied()
    }

    fn deliver(&self, endpoint: EndpointId, event: EngineEvent) -> bool {
        match self.endpoints.get(&endpoint) {
            Some(target) => target.sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Drops the remote half of `link`. Returns true if it was still there.
    fn unlink(&mut self, link: Link) -> bool {
        self.endpoints
            .get_mut(&link.endpoint)
            .and_then(|endpoint| endpoint.peers.remove(&link.peer))
            .is_some()
    }

    fn remove_endpoint(&mut self, id: EndpointId) {
        if let Some(endpoint) = self.endpoints.remove(&id) {
            self.bound.retain(|_, bound| *bound != id);
            debug!("Loopback endpoint {} closed", endpoint.address);
        }
    }
}

/// Shared medium of loopback engines. Clones refer to the same network.
#[derive(Clone, Debug)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        let state = NetworkState {
            endpoints: HashMap::new(),
            bound: HashMap::new(),
            next_endpoint: 0,
            next_peer: 0,
            next_port: FIRST_EPHEMERAL_PORT,
        };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    /// Number of hosts currently attached.
    pub fn host_count(&self) -> usize {
        self.lock().endpoints.len()
    }

    /// Returns true if a host is bound to `address`.
    pub fn is_bound(&self, address: SocketAddr) -> bool {
        self.lock().bound.contains_key(&address)
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Incoming queue of one loopback host.
#[derive(Debug)]
struct LoopbackEvents {
    receiver: Receiver<EngineEvent>,
}

impl EventSource for LoopbackEvents {
    fn wait_event(&self, timeout: Duration) -> Result<Option<EngineEvent>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(ErrorKind::Transport("loopback endpoint closed".into()))
            }
        }
    }
}

/// Engine attached to a [`LoopbackNetwork`].
#[derive(Debug)]
pub struct LoopbackEngine {
    network: LoopbackNetwork,
    endpoint: Option<EndpointId>,
    events: Option<Arc<LoopbackEvents>>,
    fail_init: bool,
    checksum: bool,
    compression: bool,
    new_packet_mode: bool,
}

impl LoopbackEngine {
    /// Creates an engine on `network`.
    pub fn new(network: &LoopbackNetwork) -> Self {
        Self {
            network: network.clone(),
            endpoint: None,
            events: None,
            fail_init: false,
            checksum: false,
            compression: false,
            new_packet_mode: false,
        }
    }

    /// Creates an engine whose library initialization always fails.
    pub fn failing_init(network: &LoopbackNetwork) -> Self {
        let mut engine = Self::new(network);
        engine.fail_init = true;
        engine
    }

    /// Local address of the host, once created.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let id = self.endpoint?;
        self.network.lock().endpoints.get(&id).map(|endpoint| endpoint.address)
    }

    /// Whether checksums were enabled on the host.
    pub fn checksum(&self) -> bool {
        self.checksum
    }

    /// Whether compression was enabled on the host.
    pub fn compression(&self) -> bool {
        self.compression
    }

    /// Whether the alternate packet framing was enabled on the host.
    pub fn new_packet_mode(&self) -> bool {
        self.new_packet_mode
    }

    fn close(&mut self) {
        if let Some(id) = self.endpoint.take() {
            self.network.lock().remove_endpoint(id);
        }
        self.events = None;
    }

    fn socket_addr(address: &str, port: u16) -> Option<SocketAddr> {
        if address.eq_ignore_ascii_case("localhost") {
            return Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
        }
        parse_ip(address, port).ok()
    }

    fn disconnect(&mut self, peer: EnginePeerId, data: u32, notify_self: bool) {
        let Some(id) = self.endpoint else { return };
        let mut network = self.network.lock();
        let removed = network.endpoints.get_mut(&id).and_then(|endpoint| endpoint.peers.remove(&peer));
        let Some(link) = removed else { return };
        if let Some(link) = link {
            if network.unlink(link) {
                network.deliver(link.endpoint, EngineEvent::Disconnect { peer: link.peer, data });
            }
        }
        if notify_self {
            network.deliver(id, EngineEvent::Disconnect { peer, data });
        }
    }
}

impl Drop for LoopbackEngine {
    fn drop(&mut self) {
        self.close();
    }
}

impl TransportEngine for LoopbackEngine {
    fn init(&mut self) -> bool {
        !self.fail_init
    }

    fn deinit(&mut self) {}

    fn create_host(&mut self, bind: Option<&BindAddress>, options: HostOptions) -> Result<()> {
        self.close();
        let mut network = self.network.lock();

        let address = match bind {
            Some(bind) => {
                let ip = Self::socket_addr(&bind.address, bind.port).map(|addr| addr.ip()).ok_or_else(|| {
                    ErrorKind::HostCreateFailed(format!("invalid bind address {}", bind.address))
                })?;
                let port = if bind.port == 0 { network.allocate_port(ip) } else { bind.port };
                let address = SocketAddr::new(ip, port);
                if network.bound.contains_key(&address) {
                    return Err(ErrorKind::HostCreateFailed(format!("{} is already bound", address)));
                }
                address
            }
            None => {
                let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
                SocketAddr::new(ip, network.allocate_port(ip))
            }
        };

        let (sender, receiver) = unbounded();
        let id = network.next_endpoint;
        network.next_endpoint += 1;
        network.endpoints.insert(id, Endpoint { address, sender, options, peers: HashMap::new() });
        network.bound.insert(address, id);
        drop(network);

        self.endpoint = Some(id);
        self.events = Some(Arc::new(LoopbackEvents { receiver }));
        debug!("Loopback host at {} ({} peers)", address, options.peer_count);
        Ok(())
    }

    fn destroy_host(&mut self) {
        self.close();
    }

    fn host_service(&mut self, timeout: Duration) -> Result<Option<EngineEvent>> {
        match &self.events {
            Some(events) => events.wait_event(timeout),
            None => Err(ErrorKind::HostNotCreated),
        }
    }

    fn event_source(&self) -> Option<Arc<dyn EventSource>> {
        self.events.clone().map(|events| events as Arc<dyn EventSource>)
    }

    fn flush(&mut self) {}

    fn connect(&mut self, address: &str, port: u16, channel_limit: usize, data: u32) -> Result<EnginePeerId> {
        let id = self.endpoint.ok_or(ErrorKind::HostNotCreated)?;
        let mut network = self.network.lock();

        let (local_address, local_capacity, local_peers) = match network.endpoints.get(&id) {
            Some(endpoint) => (endpoint.address, endpoint.options.peer_count, endpoint.peers.len()),
            None => return Err(ErrorKind::HostNotCreated),
        };
        if local_peers >= local_capacity {
            return Err(ErrorKind::Transport("no available peer slot".into()));
        }

        let local_peer = network.allocate_peer();
        let target = Self::socket_addr(address, port)
            .and_then(|remote| network.find(&remote).map(|endpoint| (remote, endpoint)));
        let accepted = target.filter(|(_, endpoint)| {
            network
                .endpoints
                .get(endpoint)
                .is_some_and(|target| target.peers.len() < target.options.peer_count)
        });

        let link = match accepted {
            Some((remote_address, remote_id)) => {
                let remote_peer = network.allocate_peer();
                if let Some(remote) = network.endpoints.get_mut(&remote_id) {
                    remote.peers.insert(remote_peer, Some(Link { endpoint: id, peer: local_peer }));
                }
                let accept = EngineEvent::Connect { peer: remote_peer, address: Some(local_address) };
                network.deliver(remote_id, accept);
                let connect = EngineEvent::Connect { peer: local_peer, address: Some(remote_address) };
                network.deliver(id, connect);
                debug!(
                    "Loopback {} connected to {} (channels {}, data {})",
                    local_address, remote_address, channel_limit, data
                );
                Some(Link { endpoint: remote_id, peer: remote_peer })
            }
            None => {
                debug!("Loopback {} dialing unreachable {}:{}", local_address, address, port);
                None
            }
        };
        if let Some(endpoint) = network.endpoints.get_mut(&id) {
            endpoint.peers.insert(local_peer, link);
        }
        Ok(local_peer)
    }

    fn peer_disconnect(&mut self, peer: EnginePeerId, data: u32) {
        self.disconnect(peer, data, true);
    }

    fn peer_disconnect_now(&mut self, peer: EnginePeerId, data: u32) {
        self.disconnect(peer, data, false);
    }

    fn peer_disconnect_later(&mut self, peer: EnginePeerId, data: u32) {
        self.disconnect(peer, data, true);
    }

    fn peer_send(&mut self, peer: EnginePeerId, channel: u8, payload: &[u8], flags: PacketFlags) -> i32 {
        let Some(id) = self.endpoint else { return -1 };
        let network = self.network.lock();
        let Some(local) = network.endpoints.get(&id) else { return -1 };
        if usize::from(channel) >= local.options.channel_limit {
            return -1;
        }
        let Some(Some(link)) = local.peers.get(&peer).copied() else { return -1 };
        let linked = network
            .endpoints
            .get(&link.endpoint)
            .is_some_and(|remote| remote.peers.contains_key(&link.peer));
        if !linked {
            return -1;
        }

        trace!("Loopback {} bytes on channel {} ({:?})", payload.len(), channel, flags);
        let event = EngineEvent::Receive { peer: link.peer, channel, payload: payload.to_vec() };
        if network.deliver(link.endpoint, event) {
            0
        } else {
            -1
        }
    }

    fn set_compression(&mut self, enabled: bool) {
        self.compression = enabled;
    }

    fn set_checksum(&mut self, enabled: bool) {
        self.checksum = enabled;
    }

    fn set_new_packet_mode(&mut self, enabled: bool, is_server: bool) {
        trace!("Loopback packet mode {} (server: {})", enabled, is_server);
        self.new_packet_mode = enabled;
    }
}
