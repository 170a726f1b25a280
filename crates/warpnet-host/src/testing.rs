//! Scripted engine for unit tests.

use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use warpnet_core::{
    engine_state::EngineInitState,
    error::{ErrorKind, Result},
    transport::{BindAddress, EngineEvent, EnginePeerId, HostOptions, PacketFlags, TransportEngine},
};

/// An init counter private to one test.
pub(crate) fn fresh_init_state() -> &'static EngineInitState {
    Box::leak(Box::new(EngineInitState::new()))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum EngineCall {
    Init,
    Deinit,
    CreateHost(Option<BindAddress>, HostOptions),
    DestroyHost,
    Flush,
    Connect(String, u16),
    Disconnect(EnginePeerId, u32),
    DisconnectNow(EnginePeerId, u32),
    DisconnectLater(EnginePeerId, u32),
    SetCompression(bool),
    SetChecksum(bool),
    SetNewPacketMode(bool, bool),
}

#[derive(Default)]
struct Script {
    calls: Vec<EngineCall>,
    sends: Vec<(EnginePeerId, u8, Vec<u8>, PacketFlags)>,
    events: VecDeque<EngineEvent>,
    fail_init: bool,
    fail_create_host: bool,
    service_error: Option<String>,
    send_status: i32,
    rejected: HashSet<EnginePeerId>,
    next_peer: u64,
    last_connected: Option<EnginePeerId>,
}

/// Engine whose events are queued by the test and whose calls are recorded.
#[derive(Clone, Default)]
pub(crate) struct ScriptedEngine {
    script: Arc<Mutex<Script>>,
}

impl ScriptedEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_init(&self) {
        self.script.lock().unwrap().fail_init = true;
    }

    pub(crate) fn fail_create_host(&self) {
        self.script.lock().unwrap().fail_create_host = true;
    }

    pub(crate) fn fail_service(&self, reason: &str) {
        self.script.lock().unwrap().service_error = Some(reason.to_string());
    }

    pub(crate) fn set_send_status(&self, status: i32) {
        self.script.lock().unwrap().send_status = status;
    }

    pub(crate) fn reject_sends_to(&self, peer: EnginePeerId) {
        self.script.lock().unwrap().rejected.insert(peer);
    }

    pub(crate) fn push_event(&self, event: EngineEvent) {
        self.script.lock().unwrap().events.push_back(event);
    }

    pub(crate) fn calls(&self) -> Vec<EngineCall> {
        self.script.lock().unwrap().calls.clone()
    }

    pub(crate) fn count(&self, predicate: impl Fn(&EngineCall) -> bool) -> usize {
        self.script.lock().unwrap().calls.iter().filter(|call| predicate(call)).count()
    }

    pub(crate) fn sends(&self) -> Vec<(EnginePeerId, u8, Vec<u8>, PacketFlags)> {
        self.script.lock().unwrap().sends.clone()
    }

    pub(crate) fn last_connected_peer(&self) -> Option<EnginePeerId> {
        self.script.lock().unwrap().last_connected
    }

    fn record(&self, call: EngineCall) {
        self.script.lock().unwrap().calls.push(call);
    }
}

impl TransportEngine for ScriptedEngine {
    fn init(&mut self) -> bool {
        self.record(EngineCall::Init);
        !self.script.lock().unwrap().fail_init
    }

    fn deinit(&mut self) {
        self.record(EngineCall::Deinit);
    }

    fn create_host(&mut self, bind: Option<&BindAddress>, options: HostOptions) -> Result<()> {
        self.record(EngineCall::CreateHost(bind.cloned(), options));
        if self.script.lock().unwrap().fail_create_host {
            return Err(ErrorKind::HostCreateFailed("scripted failure".into()));
        }
        Ok(())
    }

    fn destroy_host(&mut self) {
        self.record(EngineCall::DestroyHost);
    }

    fn host_service(&mut self, _timeout: Duration) -> Result<Option<EngineEvent>> {
        let mut script = self.script.lock().unwrap();
        if let Some(reason) = script.service_error.clone() {
            return Err(ErrorKind::Transport(reason));
        }
        Ok(script.events.pop_front())
    }

    fn flush(&mut self) {
        self.record(EngineCall::Flush);
    }

    fn connect(&mut self, address: &str, port: u16, _: usize, _: u32) -> Result<EnginePeerId> {
        self.record(EngineCall::Connect(address.to_string(), port));
        let mut script = self.script.lock().unwrap();
        script.next_peer += 1;
        let peer = EnginePeerId(1000 + script.next_peer);
        script.last_connected = Some(peer);
        Ok(peer)
    }

    fn peer_disconnect(&mut self, peer: EnginePeerId, data: u32) {
        self.record(EngineCall::Disconnect(peer, data));
    }

    fn peer_disconnect_now(&mut self, peer: EnginePeerId, data: u32) {
        self.record(EngineCall::DisconnectNow(peer, data));
    }

    fn peer_disconnect_later(&mut self, peer: EnginePeerId, data: u32) {
        self.record(EngineCall::DisconnectLater(peer, data));
    }

    fn peer_send(&mut self, peer: EnginePeerId, channel: u8, payload: &[u8], flags: PacketFlags) -> i32 {
        let mut script = self.script.lock().unwrap();
        script.sends.push((peer, channel, payload.to_vec(), flags));
        if script.rejected.contains(&peer) {
            return -1;
        }
        script.send_status
    }

    fn set_compression(&mut self, enabled: bool) {
        self.record(EngineCall::SetCompression(enabled));
    }

    fn set_checksum(&mut self, enabled: bool) {
        self.record(EngineCall::SetChecksum(enabled));
    }

    fn set_new_packet_mode(&mut self, enabled: bool, is_server: bool) {
        self.record(EngineCall::SetNewPacketMode(enabled, is_server));
    }
}
