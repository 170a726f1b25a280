//! Generation-checked arena of peer records.

use std::{collections::HashMap, fmt};

use warpnet_core::{
    error::{ErrorKind, Result},
    transport::EnginePeerId,
};

/// Opaque identifier of one remote peer for the lifetime of its connection.
///
/// Handles compare by equality only. Releasing a peer bumps its slot's
/// generation, so a handle kept past its peer's removal is detected instead of
/// aliasing whichever peer reuses the slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle {
    index: u32,
    generation: u32,
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerHandle({}v{})", self.index, self.generation)
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}v{}", self.index, self.generation)
    }
}

/// Local state of one peer.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct PeerRecord {
    /// True once the handshake completed.
    pub connected: bool,
    /// Remote IP, if known.
    pub address: Option<String>,
    /// Remote port, if known.
    pub port: Option<u16>,
}

#[derive(Debug)]
struct Entry {
    engine_peer: EnginePeerId,
    record: PeerRecord,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Mapping from peer handles to peer records, owned by one session.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_engine: HashMap<EnginePeerId, PeerHandle>,
}

impl PeerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an engine peer, or updates its record if it is already registered.
    pub fn insert(&mut self, engine_peer: EnginePeerId, record: PeerRecord) -> PeerHandle {
        if let Some(handle) = self.by_engine.get(&engine_peer).copied() {
            if let Some(entry) = self.entry_mut(handle) {
                entry.record = record;
            }
            return handle;
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.entry = Some(Entry { engine_peer, record });
        let handle = PeerHandle { index, generation: slot.generation };
        self.by_engine.insert(engine_peer, handle);
        handle
    }

    /// Handle currently registered for an engine peer.
    pub fn lookup(&self, engine_peer: EnginePeerId) -> Option<PeerHandle> {
        self.by_engine.get(&engine_peer).copied()
    }

    /// Returns the record of a registered peer.
    ///
    /// Fails with `NotConnected` for a handle whose peer was removed and with
    /// `InvalidPeerHandle` for a handle this registry never issued.
    pub fn get(&self, handle: PeerHandle) -> Result<&PeerRecord> {
        self.resolve(handle).map(|entry| &entry.record)
    }

    /// Engine peer behind a registered handle.
    pub fn engine_peer(&self, handle: PeerHandle) -> Result<EnginePeerId> {
        self.resolve(handle).map(|entry| entry.engine_peer)
    }

    /// Marks a registered peer as connected.
    pub fn set_connected(&mut self, handle: PeerHandle) -> Result<()> {
        self.resolve(handle)?;
        if let Some(entry) = self.entry_mut(handle) {
            entry.record.connected = true;
        }
        Ok(())
    }

    /// Removes a peer and retires its handle.
    pub fn remove(&mut self, handle: PeerHandle) -> Result<(EnginePeerId, PeerRecord)> {
        self.resolve(handle)?;
        let slot = &mut self.slots[handle.index as usize];
        let entry = slot.entry.take().ok_or(ErrorKind::InvalidPeerHandle)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.by_engine.remove(&entry.engine_peer);
        Ok((entry.engine_peer, entry.record))
    }

    /// Returns true if the handle refers to a registered peer.
    pub fn contains(&self, handle: PeerHandle) -> bool {
        self.resolve(handle).is_ok()
    }

    /// Registered peers in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (PeerHandle, &PeerRecord)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|entry| {
                (PeerHandle { index: index as u32, generation: slot.generation }, &entry.record)
            })
        })
    }

    /// Handles of all peers whose handshake completed, in slot order.
    pub fn connected(&self) -> Vec<PeerHandle> {
        self.iter().filter(|(_, record)| record.connected).map(|(handle, _)| handle).collect()
    }

    /// Number of registered peers.
    pub fn len(&self) -> usize {
        self.by_engine.len()
    }

    /// Returns true if no peer is registered.
    pub fn is_empty(&self) -> bool {
        self.by_engine.is_empty()
    }

    /// Removes every peer, retiring all outstanding handles.
    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.entry.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        self.by_engine.clear();
    }

    fn resolve(&self, handle: PeerHandle) -> Result<&Entry> {
        let slot = self.slots.get(handle.index as usize).ok_or(ErrorKind::InvalidPeerHandle)?;
        if slot.generation == handle.generation {
            return slot.entry.as_ref().ok_or(ErrorKind::InvalidPeerHandle);
        }
        if is_older(handle.generation, slot.generation) {
            Err(ErrorKind::NotConnected)
        } else {
            Err(ErrorKind::InvalidPeerHandle)
        }
    }

    fn entry_mut(&mut self, handle: PeerHandle) -> Option<&mut Entry> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_mut())
    }
}

/// Wrapping comparison of slot generations.
fn is_older(generation: u32, current: u32) -> bool {
    let distance = current.wrapping_sub(generation);
    distance != 0 && distance < u32::MAX / 2
}
