//! Process-wide reference count over engine initialization.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex, PoisonError,
};

use tracing::{debug, warn};

use crate::{
    error::{ErrorKind, Result},
    transport::TransportEngine,
};

static GLOBAL: EngineInitState = EngineInitState::new();

/// Reference count over engine `init`/`deinit`.
///
/// The first `acquire` initializes the engine and the last `release` tears it
/// down, regardless of how many sessions came and went in between. Transitions
/// are serialized so a second acquirer never observes a half-initialized engine.
#[derive(Debug)]
pub struct EngineInitState {
    count: AtomicUsize,
    transition: Mutex<()>,
}

impl Default for EngineInitState {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineInitState {
    /// Creates an independent counter. Sessions use [`EngineInitState::global`] unless told otherwise.
    pub const fn new() -> Self {
        Self { count: AtomicUsize::new(0), transition: Mutex::new(()) }
    }

    /// The process-wide counter.
    pub fn global() -> &'static EngineInitState {
        &GLOBAL
    }

    /// Takes a slot, initializing the engine on the 0 -> 1 transition.
    pub fn acquire<E: TransportEngine + ?Sized>(&self, engine: &mut E) -> Result<()> {
        let _guard = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        if self.count.load(Ordering::Acquire) == 0 {
            if !engine.init() {
                warn!("Transport engine initialization failed");
                return Err(ErrorKind::InitFailed);
            }
            debug!("Transport engine initialized");
        }
        self.count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Releases a slot, tearing the engine down on the N -> 0 transition.
    pub fn release<E: TransportEngine + ?Sized>(&self, engine: &mut E) {
        let _guard = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        if self.count.load(Ordering::Acquire) == 0 {
            warn!("Unbalanced engine release ignored");
            return;
        }
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            engine.deinit();
            debug!("Transport engine deinitialized");
        }
    }

    /// Number of slots currently held.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}
