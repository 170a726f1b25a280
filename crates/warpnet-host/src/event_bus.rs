//! Typed publish/subscribe registry, one subscriber list per event kind.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use tracing::error;
use warpnet_core::error::ErrorKind;

use crate::{
    event_types::{EventKind, SessionEvent},
    peer_registry::PeerHandle,
};

type Callback = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Token returned by `subscribe`, used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    once: bool,
    callback: Callback,
}

/// Subscriber registry for session events.
///
/// Callbacks run synchronously on the thread that publishes, after the
/// registry lock is released, so a callback may subscribe, unsubscribe or call
/// back into the session. A panicking callback is logged and skipped; the
/// remaining callbacks still run.
pub struct EventBus {
    lists: Mutex<[Vec<Subscriber>; EventKind::COUNT]>,
    next_id: AtomicU64,
    panics: AtomicUsize,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lists = self.lists();
        let counts: Vec<_> =
            EventKind::ALL.iter().map(|kind| (*kind, lists[kind.index()].len())).collect();
        f.debug_struct("EventBus").field("subscribers", &counts).finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates a bus with no subscribers.
    pub fn new() -> Self {
        Self {
            lists: Mutex::new(Default::default()),
            next_id: AtomicU64::new(1),
            panics: AtomicUsize::new(0),
        }
    }

    /// Registers `callback` for every publication of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.register(kind, false, Arc::new(callback))
    }

    /// Registers `callback` for the next publication of `kind` only.
    pub fn subscribe_once<F>(&self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.register(kind, true, Arc::new(callback))
    }

    /// Removes a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut lists = self.lists();
        for list in lists.iter_mut() {
            if let Some(position) = list.iter().position(|subscriber| subscriber.id == id) {
                list.remove(position);
                return true;
            }
        }
        false
    }

    /// Delivers `event` to the subscribers of its kind. Returns how many ran.
    pub fn publish(&self, event: &SessionEvent) -> usize {
        let kind = event.kind();
        let callbacks: Vec<Callback> = {
            let mut lists = self.lists();
            let list = &mut lists[kind.index()];
            let callbacks = list.iter().map(|subscriber| subscriber.callback.clone()).collect();
            list.retain(|subscriber| !subscriber.once);
            callbacks
        };

        for callback in &callbacks {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
                self.panics.fetch_add(1, Ordering::Relaxed);
                error!("{:?} subscriber panicked: {}", kind, panic_message(payload.as_ref()));
            }
        }
        callbacks.len()
    }

    /// Number of subscribers registered for `kind`.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.lists()[kind.index()].len()
    }

    /// Number of subscriber callbacks that panicked so far.
    pub fn panic_count(&self) -> usize {
        self.panics.load(Ordering::Relaxed)
    }

    /// Removes every subscription.
    pub fn clear(&self) {
        for list in self.lists().iter_mut() {
            list.clear();
        }
    }

    /// Subscribes to server readiness.
    pub fn on_ready<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.subscribe(EventKind::Ready, move |_| callback())
    }

    /// Subscribes to peer connections.
    pub fn on_connect<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(PeerHandle) + Send + Sync + 'static,
    {
        self.subscribe(EventKind::Connect, move |event| {
            if let SessionEvent::Connect { peer } = event {
                callback(*peer)
            }
        })
    }

    /// Subscribes to peer disconnections.
    pub fn on_disconnect<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(PeerHandle, u32) + Send + Sync + 'static,
    {
        self.subscribe(EventKind::Disconnect, move |event| {
            if let SessionEvent::Disconnect { peer, code } = event {
                callback(*peer, *code)
            }
        })
    }

    /// Subscribes to received packets.
    pub fn on_receive<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(PeerHandle, u8, &[u8]) + Send + Sync + 'static,
    {
        self.subscribe(EventKind::Receive, move |event| {
            if let SessionEvent::Receive { peer, channel, payload } = event {
                callback(*peer, *channel, payload)
            }
        })
    }

    /// Subscribes to reported errors.
    pub fn on_error<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ErrorKind) + Send + Sync + 'static,
    {
        self.subscribe(EventKind::Error, move |event| {
            if let SessionEvent::Error(err) = event {
                callback(err)
            }
        })
    }

    fn register(&self, kind: EventKind, once: bool, callback: Callback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lists()[kind.index()].push(Subscriber { id, once, callback });
        id
    }

    fn lists(&self) -> MutexGuard<'_, [Vec<Subscriber>; EventKind::COUNT]> {
        self.lists.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic>"
    }
}
