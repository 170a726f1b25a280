//! Adaptive polling loop that drives a session's `service`.
//!
//! The interval drops back to the base value whenever an event is produced
//! and doubles on every idle poll, up to the configured maximum. Busy sessions
//! therefore poll at the base rate and idle ones cost a wakeup every
//! `max_poll_interval`.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use tracing::{debug, error};
use warpnet_core::{
    config::PollerConfig,
    error::{ErrorKind, Result},
    transport::TransportEngine,
};

use crate::{event_types::Event, session::HostSession};

/// Something the poller can service.
pub trait PollTarget: Send + Sync + 'static {
    /// Polls once, waiting up to `timeout` for an event.
    fn service(&self, timeout: Duration) -> Result<Option<Event>>;

    /// Called once by the loop before the first poll.
    fn on_poll_start(&self) {}
}

impl<E: TransportEngine> PollTarget for HostSession<E> {
    fn service(&self, timeout: Duration) -> Result<Option<Event>> {
        HostSession::service(self, timeout)
    }
}

impl<T: PollTarget> PollTarget for Arc<T> {
    fn service(&self, timeout: Duration) -> Result<Option<Event>> {
        T::service(self, timeout)
    }

    fn on_poll_start(&self) {
        T::on_poll_start(self)
    }
}

/// Shared running flag of a polling loop.
#[derive(Clone, Debug, Default)]
pub struct PollerControl {
    running: Arc<AtomicBool>,
}

impl PollerControl {
    /// Creates a stopped control.
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the loop to exit after its current poll.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Returns true while the loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }
}

/// Polling loop with an interval that backs off while idle.
#[derive(Debug)]
pub struct AdaptivePoller {
    config: PollerConfig,
    current_interval: Duration,
    control: PollerControl,
}

impl AdaptivePoller {
    /// Creates a poller with its own control.
    pub fn new(config: PollerConfig) -> Self {
        Self::with_control(config, PollerControl::new())
    }

    /// Creates a poller driven by an existing control.
    pub fn with_control(config: PollerConfig, control: PollerControl) -> Self {
        Self { config, current_interval: config.poll_interval, control }
    }

    /// Interval the loop sleeps before the next poll.
    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    /// Control of this poller's loop.
    pub fn control(&self) -> &PollerControl {
        &self.control
    }

    /// Services `target` once, bounded by the current interval, and adjusts the interval.
    pub fn poll_once<T: PollTarget + ?Sized>(&mut self, target: &T) -> Result<Option<Event>> {
        let event = target.service(self.current_interval)?;
        self.current_interval = match event {
            Some(_) => self.config.poll_interval,
            None => (self.current_interval * 2).min(self.config.max_poll_interval),
        };
        Ok(event)
    }

    /// Runs the loop on the calling thread until stopped or a poll fails.
    pub fn run<T: PollTarget + ?Sized>(&mut self, target: &T) -> Result<()> {
        self.control.start();
        self.run_started(target)
    }

    fn run_started<T: PollTarget + ?Sized>(&mut self, target: &T) -> Result<()> {
        target.on_poll_start();
        debug!("Poll loop started ({:?})", self.config);

        let result = loop {
            if !self.control.is_running() {
                break Ok(());
            }
            if let Err(err) = self.poll_once(target) {
                error!("Poll loop stopped on error: {}", err);
                break Err(err);
            }
            thread::sleep(self.current_interval);
        };

        self.control.stop();
        debug!("Poll loop exited");
        result
    }

    /// Runs the loop on a background thread.
    ///
    /// The control reports running as soon as this returns.
    pub fn spawn<T: PollTarget>(mut self, target: T) -> Result<PollerHandle> {
        let control = self.control.clone();
        control.start();
        let thread = thread::Builder::new()
            .name("warpnet-poller".into())
            .spawn(move || self.run_started(&target))
            .map_err(|err| {
                control.stop();
                ErrorKind::Transport(format!("failed to spawn poll thread: {}", err))
            })?;
        Ok(PollerHandle { control, thread: Some(thread) })
    }
}

/// Owner of a background poll loop. Dropping it stops the loop.
#[derive(Debug)]
pub struct PollerHandle {
    control: PollerControl,
    thread: Option<JoinHandle<Result<()>>>,
}

impl PollerHandle {
    /// Asks the loop to exit.
    pub fn stop(&self) {
        self.control.stop();
    }

    /// Returns true while the loop is running.
    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    /// Control shared with the loop.
    pub fn control(&self) -> &PollerControl {
        &self.control
    }

    /// Waits for the loop to exit and returns how it ended.
    pub fn join(mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .unwrap_or_else(|_| Err(ErrorKind::Transport("poll thread panicked".into()))),
            None => Ok(()),
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.control.stop();
    }
}
