//! Readiness sources and the reactor that drives them.
//!
//! A [`StreamFilter`] wraps one camera's packet ring. It is registered with
//! the [`Reactor`] only while active; suspending it leaves the ring (and
//! whatever the kernel keeps writing into it) in place. Backpressure from the
//! decoder therefore costs nothing but ring overruns, which the kernel counts.

use std::collections::{BTreeMap, VecDeque};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::PacketRing;
use crate::camera::CameraId;
use crate::error::Result;

/// A packet ring exposed as a suspendable readiness source.
pub struct StreamFilter {
    ring: PacketRing,
    active: std::cell::Cell<bool>,
}

impl StreamFilter {
    /// Wrap a ring; the filter starts suspended.
    pub fn new(ring: PacketRing) -> Self {
        Self {
            ring,
            active: std::cell::Cell::new(false),
        }
    }

    pub fn ring(&self) -> &PacketRing {
        &self.ring
    }

    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    /// Stop watching the socket; the ring keeps its content.
    pub fn suspend(&self) {
        if self.active.replace(false) {
            debug!("net-source suspended");
        }
    }

    /// Start watching the socket again, optionally dropping stale frames.
    pub fn resume(&self, purge: bool) {
        if !self.active.get() {
            if purge {
                self.ring.purge();
            }
            self.active.set(true);
            debug!("net-source resumed");
        }
    }

    /// True when a frame is ready without polling.
    pub fn prepare(&self) -> bool {
        self.active.get() && self.ring.rx_ready()
    }

    /// Re-test readiness after polling.
    pub fn check(&self, revents: PollFlags) -> bool {
        if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
            warn!("net-source error condition: {:?}", revents);
        }
        self.prepare()
    }
}

/// Consumer of a ready stream.
pub trait StreamHandler: Send {
    /// Drain ready frames from `filter`.
    ///
    /// Must not block on the network. Stops early once the handler suspends
    /// the filter.
    fn dispatch(&mut self, filter: &StreamFilter);
}

enum Command {
    Resume { camera: CameraId, purge: bool },
    Suspend(CameraId),
    Stop,
}

struct ReactorShared {
    commands: Mutex<VecDeque<Command>>,
    waker: EventFd,
    running: AtomicBool,
}

/// Thread-safe control handle for a running reactor.
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<ReactorShared>,
}

impl ReactorHandle {
    fn send(&self, command: Command) {
        self.shared.commands.lock().push_back(command);
        if let Err(e) = self.shared.waker.write(1) {
            warn!("Failed to wake reactor: {}", e);
        }
    }

    /// Re-register a camera's source.
    pub fn resume(&self, camera: CameraId, purge: bool) {
        self.send(Command::Resume { camera, purge });
    }

    pub fn suspend(&self, camera: CameraId) {
        self.send(Command::Suspend(camera));
    }

    /// Make `run` return.
    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }
}

struct Source {
    filter: StreamFilter,
    handler: Box<dyn StreamHandler>,
}

/// Single-threaded event loop over the camera sources.
///
/// Each iteration runs prepare / poll / check / dispatch over the active
/// sources. Sources with a frame already waiting skip the poll wait.
pub struct Reactor {
    sources: BTreeMap<CameraId, Source>,
    shared: Arc<ReactorShared>,
}

impl Reactor {
    pub fn new() -> Result<Self> {
        let waker = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)?;
        Ok(Self {
            sources: BTreeMap::new(),
            shared: Arc::new(ReactorShared {
                commands: Mutex::new(VecDeque::new()),
                waker,
                running: AtomicBool::new(false),
            }),
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            shared: self.shared.clone(),
        }
    }

    /// Attach a (suspended) source for `camera`, replacing any previous one.
    pub fn add_source(&mut self, camera: CameraId, filter: StreamFilter, handler: Box<dyn StreamHandler>) {
        if self
            .sources
            .insert(camera, Source { filter, handler })
            .is_some()
        {
            warn!(camera = %camera, "net-source replaced");
        }
    }

    pub fn remove_source(&mut self, camera: CameraId) -> Option<StreamFilter> {
        self.sources.remove(&camera).map(|s| s.filter)
    }

    pub fn filter(&self, camera: CameraId) -> Option<&StreamFilter> {
        self.sources.get(&camera).map(|s| &s.filter)
    }

    pub fn cameras(&self) -> impl Iterator<Item = CameraId> + '_ {
        self.sources.keys().copied()
    }

    /// Apply queued commands; returns false once a stop was requested.
    fn apply_commands(&mut self) -> bool {
        let commands: Vec<Command> = self.shared.commands.lock().drain(..).collect();
        let mut keep_running = true;
        for command in commands {
            match command {
                Command::Resume { camera, purge } => match self.sources.get(&camera) {
                    Some(source) => source.filter.resume(purge),
                    None => warn!(camera = %camera, "resume for unknown source"),
                },
                Command::Suspend(camera) => {
                    if let Some(source) = self.sources.get(&camera) {
                        source.filter.suspend();
                    }
                }
                Command::Stop => keep_running = false,
            }
        }
        keep_running
    }

    /// One prepare / poll / check / dispatch cycle.
    ///
    /// Returns the number of sources dispatched, or `None` once stopped.
    pub fn run_once(&mut self, timeout: PollTimeout) -> Result<Option<usize>> {
        if !self.apply_commands() {
            return Ok(None);
        }

        let mut ready: Vec<CameraId> = self
            .sources
            .iter()
            .filter(|(_, s)| s.filter.prepare())
            .map(|(id, _)| *id)
            .collect();

        let timeout = if ready.is_empty() { timeout } else { PollTimeout::ZERO };
        let mut events: Vec<(CameraId, PollFlags)> = Vec::new();
        let mut woken = false;
        {
            let watched: Vec<(CameraId, &StreamFilter)> = self
                .sources
                .iter()
                .filter(|(_, s)| s.filter.is_active() && s.filter.ring().fd().is_some())
                .map(|(id, s)| (*id, &s.filter))
                .collect();

            let mut fds = Vec::with_capacity(watched.len() + 1);
            fds.push(PollFd::new(self.shared.waker.as_fd(), PollFlags::POLLIN));
            for (_, filter) in &watched {
                if let Some(fd) = filter.ring().fd() {
                    fds.push(PollFd::new(fd, PollFlags::POLLIN | PollFlags::POLLERR));
                }
            }

            match poll(&mut fds, timeout) {
                Ok(_) => {}
                // retried on the next cycle
                Err(Errno::EINTR) => return Ok(Some(0)),
                Err(e) => return Err(e.into()),
            }

            if let Some(revents) = fds[0].revents() {
                woken = revents.contains(PollFlags::POLLIN);
            }
            for ((id, _), fd) in watched.iter().zip(&fds[1..]) {
                if let Some(revents) = fd.revents() {
                    if !revents.is_empty() {
                        events.push((*id, revents));
                    }
                }
            }
        }

        if woken {
            // counter reset; commands are picked up next cycle
            let _ = self.shared.waker.read();
        }

        for (id, revents) in events {
            if let Some(source) = self.sources.get(&id) {
                if !ready.contains(&id) && source.filter.check(revents) {
                    ready.push(id);
                }
            }
        }

        let mut dispatched = 0;
        for id in ready {
            if let Some(source) = self.sources.get_mut(&id) {
                if source.filter.is_active() {
                    trace!(camera = %id, "dispatch");
                    source.handler.dispatch(&source.filter);
                    dispatched += 1;
                }
            }
        }
        Ok(Some(dispatched))
    }

    /// Run until [`ReactorHandle::stop`] is called.
    pub fn run(&mut self) -> Result<()> {
        self.shared.running.store(true, Ordering::Release);
        info!("Reactor started ({} sources)", self.sources.len());

        let result = loop {
            match self.run_once(PollTimeout::NONE) {
                Ok(Some(_)) => {}
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        self.shared.running.store(false, Ordering::Release);
        info!("Reactor stopped");
        result
    }
}
