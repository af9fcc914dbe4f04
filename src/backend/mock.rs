use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::GpioError;
use crate::gpio::{EdgePoller, PollEvent, Pollable, WatchToken};

/// Poller without a kernel behind it. Edges are injected by the caller and
/// travel over the same channel the epoll poller uses.
pub struct MockEdgePoller {
    running: Arc<AtomicBool>,
    ready_tx: UnboundedSender<PollEvent>,
    state: Mutex<MockPollerState>,
}

#[derive(Default)]
struct MockPollerState {
    registered: FxHashMap<RawFd, WatchToken>,
    registrations: usize,
    reject_registrations: bool,
    stopped: bool,
}

impl MockEdgePoller {
    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.state.lock().registered.contains_key(&fd)
    }

    pub fn registered(&self) -> Vec<RawFd> {
        let mut fds: Vec<RawFd> = self.state.lock().registered.keys().copied().collect();
        fds.sort_unstable();
        fds
    }

    /// Total successful `register` calls, including re-registrations.
    pub fn registrations(&self) -> usize {
        self.state.lock().registrations
    }

    /// Makes every following `register` call fail until switched back.
    pub fn set_reject_registrations(&self, reject: bool) {
        self.state.lock().reject_registrations = reject;
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Queues an edge batch for whichever of `fds` are registered, the way
    /// the kernel only wakes watched descriptors. Returns false if nothing
    /// was queued.
    pub fn simulate_edges(&self, fds: &[RawFd]) -> bool {
        let state = self.state.lock();
        if state.stopped || !self.running.load(Ordering::Acquire) {
            return false;
        }

        let ready: Vec<WatchToken> = fds
            .iter()
            .filter_map(|fd| state.registered.get(fd).copied())
            .collect();
        if ready.is_empty() {
            return false;
        }
        self.ready_tx.send(PollEvent::Ready(ready)).is_ok()
    }

    pub fn simulate_edge(&self, fd: RawFd) -> bool {
        self.simulate_edges(&[fd])
    }

    /// Reports a fatal wait error and stops, as the epoll loop does.
    pub fn simulate_failure(&self, reason: &str) {
        let mut state = self.state.lock();
        if !state.stopped {
            state.stopped = true;
            let _ = self.ready_tx.send(PollEvent::Failed(reason.to_string()));
        }
    }
}

impl EdgePoller for MockEdgePoller {
    fn start(
        running: Arc<AtomicBool>,
        ready_tx: UnboundedSender<PollEvent>,
        _timeout: Duration,
    ) -> Result<Self, GpioError> {
        Ok(Self {
            running,
            ready_tx,
            state: Mutex::new(MockPollerState::default()),
        })
    }

    fn register(&self, source: &dyn Pollable, token: WatchToken) -> Result<(), GpioError> {
        let fd = source.descriptor().as_raw_fd();
        let mut state = self.state.lock();
        if state.reject_registrations {
            return Err(GpioError::Io(format!("fd {fd} registration refused")));
        }
        if state.registered.contains_key(&fd) {
            return Err(GpioError::Io(format!("fd {fd} already registered")));
        }
        state.registered.insert(fd, token);
        state.registrations += 1;
        Ok(())
    }

    fn unregister(&self, source: &dyn Pollable) -> Result<(), GpioError> {
        let fd = source.descriptor().as_raw_fd();
        if self.state.lock().registered.remove(&fd).is_none() {
            return Err(GpioError::Io(format!("fd {fd} not registered")));
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.state.lock().stopped = true;
    }
}
