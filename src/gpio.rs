use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};

use crate::config::{Direction, EdgeDetect, SysfsConfig};
use crate::error::GpioError;
use crate::pin::{EdgeCallback, Pin};
use crate::sysfs::SysfsPaths;

/// Something a readiness poller can wait on.
pub trait Pollable {
    fn descriptor(&self) -> BorrowedFd<'_>;
}

/// Identifies one registration of a descriptor with the poller. A fresh
/// token is issued on every registration, so edges queued for an earlier
/// registration never match a later one, even when the fd number is reused.
pub type WatchToken = u64;

/// Message from the poller to the consumer thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEvent {
    /// Registrations that reported an edge during one wake-up.
    Ready(Vec<WatchToken>),
    /// The wait loop hit an unrecoverable error and exited.
    Failed(String),
}

/// Background edge watcher. Implementations only observe readiness and
/// forward it over `ready_tx`; they never touch pins.
pub trait EdgePoller: Sized {
    fn start(
        running: Arc<AtomicBool>,
        ready_tx: UnboundedSender<PollEvent>,
        timeout: Duration,
    ) -> Result<Self, GpioError>;
    fn register(&self, source: &dyn Pollable, token: WatchToken) -> Result<(), GpioError>;
    fn unregister(&self, source: &dyn Pollable) -> Result<(), GpioError>;
    fn stop(&mut self);
}

/// Registry of allocated sysfs GPIO lines.
///
/// Owned by the application's consumer thread: every allocation, level
/// access and callback happens there. The poller runs on its own thread and
/// reaches the registry only through the ready-batch channel drained by
/// [`PinController::dispatch_pending`] or [`PinController::process_next_event`].
pub struct PinController<P: EdgePoller> {
    paths: SysfsPaths,
    available: FxHashSet<u32>,
    allocated: FxHashMap<u32, Pin>,
    watches: FxHashMap<WatchToken, u32>,
    next_token: WatchToken,
    running: Arc<AtomicBool>,
    poller: P,
    ready_rx: UnboundedReceiver<PollEvent>,
    poller_failed: bool,
}

impl<P: EdgePoller> PinController<P> {
    pub fn new(config: &SysfsConfig) -> Result<Self, GpioError> {
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let timeout = Duration::from_millis(u64::from(config.poll_timeout_ms));
        let poller = P::start(running.clone(), ready_tx, timeout)?;

        info!(
            "GPIO controller started on {} with {} available pins",
            config.root.display(),
            config.available.len()
        );

        Ok(Self {
            paths: SysfsPaths::new(config.root.clone()),
            available: config.available.iter().copied().collect(),
            allocated: FxHashMap::default(),
            watches: FxHashMap::default(),
            next_token: 0,
            running,
            poller,
            ready_rx,
            poller_failed: false,
        })
    }

    pub fn poller(&self) -> &P {
        &self.poller
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// True once the poller reported a fatal error; edge callbacks no longer fire.
    pub fn poller_failed(&self) -> bool {
        self.poller_failed
    }

    pub fn available(&self) -> &FxHashSet<u32> {
        &self.available
    }

    /// Replaces the set of usable pin numbers. Refused if it would strand an
    /// allocated pin.
    pub fn set_available<I: IntoIterator<Item = u32>>(
        &mut self,
        pins: I,
    ) -> Result<(), GpioError> {
        let available: FxHashSet<u32> = pins.into_iter().collect();
        if let Some(stranded) = self.allocated.keys().find(|n| !available.contains(n)) {
            return Err(GpioError::Config(format!(
                "pin {stranded} is allocated and must stay available"
            )));
        }
        self.available = available;
        Ok(())
    }

    pub fn is_allocated(&self, number: u32) -> bool {
        self.allocated.contains_key(&number)
    }

    pub fn allocated_pins(&self) -> Vec<u32> {
        let mut pins: Vec<u32> = self.allocated.keys().copied().collect();
        pins.sort_unstable();
        pins
    }

    pub fn allocate(
        &mut self,
        number: u32,
        direction: Direction,
        callback: Option<EdgeCallback>,
        edge: Option<EdgeDetect>,
        active_low: bool,
    ) -> Result<&mut Pin, GpioError> {
        debug!(
            "allocate({number}, {direction}, callback: {}, edge: {edge:?}, active_low: {active_low})",
            callback.is_some()
        );

        if !self.is_running() {
            return Err(GpioError::ShutDown);
        }
        if !self.available.contains(&number) {
            return Err(GpioError::Range(number));
        }
        if self.allocated.contains_key(&number) {
            return Err(GpioError::AlreadyAllocated(number));
        }
        if callback.is_some() && edge.is_none() {
            return Err(GpioError::Config(format!(
                "pin {number}: a callback requires one of rising, falling or both edges"
            )));
        }

        self.export(number)?;

        let pin = Pin::new(&self.paths, number, direction, callback, edge, active_low)?;
        if direction == Direction::Input {
            let token = self.issue_token();
            self.poller.register(&pin, token)?;
            self.watches.insert(token, number);
        }

        Ok(self.allocated.entry(number).or_insert(pin))
    }

    /// Releases a pin. The registry entry is gone even when the unexport
    /// write fails; that failure is still returned.
    pub fn deallocate(&mut self, number: u32) -> Result<(), GpioError> {
        debug!("deallocate({number})");

        let pin = self
            .allocated
            .remove(&number)
            .ok_or(GpioError::NotAllocated(number))?;

        if pin.direction() == Direction::Input {
            self.watches.retain(|_, watched| *watched != number);
            if let Err(e) = self.poller.unregister(&pin) {
                warn!("unregister pin {number} from poller: {e}");
            }
        }

        let unexported = write_line_number(&self.paths.unexport(), number);
        drop(pin);
        unexported
    }

    pub fn get(&self, number: u32) -> Result<&Pin, GpioError> {
        debug!("get({number})");
        self.allocated
            .get(&number)
            .ok_or(GpioError::NotAllocated(number))
    }

    pub fn get_mut(&mut self, number: u32) -> Result<&mut Pin, GpioError> {
        self.allocated
            .get_mut(&number)
            .ok_or(GpioError::NotAllocated(number))
    }

    pub fn set_callback(&mut self, number: u32, callback: EdgeCallback) -> Result<(), GpioError> {
        self.get_mut(number)?.set_callback(callback);
        Ok(())
    }

    pub fn set_level(&mut self, number: u32, high: bool) -> Result<(), GpioError> {
        debug!("set_level({number}, {high})");
        self.get_mut(number)?.set_level(high)
    }

    /// Reads the level synchronously. Input pins are taken off the poller for
    /// the duration of the read so a concurrent wake cannot observe it.
    pub fn read_level(&mut self, number: u32) -> Result<bool, GpioError> {
        debug!("read_level({number})");

        let token = self.issue_token();
        let pin = self
            .allocated
            .get_mut(&number)
            .ok_or(GpioError::NotAllocated(number))?;

        if pin.direction() == Direction::Output {
            return Ok(pin.read_level()? > 0);
        }

        // A pin left unwatched by an earlier failed read is re-watched below.
        match self.poller.unregister(&*pin) {
            Ok(()) => self.watches.retain(|_, watched| *watched != number),
            Err(e) => warn!("unregister pin {number} before read: {e}"),
        }
        let level = pin.read_level();
        if let Err(e) = self.poller.register(&*pin, token) {
            warn!("re-register pin {number} with poller, its edges are lost: {e}");
            return Err(e);
        }
        self.watches.insert(token, number);

        Ok(level? > 0)
    }

    /// Routes one batch of ready registrations to their pins' callbacks.
    /// Tokens from a registration that has since been dropped are skipped.
    /// Returns how many pins were notified.
    pub fn dispatch(&mut self, ready: &[WatchToken]) -> usize {
        let mut notified = 0;
        for token in ready {
            let Some(pin) = self
                .watches
                .get(token)
                .and_then(|number| self.allocated.get_mut(number))
            else {
                debug!("edge for stale watch {token}, skipping");
                continue;
            };

            match pin.read_level() {
                Ok(level) => {
                    pin.notify(level);
                    notified += 1;
                }
                Err(e) => warn!("read after edge on pin {}: {e}", pin.number()),
            }
        }
        notified
    }

    /// Dispatches every batch already queued by the poller without blocking.
    pub fn dispatch_pending(&mut self) -> Result<usize, GpioError> {
        let mut notified = 0;
        loop {
            match self.ready_rx.try_recv() {
                Ok(event) => notified += self.handle_event(event)?,
                Err(TryRecvError::Empty) => return Ok(notified),
                Err(TryRecvError::Disconnected) => return self.poller_gone(notified),
            }
        }
    }

    /// Waits for the next poller message and dispatches it.
    pub async fn process_next_event(&mut self) -> Result<usize, GpioError> {
        match self.ready_rx.recv().await {
            Some(event) => self.handle_event(event),
            None => self.poller_gone(0),
        }
    }

    /// Marks the controller stopped, releases every pin and stops the poller.
    /// Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("Shutting down GPIO controller");
        }

        for number in self.allocated_pins() {
            if let Err(e) = self.deallocate(number) {
                warn!("deallocate pin {number} during shutdown: {e}");
            }
        }

        self.poller.stop();
    }

    fn handle_event(&mut self, event: PollEvent) -> Result<usize, GpioError> {
        match event {
            PollEvent::Ready(ready) => Ok(self.dispatch(&ready)),
            PollEvent::Failed(reason) => {
                self.poller_failed = true;
                Err(GpioError::PollerStopped(reason))
            }
        }
    }

    fn poller_gone(&mut self, notified: usize) -> Result<usize, GpioError> {
        if self.is_running() {
            self.poller_failed = true;
            return Err(GpioError::PollerStopped("event channel closed".into()));
        }
        Ok(notified)
    }

    fn issue_token(&mut self) -> WatchToken {
        self.next_token += 1;
        self.next_token
    }

    fn export(&self, number: u32) -> Result<(), GpioError> {
        if self.paths.is_exported(number) {
            // Another owner may be holding this line; it is reused as is.
            debug!("pin {number} already exported");
            return Ok(());
        }
        write_line_number(&self.paths.export(), number)
    }
}

impl<P: EdgePoller> Drop for PinController<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn write_line_number(path: &std::path::Path, number: u32) -> Result<(), GpioError> {
    std::fs::write(path, number.to_string())
        .map_err(|e| GpioError::Io(format!("write {number} to {}: {e}", path.display())))
}
