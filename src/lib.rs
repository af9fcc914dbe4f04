//! GPIO access over the Linux sysfs interface.
//!
//! [`PinController`] exports lines, configures them and owns their open
//! `value` files. Edge interrupts are picked up by an [`EdgePoller`] running
//! on its own thread and handed back as batches of watch tokens, so pin callbacks
//! always run on the thread that owns the controller.

mod backend;
mod config;
mod error;
mod gpio;
mod pin;
mod sysfs;

pub use backend::{EpollEdgePoller, MockEdgePoller};
pub use config::{
    AppConfig, DEFAULT_POLL_TIMEOUT_MS, Direction, EdgeDetect, PinConfig, SysfsConfig,
};
pub use error::GpioError;
pub use gpio::{EdgePoller, PinController, PollEvent, Pollable, WatchToken};
pub use pin::{EdgeCallback, Pin};
pub use sysfs::{DEFAULT_SYSFS_GPIO_ROOT, SysfsPaths};

/// Controller backed by the kernel's epoll.
pub type SysfsGpioController = PinController<EpollEdgePoller>;
