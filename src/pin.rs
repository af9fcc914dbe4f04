use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Seek, Write};
use std::os::fd::{AsFd, BorrowedFd};

use crate::config::{Direction, EdgeDetect};
use crate::error::GpioError;
use crate::gpio::Pollable;
use crate::sysfs::{SysfsPaths, VALUE_HIGH, VALUE_LOW};

/// Invoked on the consumer thread with `(pin_number, new_level)`.
pub type EdgeCallback = Box<dyn FnMut(u32, u8)>;

/// An exported GPIO line together with its open `value` file.
pub struct Pin {
    number: u32,
    direction: Direction,
    edge: Option<EdgeDetect>,
    active_low: bool,
    callback: Option<EdgeCallback>,
    value: File,
}

impl Pin {
    /// Configures an already exported line and opens its value file.
    ///
    /// A callback needs an edge to fire on. Each attribute write fails fast;
    /// nothing is rolled back if a later write fails.
    pub fn new(
        paths: &SysfsPaths,
        number: u32,
        direction: Direction,
        callback: Option<EdgeCallback>,
        edge: Option<EdgeDetect>,
        active_low: bool,
    ) -> Result<Self, GpioError> {
        if callback.is_some() && edge.is_none() {
            return Err(GpioError::Config(format!(
                "pin {number}: an interrupt edge is required to trigger a callback"
            )));
        }

        let value_path = paths.value(number);
        let value = File::options()
            .read(true)
            .write(true)
            .open(&value_path)
            .map_err(|e| GpioError::Io(format!("open {}: {e}", value_path.display())))?;

        write_attribute(&paths.direction(number), direction.as_sysfs())?;
        if let Some(edge) = edge {
            write_attribute(&paths.edge(number), edge.as_sysfs())?;
        }
        if active_low {
            write_attribute(&paths.active_low(number), VALUE_HIGH)?;
        }

        Ok(Self {
            number,
            direction,
            edge,
            active_low,
            callback,
            value,
        })
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn edge(&self) -> Option<EdgeDetect> {
        self.edge
    }

    pub fn active_low(&self) -> bool {
        self.active_low
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    pub fn set_callback(&mut self, callback: EdgeCallback) {
        self.callback = Some(callback);
    }

    pub fn clear_callback(&mut self) {
        self.callback = None;
    }

    pub fn set_high(&mut self) -> Result<(), GpioError> {
        self.write_value(VALUE_HIGH)
    }

    pub fn set_low(&mut self) -> Result<(), GpioError> {
        self.write_value(VALUE_LOW)
    }

    pub fn set_level(&mut self, high: bool) -> Result<(), GpioError> {
        if high { self.set_high() } else { self.set_low() }
    }

    /// Reads the raw level the kernel reports. The cursor is rewound even
    /// when the read or the parse fails.
    pub fn read_level(&mut self) -> Result<u8, GpioError> {
        let mut raw = String::new();
        let read = self.value.read_to_string(&mut raw);
        self.rewind()?;
        read.map_err(|e| GpioError::Io(format!("read value of pin {}: {e}", self.number)))?;

        raw.trim().parse::<u8>().map_err(|e| {
            GpioError::Io(format!(
                "malformed value {raw:?} for pin {}: {e}",
                self.number
            ))
        })
    }

    /// Runs the callback, if any. Panics inside the callback are not caught.
    pub fn notify(&mut self, level: u8) {
        if let Some(callback) = self.callback.as_mut() {
            callback(self.number, level);
        }
    }

    fn write_value(&mut self, token: &str) -> Result<(), GpioError> {
        self.value
            .write_all(token.as_bytes())
            .map_err(|e| GpioError::Io(format!("write value of pin {}: {e}", self.number)))?;
        self.rewind()
    }

    fn rewind(&mut self) -> Result<(), GpioError> {
        self.value
            .rewind()
            .map_err(|e| GpioError::Io(format!("seek value of pin {}: {e}", self.number)))
    }
}

impl Pollable for Pin {
    fn descriptor(&self) -> BorrowedFd<'_> {
        self.value.as_fd()
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pin")
            .field("number", &self.number)
            .field("direction", &self.direction)
            .field("edge", &self.edge)
            .field("active_low", &self.active_low)
            .field("has_callback", &self.callback.is_some())
            .field("value", &self.value)
            .finish()
    }
}

fn write_attribute(path: &std::path::Path, token: &str) -> Result<(), GpioError> {
    fs::write(path, token).map_err(|e| GpioError::Io(format!("write {}: {e}", path.display())))
}
