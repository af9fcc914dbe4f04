//! Kernel sysfs GPIO file layout.
//!
//! Every control file lives under a single root, `/sys/class/gpio` on a real
//! system. The root is configurable so the same layout can be laid out in a
//! scratch directory.

use std::path::PathBuf;

pub const DEFAULT_SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

pub const VALUE_HIGH: &str = "1";
pub const VALUE_LOW: &str = "0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysfsPaths {
    root: PathBuf,
}

impl SysfsPaths {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn export(&self) -> PathBuf {
        self.root.join("export")
    }

    pub fn unexport(&self) -> PathBuf {
        self.root.join("unexport")
    }

    /// Directory the kernel creates once the line is exported.
    pub fn line_dir(&self, number: u32) -> PathBuf {
        self.root.join(format!("gpio{number}"))
    }

    pub fn direction(&self, number: u32) -> PathBuf {
        self.line_dir(number).join("direction")
    }

    pub fn edge(&self, number: u32) -> PathBuf {
        self.line_dir(number).join("edge")
    }

    pub fn active_low(&self, number: u32) -> PathBuf {
        self.line_dir(number).join("active_low")
    }

    pub fn value(&self, number: u32) -> PathBuf {
        self.line_dir(number).join("value")
    }

    pub fn is_exported(&self, number: u32) -> bool {
        self.line_dir(number).is_dir()
    }
}

impl Default for SysfsPaths {
    fn default() -> Self {
        Self::new(DEFAULT_SYSFS_GPIO_ROOT)
    }
}
