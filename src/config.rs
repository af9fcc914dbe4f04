use std::{collections::HashSet, fmt, fs, path::Path, path::PathBuf, str::FromStr};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::GpioError;
use crate::sysfs::DEFAULT_SYSFS_GPIO_ROOT;

pub const DEFAULT_POLL_TIMEOUT_MS: u16 = 100;

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    #[serde(rename = "in")]
    Input,
    #[serde(rename = "out")]
    Output,
}

impl Direction {
    pub fn as_sysfs(&self) -> &'static str {
        match self {
            Direction::Input => "in",
            Direction::Output => "out",
        }
    }
}

impl FromStr for Direction {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(Direction::Input),
            "out" => Ok(Direction::Output),
            other => Err(GpioError::Config(format!(
                "Pin direction {other:?} not in [\"in\", \"out\"]"
            ))),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sysfs())
    }
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeDetect {
    Rising,
    Falling,
    Both,
}

impl EdgeDetect {
    pub fn as_sysfs(&self) -> &'static str {
        match self {
            EdgeDetect::Rising => "rising",
            EdgeDetect::Falling => "falling",
            EdgeDetect::Both => "both",
        }
    }
}

impl FromStr for EdgeDetect {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rising" => Ok(EdgeDetect::Rising),
            "falling" => Ok(EdgeDetect::Falling),
            "both" => Ok(EdgeDetect::Both),
            other => Err(GpioError::Config(format!(
                "Pin edge {other:?} not in [\"rising\", \"falling\", \"both\"]"
            ))),
        }
    }
}

impl fmt::Display for EdgeDetect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sysfs())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SysfsConfig {
    #[serde(default = "default_sysfs_root")]
    pub root: PathBuf,
    pub available: HashSet<u32>,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u16,
}

impl SysfsConfig {
    pub fn new<I: IntoIterator<Item = u32>>(root: impl Into<PathBuf>, available: I) -> Self {
        Self {
            root: root.into(),
            available: available.into_iter().collect(),
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
        }
    }
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from(DEFAULT_SYSFS_GPIO_ROOT)
}

fn default_poll_timeout_ms() -> u16 {
    DEFAULT_POLL_TIMEOUT_MS
}

/// A pin the application allocates at start-up.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PinConfig {
    pub name: Option<String>,
    pub direction: Direction,
    pub edge: Option<EdgeDetect>,
    #[serde(default)]
    pub active_low: u8,
    pub initial_level: Option<bool>,
}

impl PinConfig {
    /// Only `0` and `1` are accepted, matching what the kernel's
    /// `active_low` attribute understands.
    pub fn active_low(&self) -> Result<bool, GpioError> {
        match self.active_low {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(GpioError::Config(format!(
                "active_low must be 0 or 1, got {other}"
            ))),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub sysfs: SysfsConfig,
    #[serde(default)]
    pub gpios: FxHashMap<u32, PinConfig>,
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GpioError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| GpioError::Config(format!("Failed to read config: {e}")))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, GpioError> {
        let config: AppConfig = serde_json::from_str(contents)
            .map_err(|e| GpioError::Config(format!("Invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), GpioError> {
        for (number, pin) in &self.gpios {
            if !self.sysfs.available.contains(number) {
                return Err(GpioError::Config(format!(
                    "Pin {number} configured but not listed as available"
                )));
            }
            pin.active_low()?;
            if pin.initial_level.is_some() && pin.direction == Direction::Input {
                return Err(GpioError::Config(format!(
                    "Pin {number} is an input and cannot have an initial level"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"
        {
            "sysfs": {
                "root": "/tmp/fake-gpio",
                "available": [17, 27]
            },
            "gpios": {
                "17": { "name": "LED", "direction": "out", "initial_level": true },
                "27": { "name": "BUTTON", "direction": "in", "edge": "both", "active_low": 1 }
            }
        }
        "#
    }

    #[test]
    fn parses_sample_config() {
        let cfg = AppConfig::from_json(sample_json()).unwrap();
        assert_eq!(cfg.sysfs.root, PathBuf::from("/tmp/fake-gpio"));
        assert_eq!(cfg.sysfs.poll_timeout_ms, DEFAULT_POLL_TIMEOUT_MS);
        assert!(cfg.sysfs.available.contains(&17));

        let led = &cfg.gpios[&17];
        assert_eq!(led.direction, Direction::Output);
        assert_eq!(led.edge, None);
        assert!(!led.active_low().unwrap());

        let button = &cfg.gpios[&27];
        assert_eq!(button.direction, Direction::Input);
        assert_eq!(button.edge, Some(EdgeDetect::Both));
        assert!(button.active_low().unwrap());
    }

    #[test]
    fn root_defaults_to_kernel_path() {
        let cfg = AppConfig::from_json(r#"{ "sysfs": { "available": [4] } }"#).unwrap();
        assert_eq!(cfg.sysfs.root, PathBuf::from("/sys/class/gpio"));
        assert!(cfg.gpios.is_empty());
    }

    #[test]
    fn rejects_unknown_direction_and_edge() {
        let bad_direction = r#"{ "sysfs": { "available": [4] },
            "gpios": { "4": { "direction": "sideways" } } }"#;
        assert!(matches!(
            AppConfig::from_json(bad_direction),
            Err(GpioError::Config(_))
        ));

        let bad_edge = r#"{ "sysfs": { "available": [4] },
            "gpios": { "4": { "direction": "in", "edge": "level" } } }"#;
        assert!(matches!(
            AppConfig::from_json(bad_edge),
            Err(GpioError::Config(_))
        ));
    }

    #[test]
    fn rejects_active_low_outside_zero_one() {
        let json = r#"{ "sysfs": { "available": [4] },
            "gpios": { "4": { "direction": "out", "active_low": 2 } } }"#;
        let err = AppConfig::from_json(json).unwrap_err();
        assert!(err.to_string().contains("active_low"));
    }

    #[test]
    fn rejects_pins_outside_available_set() {
        let json = r#"{ "sysfs": { "available": [4] },
            "gpios": { "5": { "direction": "out" } } }"#;
        assert!(matches!(
            AppConfig::from_json(json),
            Err(GpioError::Config(_))
        ));
    }

    #[test]
    fn direction_and_edge_from_str() {
        assert_eq!("in".parse::<Direction>().unwrap(), Direction::Input);
        assert_eq!("out".parse::<Direction>().unwrap(), Direction::Output);
        assert!("IN".parse::<Direction>().is_err());
        assert_eq!("falling".parse::<EdgeDetect>().unwrap(), EdgeDetect::Falling);
        assert!("none".parse::<EdgeDetect>().is_err());
        assert_eq!(EdgeDetect::Both.to_string(), "both");
    }
}
