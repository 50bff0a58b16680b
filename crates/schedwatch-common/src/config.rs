//! Configuration structures for the watchdog.
//!
//! The raw [`WatchConfig`] is what the CLI and the optional TOML file
//! produce. It is resolved exactly once, after the steal-time source has
//! been chosen, into an immutable [`ThresholdConfig`] that the probe loop
//! consumes.

use crate::error::{WatchError, WatchResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default maximum allowed scheduling gap in milliseconds.
pub const DEFAULT_MAX_GAP_MS: u64 = 200;

/// Upper bound for the maximum allowed gap (one hour).
pub const MAX_GAP_LIMIT_MS: u64 = 1000 * 60 * 60;

/// Steal alarm threshold used with host kernel accounting.
pub const DEFAULT_STEAL_THRESHOLD: f64 = 10.0;

/// Steal alarm threshold used with the hypervisor guest API.
pub const DEFAULT_GUEST_STEAL_THRESHOLD: f64 = 100.0;

/// Nanoseconds per millisecond.
pub const NS_PER_MS: u64 = 1_000_000;

/// Nanoseconds per second.
pub const NS_PER_SEC: u64 = 1_000_000_000;

/// Concrete steal-time source in use for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StealSourceKind {
    /// Host kernel CPU accounting (`/proc/stat`).
    Kernel,
    /// Hypervisor guest-introspection API.
    GuestLib,
}

impl StealSourceKind {
    /// Alarm threshold applied when the user did not set one.
    #[must_use]
    pub fn default_steal_threshold(self) -> f64 {
        match self {
            Self::Kernel => DEFAULT_STEAL_THRESHOLD,
            Self::GuestLib => DEFAULT_GUEST_STEAL_THRESHOLD,
        }
    }
}

impl fmt::Display for StealSourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kernel => write!(f, "kernel"),
            Self::GuestLib => write!(f, "guestlib"),
        }
    }
}

/// Requested steal-time source selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StealSourceSelection {
    /// Use the guest API when it can be opened, otherwise kernel accounting.
    #[default]
    Auto,
    /// Always use kernel accounting.
    Kernel,
    /// Require the guest API.
    GuestLib,
}

impl FromStr for StealSourceSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "kernel" => Ok(Self::Kernel),
            "guestlib" => Ok(Self::GuestLib),
            _ => Err(format!("Steal source {s} is invalid")),
        }
    }
}

/// When to move the process into the root cgroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CgroupMode {
    /// Never move.
    Off,
    /// Always move before setting the scheduler.
    On,
    /// Move only when setting the RR scheduler fails.
    #[default]
    Auto,
}

impl FromStr for CgroupMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "on" => Ok(Self::On),
            "off" => Ok(Self::Off),
            "auto" => Ok(Self::Auto),
            _ => Err(format!("Move to root cgroup mode {s} is invalid")),
        }
    }
}

/// Top-level watchdog configuration, before thresholds are frozen.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Maximum allowed scheduling gap.
    #[serde(with = "humantime_serde")]
    pub max_gap: Duration,

    /// Steal percentage alarm threshold; `None` picks the source default.
    pub steal_threshold: Option<f64>,

    /// Which steal-time source to use.
    pub steal_source: StealSourceSelection,

    /// Priority, memory locking and cgroup placement.
    pub realtime: RealtimeConfig,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            max_gap: Duration::from_millis(DEFAULT_MAX_GAP_MS),
            steal_threshold: None,
            steal_source: StealSourceSelection::Auto,
            realtime: RealtimeConfig::default(),
        }
    }
}

/// Process setup configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Switch to `SCHED_RR` at maximum priority.
    pub set_priority: bool,

    /// Lock all memory pages (mlockall).
    pub lock_memory: bool,

    /// Root cgroup placement mode.
    pub root_cgroup: CgroupMode,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            set_priority: true,
            lock_memory: true,
            root_cgroup: CgroupMode::Auto,
        }
    }
}

impl WatchConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Freeze the thresholds for the chosen steal-time source.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Config`] if the gap or threshold is out of range.
    pub fn resolve_thresholds(&self, kind: StealSourceKind) -> WatchResult<ThresholdConfig> {
        if self.max_gap.subsec_nanos() % 1_000_000 != 0 {
            return Err(WatchError::Config(format!(
                "Timeout {} is invalid (must be whole milliseconds)",
                humantime::format_duration(self.max_gap)
            )));
        }
        let max_gap_ms = u64::try_from(self.max_gap.as_millis()).unwrap_or(u64::MAX);
        let steal_threshold = self
            .steal_threshold
            .unwrap_or_else(|| kind.default_steal_threshold());

        ThresholdConfig::new(max_gap_ms, steal_threshold, kind)
    }
}

/// Thresholds frozen for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdConfig {
    max_gap_ms: u64,
    steal_threshold: f64,
    source: StealSourceKind,
}

impl ThresholdConfig {
    /// Validate and build a threshold configuration.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Config`] when `max_gap_ms` is outside
    /// `1..=3_600_000` or the steal threshold is outside `1..=u32::MAX`.
    pub fn new(max_gap_ms: u64, steal_threshold: f64, source: StealSourceKind) -> WatchResult<Self> {
        if !(1..=MAX_GAP_LIMIT_MS).contains(&max_gap_ms) {
            return Err(WatchError::Config(format!("Timeout {max_gap_ms} is invalid")));
        }
        if !(1.0..=f64::from(u32::MAX)).contains(&steal_threshold) {
            return Err(WatchError::Config(format!(
                "Steal percent threshold {steal_threshold} is invalid"
            )));
        }

        Ok(Self {
            max_gap_ms,
            steal_threshold,
            source,
        })
    }

    /// Maximum allowed gap in milliseconds.
    #[must_use]
    pub fn max_gap_ms(&self) -> u64 {
        self.max_gap_ms
    }

    /// Maximum allowed gap in nanoseconds.
    #[must_use]
    pub fn max_gap_ns(&self) -> u64 {
        self.max_gap_ms * NS_PER_MS
    }

    /// Steal percentage above which an overrun is blamed on the host.
    #[must_use]
    pub fn steal_threshold(&self) -> f64 {
        self.steal_threshold
    }

    /// Steal-time source these thresholds were resolved for.
    #[must_use]
    pub fn source(&self) -> StealSourceKind {
        self.source
    }

    /// Poll quantum: one third of the maximum gap, in milliseconds.
    #[must_use]
    pub fn poll_timeout_ms(&self) -> i32 {
        i32::try_from(self.max_gap_ms / 3).unwrap_or(i32::MAX)
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
