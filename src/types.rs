/// Core types and structures for the jailer system
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// A single quarantine dimension that can be applied to a process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JailType {
    /// All inbound and outbound traffic is dropped
    Network,
    /// Throttled to 1% of one core
    Cpu,
}

impl JailType {
    pub const ALL: [JailType; 2] = [JailType::Network, JailType::Cpu];

    pub fn as_str(&self) -> &'static str {
        match self {
            JailType::Network => "network",
            JailType::Cpu => "cpu",
        }
    }

    fn bit(self) -> u8 {
        match self {
            JailType::Network => 0b01,
            JailType::Cpu => 0b10,
        }
    }
}

impl fmt::Display for JailType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JailType {
    type Err = JailError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "network" | "n" => Ok(JailType::Network),
            "cpu" | "c" => Ok(JailType::Cpu),
            other => Err(JailError::UnsupportedJailType(other.to_string())),
        }
    }
}

/// Set of jail types currently applied to a process.
///
/// The value decides which physical cgroup path(s) the process lives in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RestrictionSet(u8);

impl RestrictionSet {
    pub const EMPTY: RestrictionSet = RestrictionSet(0);
    pub const NETWORK: RestrictionSet = RestrictionSet(0b01);
    pub const CPU: RestrictionSet = RestrictionSet(0b10);
    pub const BOTH: RestrictionSet = RestrictionSet(0b11);

    pub fn single(kind: JailType) -> Self {
        RestrictionSet(kind.bit())
    }

    pub fn contains(&self, kind: JailType) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn with(self, kind: JailType) -> Self {
        RestrictionSet(self.0 | kind.bit())
    }

    pub fn without(self, kind: JailType) -> Self {
        RestrictionSet(self.0 & !kind.bit())
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = JailType> {
        let set = *self;
        JailType::ALL
            .into_iter()
            .filter(move |kind| set.contains(*kind))
    }
}

impl fmt::Display for RestrictionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<&str> = self.iter().map(|kind| kind.as_str()).collect();
        f.write_str(&names.join(","))
    }
}

/// Which packet filter realises the network jail
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FirewallChoice {
    /// Probe nftables first, then iptables
    Auto,
    Nftables,
    Iptables,
    /// Install no rules (cgroup confinement only)
    None,
}

/// Jailer runtime configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct JailerConfig {
    /// Mount point of the cgroup filesystem
    pub cgroup_root: PathBuf,
    /// Mount point of procfs
    pub proc_root: PathBuf,
    /// Packet filter used for the network jail
    pub firewall: FirewallChoice,
    /// Period of the background reconciliation sweep (disabled when unset)
    pub sweep_interval_secs: Option<u64>,
    /// Refuse to start unless running as root
    pub require_root: bool,
}

impl Default for JailerConfig {
    fn default() -> Self {
        Self {
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            proc_root: PathBuf::from("/proc"),
            firewall: FirewallChoice::Auto,
            sweep_interval_secs: None,
            require_root: true,
        }
    }
}

impl JailerConfig {
    /// Load a configuration file; missing keys keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            JailError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: JailerConfig = serde_json::from_str(&content).map_err(|e| {
            JailError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval_secs == Some(0) {
            return Err(JailError::Config(
                "sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_secs.map(Duration::from_secs)
    }
}

/// Custom error types for jailer
#[derive(Error, Debug)]
pub enum JailError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Process table lookup failed: {0}")]
    Lookup(String),

    #[error("Failed to move PID {pid} into {}: {cause}", .path.display())]
    Move { pid: u32, path: PathBuf, cause: String },

    #[error("PID {pid} only partially moved, hierarchy {} failed: {cause}", .path.display())]
    PartialMove { pid: u32, path: PathBuf, cause: String },

    #[error("Failed to restore PID {pid} into {}: {cause}", .path.display())]
    Restore { pid: u32, path: PathBuf, cause: String },

    #[error("Process {0} is not jailed")]
    NotJailed(u32),

    #[error("Process {pid} is not jailed with {kind} jail")]
    NotJailedWith { pid: u32, kind: JailType },

    #[error("Process {pid} is already jailed with {kind} jail")]
    AlreadyJailed { pid: u32, kind: JailType },

    #[error("Unsupported jail type: {0} (only 'network' and 'cpu' are supported)")]
    UnsupportedJailType(String),

    #[error("Invalid PID: {0}")]
    InvalidPid(String),

    #[error("Process {pid} is not accessible: {reason}")]
    ProcessInaccessible { pid: u32, reason: String },

    #[error("Cannot determine original cgroup of PID {pid}: {reason}")]
    OriginalLocation { pid: u32, reason: String },

    #[error("Firewall error: {0}")]
    Firewall(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("usage: {0}")]
    Usage(String),

    #[error("Jailer is shutting down")]
    ShuttingDown,
}

/// Result type alias for jailer operations
pub type Result<T> = std::result::Result<T, JailError>;

/// Parse a user-supplied process identifier
pub fn parse_pid(raw: &str) -> Result<u32> {
    match raw.trim().parse::<u32>() {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(JailError::InvalidPid(raw.to_string())),
    }
}
