//! jailer: quarantine running processes and their descendants
//! Network and CPU jails built on cgroup v1/v2, with packet filter rules for the network jail

pub mod cgroup;
pub mod cli;
pub mod firewall;
pub mod jailer;
pub mod process;
pub mod reconcile;
pub mod registry;
pub mod shutdown;
pub mod types;

pub use jailer::Jailer;
pub use types::{JailError, JailType, JailerConfig, RestrictionSet, Result};
