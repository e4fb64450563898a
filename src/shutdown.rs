/// Orderly teardown: release every jail, drop filter rules, reclaim cgroups
use crate::cgroup::CgroupBackend;
use crate::firewall::NetworkFilter;
use crate::jailer::Jailer;
use crate::process::ProcessExplorer;
use crate::registry::Registry;
use crate::types::Result;
use nix::sys::signal::{SigSet, Signal};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Signals that trigger a graceful shutdown
pub const TERMINATION_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP];

/// What the teardown did
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Root pids whose record was released
    pub released: Vec<u32>,
    /// Restore failures, roots and children alike
    pub restore_failures: Vec<(u32, String)>,
    pub filter_error: Option<String>,
    /// Jail directories removed
    pub reclaimed: Vec<PathBuf>,
    /// Jail directories left behind, still occupied or not removable
    pub kept: Vec<PathBuf>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.restore_failures.is_empty() && self.filter_error.is_none()
    }
}

impl fmt::Display for ShutdownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Released {} jailed processes, removed {} jail cgroups",
            self.released.len(),
            self.reclaimed.len()
        )?;
        if !self.kept.is_empty() {
            write!(f, ", kept {} still in use", self.kept.len())?;
        }
        if !self.restore_failures.is_empty() {
            write!(f, ", {} processes could not be restored", self.restore_failures.len())?;
        }
        if let Some(error) = &self.filter_error {
            write!(f, ", firewall cleanup failed: {}", error)?;
        }
        Ok(())
    }
}

/// Release every record, then remove filter rules, then reclaim empty jails.
///
/// Each step is warn-and-continue so one failure never stops the rest.
pub fn run_teardown(
    registry: &mut Registry,
    backend: &CgroupBackend,
    explorer: &ProcessExplorer,
    filter: &mut dyn NetworkFilter,
) -> ShutdownReport {
    let mut report = ShutdownReport::default();
    log::info!("Starting cleanup of {} jailed processes...", registry.len());

    for pid in registry.pids() {
        match registry.unjail(backend, explorer, pid) {
            Ok(transition) => {
                if let Some(error) = transition.root_error {
                    if explorer.exists(pid) {
                        report.restore_failures.push((pid, error));
                    }
                }
                for (child, error) in transition.children.failed {
                    report.restore_failures.push((child, error.to_string()));
                }
                report.released.push(pid);
            }
            Err(e) => log::warn!("Failed to release process {}: {}", pid, e),
        }
    }

    if let Err(e) = filter.teardown() {
        log::warn!("Failed to clean up {} rules: {}", filter.name(), e);
        report.filter_error = Some(e.to_string());
    }

    for path in backend.topology().all_paths() {
        match backend.reclaim_if_empty(&path) {
            Ok(true) => {
                log::info!("Removed cgroup {}", path.display());
                report.reclaimed.push(path);
            }
            Ok(false) => report.kept.push(path),
            Err(e) => {
                log::warn!("{}", e);
                report.kept.push(path);
            }
        }
    }

    log::info!("Cleanup completed");
    report
}

/// Block the termination signals on the calling thread.
///
/// Must run before any other thread is spawned so every thread inherits the
/// mask and only the listener ever receives them.
pub fn block_termination_signals() -> Result<SigSet> {
    let mut mask = SigSet::empty();
    for signal in TERMINATION_SIGNALS {
        mask.add(signal);
    }
    mask.thread_block().map_err(io::Error::from)?;
    Ok(mask)
}

/// Wait for a termination signal, tear down and exit the process
pub fn spawn_signal_listener(mask: SigSet, jailer: Arc<Jailer>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("jailer-signals".to_string())
        .spawn(move || {
            let signal = match mask.wait() {
                Ok(signal) => signal,
                Err(e) => {
                    log::warn!("Signal listener failed: {}", e);
                    return;
                }
            };
            println!("\nReceived {}, cleaning up...", signal);
            if let Some(report) = jailer.shutdown() {
                println!("{}", report);
            }
            std::process::exit(0);
        })
}
