/// Reconciliation of jail records against the live process table
use crate::cgroup::CgroupBackend;
use crate::jailer::Jailer;
use crate::process::ProcessExplorer;
use crate::registry::{restore_many, Registry};
use crate::types::JailError;
use std::io;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// What a sweep removed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Roots whose record was dropped because the process exited
    pub removed_roots: Vec<u32>,
    /// Dead children pruned from surviving records
    pub pruned_children: usize,
    /// Live children of dead roots that were sent back to their original cgroup
    pub released_orphans: usize,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.removed_roots.is_empty() && self.pruned_children == 0 && self.released_orphans == 0
    }
}

/// Drop records of dead roots and prune dead children.
///
/// Restriction sets and original locations are never touched. A dead root is
/// not restored (the kernel already released it), but children that outlived
/// it are returned to the original location before the record goes away.
pub fn reconcile(
    registry: &mut Registry,
    backend: &CgroupBackend,
    explorer: &ProcessExplorer,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    for pid in registry.pids() {
        let Some(record) = registry.get_mut(pid) else {
            continue;
        };

        if !explorer.exists(pid) {
            log::info!(
                "Process {} no longer exists, removing from jail list (had jails: {})",
                pid,
                record.restrictions()
            );
            let orphans = restore_many(backend, explorer, record.children(), record.original());
            report.released_orphans += orphans.moved.len();
            registry.remove(pid);
            report.removed_roots.push(pid);
            continue;
        }

        let before = record.children().len();
        record.children_mut().retain(|child| explorer.exists(*child));
        // A reused pid is a new process and may be confined again
        record.skipped_mut().retain(|child| explorer.exists(*child));
        let alive = record.children().len();
        if alive < before {
            log::info!(
                "Process {} ({}): {} child processes died, {} still alive",
                pid,
                record.restrictions(),
                before - alive,
                alive
            );
            report.pruned_children += before - alive;
        }
    }

    if !report.removed_roots.is_empty() {
        log::info!(
            "Cleaned up {} dead processes from jail list",
            report.removed_roots.len()
        );
    }
    report
}

/// Run a sweep every `interval` until the jailer shuts down or is dropped
pub fn spawn_sweeper(jailer: &Arc<Jailer>, interval: Duration) -> io::Result<JoinHandle<()>> {
    let jailer: Weak<Jailer> = Arc::downgrade(jailer);
    thread::Builder::new()
        .name("jailer-sweeper".to_string())
        .spawn(move || loop {
            thread::sleep(interval);
            let Some(jailer) = jailer.upgrade() else {
                break;
            };
            match jailer.reconcile() {
                Ok(report) if !report.is_empty() => {
                    log::debug!("Background sweep: {:?}", report);
                }
                Ok(_) => {}
                Err(JailError::ShuttingDown) => break,
                Err(e) => log::warn!("Background sweep failed: {}", e),
            }
        })
}
