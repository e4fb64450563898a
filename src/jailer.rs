/// Thread-safe jail engine shared by the shell, the sweeper and the signal listener
use crate::cgroup::CgroupBackend;
use crate::firewall::NetworkFilter;
use crate::process::ProcessExplorer;
use crate::reconcile::{reconcile, ReconcileReport};
use crate::registry::{ActiveJail, JailRecord, Registry, TransitionReport};
use crate::shutdown::{run_teardown, ShutdownReport};
use crate::types::{JailError, JailType, JailerConfig, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Owns the registry and every collaborator needed to act on it.
///
/// All registry access goes through one lock, so transitions on the same pid
/// never interleave and a listing never observes a half-applied transition.
pub struct Jailer {
    backend: CgroupBackend,
    explorer: ProcessExplorer,
    registry: Mutex<Registry>,
    filter: Mutex<Box<dyn NetworkFilter>>,
    shut_down: AtomicBool,
}

impl Jailer {
    /// Detect the cgroup model, create the jails and install filter rules
    pub fn start(config: &JailerConfig, filter: Box<dyn NetworkFilter>) -> Result<Self> {
        let topology = CgroupBackend::detect(&config.cgroup_root)?;
        let backend = CgroupBackend::new(topology);
        backend.initialize()?;
        Self::with_backend(backend, ProcessExplorer::new(&config.proc_root), filter)
    }

    /// Build around an already initialized backend
    pub fn with_backend(
        backend: CgroupBackend,
        explorer: ProcessExplorer,
        mut filter: Box<dyn NetworkFilter>,
    ) -> Result<Self> {
        filter.setup(backend.topology())?;
        log::info!(
            "Jailer ready ({}, firewall: {})",
            backend.topology().model().name(),
            filter.name()
        );

        Ok(Self {
            backend,
            explorer,
            registry: Mutex::new(Registry::new()),
            filter: Mutex::new(filter),
            shut_down: AtomicBool::new(false),
        })
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // A panicking holder cannot leave a record half-written, keep going
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the registry unless shutdown has begun
    fn live_registry(&self) -> Result<MutexGuard<'_, Registry>> {
        let registry = self.registry();
        if self.is_shut_down() {
            return Err(JailError::ShuttingDown);
        }
        Ok(registry)
    }

    /// Snapshot of the record for `pid`
    pub fn record(&self, pid: u32) -> Option<JailRecord> {
        self.registry().get(pid).cloned()
    }

    pub fn jail(&self, pid: u32, kind: JailType) -> Result<TransitionReport> {
        let mut registry = self.live_registry()?;
        registry.jail(&self.backend, &self.explorer, pid, kind)
    }

    /// Network then Cpu under one lock; equivalent to the two calls in sequence.
    ///
    /// Stops at the first failure, leaving whatever the first call applied.
    pub fn jail_both(&self, pid: u32) -> Result<Vec<TransitionReport>> {
        let mut registry = self.live_registry()?;
        JailType::ALL
            .into_iter()
            .map(|kind| registry.jail(&self.backend, &self.explorer, pid, kind))
            .collect()
    }

    /// Remove one jail type, or all of them when `kind` is `None`
    pub fn unjail(&self, pid: u32, kind: Option<JailType>) -> Result<TransitionReport> {
        let mut registry = self.live_registry()?;
        match kind {
            Some(kind) => registry.unjail_type(&self.backend, &self.explorer, pid, kind),
            None => registry.unjail(&self.backend, &self.explorer, pid),
        }
    }

    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let mut registry = self.live_registry()?;
        Ok(reconcile(&mut registry, &self.backend, &self.explorer))
    }

    /// Reconcile, then list every active jail ordered by pid
    pub fn list_active(&self) -> Result<Vec<ActiveJail>> {
        let mut registry = self.live_registry()?;
        reconcile(&mut registry, &self.backend, &self.explorer);
        Ok(registry.rows(&self.explorer))
    }

    /// Tear everything down; `None` if another caller already did
    pub fn shutdown(&self) -> Option<ShutdownReport> {
        let mut registry = self.registry();
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return None;
        }

        let mut filter = self.filter.lock().unwrap_or_else(PoisonError::into_inner);
        Some(run_teardown(
            &mut registry,
            &self.backend,
            &self.explorer,
            filter.as_mut(),
        ))
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl Drop for Jailer {
    fn drop(&mut self) {
        if !self.is_shut_down() {
            if let Some(report) = self.shutdown() {
                log::info!("{}", report);
            }
        }
    }
}
