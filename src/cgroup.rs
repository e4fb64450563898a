/// Cgroup backend for the jail hierarchies, cgroup v1 and v2
use crate::process::OriginalLocation;
use crate::types::{JailError, Result, RestrictionSet};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const JAIL_NETWORK_CGROUP: &str = "jail-network";
pub const JAIL_CPU_CGROUP: &str = "jail-cpu";
pub const JAIL_NETWORK_CPU_CGROUP: &str = "jail-network-cpu";

/// CFS period in microseconds (100ms)
pub const CPU_PERIOD_US: u64 = 100_000;
/// CFS quota in microseconds: 1% of one core
pub const CPU_QUOTA_US: u64 = 1_000;

/// net_cls tag matched by the packet filter under cgroup v1 (major 0x10, minor 1)
pub const NET_CLS_CLASS_ID: u32 = 0x0010_0001;

const PROCS_FILE: &str = "cgroup.procs";
const NET_CLS_SUBSYSTEM: &str = "net_cls";
const CPU_SUBSYSTEM: &str = "cpu";

/// Hierarchies the engine moves processes into under cgroup v1
const V1_SUBSYSTEMS: [&str; 2] = [NET_CLS_SUBSYSTEM, CPU_SUBSYSTEM];

/// Controllers delegated to the jail cgroups under cgroup v2
const V2_DELEGATED_CONTROLLERS: [&str; 2] = ["+cpu", "+pids"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CgroupModel {
    /// cgroup v2, one hierarchy
    Unified,
    /// cgroup v1, one hierarchy per controller
    PerSubsystem,
}

impl CgroupModel {
    pub fn name(&self) -> &'static str {
        match self {
            CgroupModel::Unified => "cgroup_v2",
            CgroupModel::PerSubsystem => "cgroup_v1",
        }
    }
}

/// Physical layout of the jails under cgroup v2: one directory per combination
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnifiedLayout {
    root: PathBuf,
}

impl UnifiedLayout {
    fn paths_for(&self, set: RestrictionSet) -> Vec<PathBuf> {
        let name = match set {
            RestrictionSet::NETWORK => JAIL_NETWORK_CGROUP,
            RestrictionSet::CPU => JAIL_CPU_CGROUP,
            RestrictionSet::BOTH => JAIL_NETWORK_CPU_CGROUP,
            _ => return Vec::new(),
        };
        vec![self.root.join(name)]
    }
}

/// Physical layout of the jails under cgroup v1.
///
/// Network lives in net_cls, Cpu in cpu. Network+Cpu needs a directory in
/// both hierarchies and a process must be written into each of them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubsystemLayout {
    root: PathBuf,
    class_id: u32,
}

impl SubsystemLayout {
    fn paths_for(&self, set: RestrictionSet) -> Vec<PathBuf> {
        let net_cls = self.root.join(NET_CLS_SUBSYSTEM);
        let cpu = self.root.join(CPU_SUBSYSTEM);
        match set {
            RestrictionSet::NETWORK => vec![net_cls.join(JAIL_NETWORK_CGROUP)],
            RestrictionSet::CPU => vec![cpu.join(JAIL_CPU_CGROUP)],
            RestrictionSet::BOTH => vec![
                net_cls.join(JAIL_NETWORK_CPU_CGROUP),
                cpu.join(JAIL_NETWORK_CPU_CGROUP),
            ],
            _ => Vec::new(),
        }
    }

    fn subsystem_of(&self, path: &Path) -> Option<&'static str> {
        V1_SUBSYSTEMS
            .into_iter()
            .find(|subsystem| path.starts_with(self.root.join(subsystem)))
    }

    /// Directory standing for `original` inside one hierarchy
    fn original_in(&self, subsystem: &str, original: &OriginalLocation) -> PathBuf {
        let relative = original
            .for_controller(subsystem)
            .unwrap_or_else(|| original.primary());
        join_cgroup(&self.root.join(subsystem), relative)
    }

    /// Hierarchies `from` confines a process in and `to` does not
    fn dropped_subsystems(&self, from: RestrictionSet, to: RestrictionSet) -> Vec<&'static str> {
        let kept: Vec<&'static str> = self
            .paths_for(to)
            .iter()
            .filter_map(|path| self.subsystem_of(path))
            .collect();
        self.paths_for(from)
            .iter()
            .filter_map(|path| self.subsystem_of(path))
            .filter(|subsystem| !kept.contains(subsystem))
            .collect()
    }
}

/// Detected cgroup model and the paths realising every jail combination.
///
/// Computed once at startup and never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Topology {
    Unified(UnifiedLayout),
    PerSubsystem(SubsystemLayout),
}

impl Topology {
    pub fn unified<P: Into<PathBuf>>(root: P) -> Self {
        Topology::Unified(UnifiedLayout { root: root.into() })
    }

    pub fn per_subsystem<P: Into<PathBuf>>(root: P) -> Self {
        Topology::PerSubsystem(SubsystemLayout {
            root: root.into(),
            class_id: NET_CLS_CLASS_ID,
        })
    }

    pub fn model(&self) -> CgroupModel {
        match self {
            Topology::Unified(_) => CgroupModel::Unified,
            Topology::PerSubsystem(_) => CgroupModel::PerSubsystem,
        }
    }

    pub fn root(&self) -> &Path {
        match self {
            Topology::Unified(layout) => &layout.root,
            Topology::PerSubsystem(layout) => &layout.root,
        }
    }

    /// Every physical path a process must be written into to hold `set`
    pub fn paths_for(&self, set: RestrictionSet) -> Vec<PathBuf> {
        match self {
            Topology::Unified(layout) => layout.paths_for(set),
            Topology::PerSubsystem(layout) => layout.paths_for(set),
        }
    }

    /// All jail directories created at initialization
    pub fn all_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for set in [
            RestrictionSet::NETWORK,
            RestrictionSet::CPU,
            RestrictionSet::BOTH,
        ] {
            for path in self.paths_for(set) {
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
        paths
    }

    /// Directories that carry the CPU throttle
    pub fn throttled_paths(&self) -> Vec<PathBuf> {
        let mut paths = self.paths_for(RestrictionSet::CPU);
        for path in self.paths_for(RestrictionSet::BOTH) {
            let is_cpu = match self {
                Topology::Unified(_) => true,
                Topology::PerSubsystem(layout) => {
                    layout.subsystem_of(&path) == Some(CPU_SUBSYSTEM)
                }
            };
            if is_cpu {
                paths.push(path);
            }
        }
        paths
    }

    /// Directories whose traffic must be dropped
    pub fn network_paths(&self) -> Vec<PathBuf> {
        let mut paths = self.paths_for(RestrictionSet::NETWORK);
        for path in self.paths_for(RestrictionSet::BOTH) {
            let is_network = match self {
                Topology::Unified(_) => true,
                Topology::PerSubsystem(layout) => {
                    layout.subsystem_of(&path) == Some(NET_CLS_SUBSYSTEM)
                }
            };
            if is_network {
                paths.push(path);
            }
        }
        paths
    }

    /// Network jail cgroups relative to the root, as matched by
    /// `socket cgroupv2` / `-m cgroup --path`
    pub fn network_cgroup_names(&self) -> Vec<String> {
        self.network_paths()
            .iter()
            .filter_map(|path| path.strip_prefix(self.root()).ok())
            .map(|relative| relative.to_string_lossy().into_owned())
            .collect()
    }

    /// Traffic classification tag, per-subsystem model only
    pub fn class_id(&self) -> Option<u32> {
        match self {
            Topology::Unified(_) => None,
            Topology::PerSubsystem(layout) => Some(layout.class_id),
        }
    }

    /// Procs files a process is written into to return it to `original`
    fn restore_targets(&self, original: &OriginalLocation) -> Vec<PathBuf> {
        match self {
            Topology::Unified(layout) => original
                .unified()
                .or_else(|| Some(original.primary()))
                .map(|path| vec![join_cgroup(&layout.root, path)])
                .unwrap_or_default(),
            Topology::PerSubsystem(layout) => V1_SUBSYSTEMS
                .into_iter()
                .filter(|subsystem| layout.root.join(subsystem).is_dir())
                .map(|subsystem| layout.original_in(subsystem, original))
                .collect(),
        }
    }

    /// Procs files a process leaving `from` for `to` is written into so it
    /// stops being confined by hierarchies `to` does not use.
    ///
    /// Always empty for the unified model, where one write moves the process
    /// out of its previous cgroup.
    fn release_targets(
        &self,
        from: RestrictionSet,
        to: RestrictionSet,
        original: &OriginalLocation,
    ) -> Vec<PathBuf> {
        match self {
            Topology::Unified(_) => Vec::new(),
            Topology::PerSubsystem(layout) => layout
                .dropped_subsystems(from, to)
                .into_iter()
                .map(|subsystem| layout.original_in(subsystem, original))
                .collect(),
        }
    }
}

/// Cgroup backend driving the jail hierarchies of one detected topology
#[derive(Clone, Debug)]
pub struct CgroupBackend {
    topology: Topology,
}

impl CgroupBackend {
    /// Probe `root` for cgroup v2 first, then cgroup v1
    pub fn detect(root: &Path) -> Result<Topology> {
        if root.join("cgroup.controllers").exists() {
            log::info!("Detected cgroups v2 at {}", root.display());
            return Ok(Topology::unified(root));
        }

        if root.join(CPU_SUBSYSTEM).is_dir() && root.join(NET_CLS_SUBSYSTEM).is_dir() {
            log::info!("Detected cgroups v1 at {}", root.display());
            return Ok(Topology::per_subsystem(root));
        }

        Err(JailError::UnsupportedPlatform(format!(
            "neither cgroups v1 (cpu + net_cls) nor v2 found under {}",
            root.display()
        )))
    }

    pub fn new(topology: Topology) -> Self {
        Self { topology }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn current_class_id(&self) -> Option<u32> {
        self.topology.class_id()
    }

    /// Create every jail directory and apply the fixed CPU throttle
    pub fn initialize(&self) -> Result<()> {
        if self.topology.model() == CgroupModel::Unified {
            self.enable_controllers();
        }

        for path in self.topology.all_paths() {
            fs::create_dir_all(&path).map_err(|e| {
                JailError::Cgroup(format!(
                    "Failed to create cgroup directory {}: {}",
                    path.display(),
                    e
                ))
            })?;
        }

        for path in self.topology.throttled_paths() {
            self.apply_cpu_throttle(&path)?;
        }

        if let Some(class_id) = self.topology.class_id() {
            for path in self.topology.network_paths() {
                write_control(&path.join("net_cls.classid"), &format!("{}\n", class_id))
                    .map_err(|e| {
                        JailError::Cgroup(format!(
                            "Failed to set net_cls classid in {}: {}",
                            path.display(),
                            e
                        ))
                    })?;
            }
        }

        log::info!(
            "{} jails initialized: {}",
            self.topology.model().name(),
            self.topology
                .all_paths()
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(())
    }

    fn enable_controllers(&self) {
        let subtree_control = self.topology.root().join("cgroup.subtree_control");
        for controller in V2_DELEGATED_CONTROLLERS {
            // May already be configured, or unavailable on this kernel
            if let Err(e) = write_control(&subtree_control, &format!("{}\n", controller)) {
                log::warn!(
                    "Could not enable {} in {}: {}",
                    controller,
                    subtree_control.display(),
                    e
                );
            }
        }
    }

    fn apply_cpu_throttle(&self, path: &Path) -> Result<()> {
        let writes: Vec<(PathBuf, String)> = match self.topology.model() {
            CgroupModel::Unified => vec![(
                path.join("cpu.max"),
                format!("{} {}\n", CPU_QUOTA_US, CPU_PERIOD_US),
            )],
            CgroupModel::PerSubsystem => vec![
                (path.join("cpu.cfs_period_us"), format!("{}\n", CPU_PERIOD_US)),
                (path.join("cpu.cfs_quota_us"), format!("{}\n", CPU_QUOTA_US)),
            ],
        };

        for (file, content) in writes {
            write_control(&file, &content).map_err(|e| {
                JailError::Cgroup(format!("Failed to set CPU limit in {}: {}", file.display(), e))
            })?;
        }

        log::info!(
            "CPU limit set to 1% of one core ({}us/{}us) in {}",
            CPU_QUOTA_US,
            CPU_PERIOD_US,
            path.display()
        );
        Ok(())
    }

    /// Write `pid` into every hierarchy backing `set`.
    ///
    /// Nothing is retried. When some hierarchies accepted the pid and another
    /// did not, the error is `PartialMove` naming the failed hierarchy.
    pub fn move_to(&self, pid: u32, set: RestrictionSet) -> Result<()> {
        let paths = self.topology.paths_for(set);
        if paths.is_empty() {
            return Err(JailError::Cgroup(format!(
                "No cgroup realises restriction set '{}'",
                set
            )));
        }

        let mut applied = 0;
        let mut failure: Option<(PathBuf, io::Error)> = None;
        for path in &paths {
            match append_pid(&path.join(PROCS_FILE), pid) {
                Ok(()) => {
                    applied += 1;
                    log::debug!("Moved PID {} into {}", pid, path.display());
                }
                Err(e) => {
                    log::warn!("Failed to move PID {} into {}: {}", pid, path.display(), e);
                    if failure.is_none() {
                        failure = Some((path.clone(), e));
                    }
                }
            }
        }

        match failure {
            None => Ok(()),
            Some((path, e)) if applied == 0 => Err(JailError::Move {
                pid,
                path,
                cause: e.to_string(),
            }),
            Some((path, e)) => Err(JailError::PartialMove {
                pid,
                path,
                cause: e.to_string(),
            }),
        }
    }

    /// Move an already jailed `pid` from the configuration for `from` into
    /// the one for `to`.
    ///
    /// Hierarchies used by `from` but not by `to` get the pid written back
    /// into their analogue of `original`. A total failure to enter `to` is
    /// returned before anything is released; a failed release is reported
    /// as `PartialMove`.
    pub fn move_between(
        &self,
        pid: u32,
        from: RestrictionSet,
        to: RestrictionSet,
        original: &OriginalLocation,
    ) -> Result<()> {
        let entered = match self.move_to(pid, to) {
            Ok(()) => Ok(()),
            Err(e @ JailError::PartialMove { .. }) => Err(e),
            Err(e) => return Err(e),
        };

        let mut release_error = None;
        for target in self.topology.release_targets(from, to, original) {
            match append_pid(&target.join(PROCS_FILE), pid) {
                Ok(()) => log::debug!("Released PID {} into {}", pid, target.display()),
                Err(e) => {
                    log::warn!("Failed to release PID {} into {}: {}", pid, target.display(), e);
                    if release_error.is_none() {
                        release_error = Some(JailError::PartialMove {
                            pid,
                            path: target,
                            cause: e.to_string(),
                        });
                    }
                }
            }
        }

        entered?;
        match release_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Write `pid` back into every hierarchy's analogue of `original`.
    ///
    /// Every target is attempted; the first failure is returned.
    pub fn restore(&self, pid: u32, original: &OriginalLocation) -> Result<()> {
        let targets = self.topology.restore_targets(original);
        if targets.is_empty() {
            return Err(JailError::Restore {
                pid,
                path: self.topology.root().to_path_buf(),
                cause: format!("no hierarchy to restore '{}' into", original),
            });
        }

        let mut first_error = None;
        for target in targets {
            if let Err(e) = append_pid(&target.join(PROCS_FILE), pid) {
                if first_error.is_none() {
                    first_error = Some(JailError::Restore {
                        pid,
                        path: target,
                        cause: e.to_string(),
                    });
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Remove a jail directory only when no process is left in it.
    ///
    /// Returns whether the directory was removed. On cgroupfs an empty
    /// cgroup is removable despite listing control files; on a plain
    /// filesystem the removal fails and surfaces as a `Cgroup` error.
    pub fn reclaim_if_empty(&self, path: &Path) -> Result<bool> {
        let occupants = match read_procs(path) {
            Ok(pids) => pids,
            Err(e) => {
                log::debug!("Not reclaiming {}: {}", path.display(), e);
                return Ok(false);
            }
        };
        if !occupants.is_empty() {
            log::debug!(
                "Not reclaiming {}: {} processes still inside",
                path.display(),
                occupants.len()
            );
            return Ok(false);
        }

        fs::remove_dir(path).map_err(|e| {
            JailError::Cgroup(format!("Failed to remove {}: {}", path.display(), e))
        })?;
        Ok(true)
    }
}

/// Pids listed in the procs file of a cgroup directory
pub fn read_procs(path: &Path) -> io::Result<Vec<u32>> {
    let content = fs::read_to_string(path.join(PROCS_FILE))?;
    Ok(content
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect())
}

fn join_cgroup(base: &Path, cgroup: &str) -> PathBuf {
    let relative = cgroup.trim_start_matches('/');
    if relative.is_empty() {
        base.to_path_buf()
    } else {
        base.join(relative)
    }
}

fn write_control(path: &Path, content: &str) -> io::Result<()> {
    fs::write(path, content)
}

/// The kernel handles one pid per write, so each move is a single append
fn append_pid(procs_file: &Path, pid: u32) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(procs_file)?;
    file.write_all(format!("{}\n", pid).as_bytes())
}
