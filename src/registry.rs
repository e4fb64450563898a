/// Jail records and the transitions between jail configurations
use crate::cgroup::CgroupBackend;
use crate::process::{OriginalLocation, ProcessExplorer};
use crate::types::{JailError, JailType, Result, RestrictionSet};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

/// One actively confined root process
#[derive(Clone, Debug)]
pub struct JailRecord {
    pid: u32,
    original: OriginalLocation,
    restrictions: RestrictionSet,
    children: BTreeSet<u32>,
    /// Descendants that could not be confined; never retried
    skipped: BTreeSet<u32>,
    created_at: DateTime<Utc>,
}

impl JailRecord {
    pub fn new(
        pid: u32,
        original: OriginalLocation,
        kind: JailType,
        children: BTreeSet<u32>,
    ) -> Self {
        Self {
            pid,
            original,
            restrictions: RestrictionSet::single(kind),
            children,
            skipped: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn original(&self) -> &OriginalLocation {
        &self.original
    }

    pub fn restrictions(&self) -> RestrictionSet {
        self.restrictions
    }

    pub fn children(&self) -> &BTreeSet<u32> {
        &self.children
    }

    /// Descendants whose move failed; later transitions leave them alone
    pub fn skipped(&self) -> &BTreeSet<u32> {
        &self.skipped
    }

    pub fn elapsed(&self) -> Duration {
        (Utc::now() - self.created_at).to_std().unwrap_or_default()
    }

    pub(crate) fn children_mut(&mut self) -> &mut BTreeSet<u32> {
        &mut self.children
    }

    pub(crate) fn skipped_mut(&mut self) -> &mut BTreeSet<u32> {
        &mut self.skipped
    }
}

/// Per-entity result of a multi-process move or restore
#[derive(Debug, Default)]
pub struct MoveOutcome {
    pub moved: Vec<u32>,
    pub failed: Vec<(u32, JailError)>,
}

impl MoveOutcome {
    pub fn attempted(&self) -> usize {
        self.moved.len() + self.failed.len()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// A new record was created
    Jailed(JailType),
    /// A jail type was added to an existing record
    Added(JailType),
    /// A jail type was removed, the record survives
    Removed(JailType),
    /// The record was deleted and its processes restored
    Released,
}

/// What a jail/unjail call actually did
#[derive(Debug)]
pub struct TransitionReport {
    pub pid: u32,
    pub name: String,
    pub transition: Transition,
    /// Restriction set after the transition, empty once released
    pub restrictions: RestrictionSet,
    /// Root failure that was downgraded to a warning
    pub root_error: Option<String>,
    pub children: MoveOutcome,
}

impl TransitionReport {
    pub fn root_ok(&self) -> bool {
        self.root_error.is_none()
    }
}

impl fmt::Display for TransitionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let moved = self.children.moved.len();
        let attempted = self.children.attempted();
        match self.transition {
            Transition::Jailed(kind) => write!(
                f,
                "Successfully jailed process {} ({}) with {} jail, {} of {} descendants moved",
                self.pid, self.name, kind, moved, attempted
            )?,
            Transition::Added(kind) => write!(
                f,
                "Added {} jail to process {} ({}), now jailed with {}, {} of {} descendants moved",
                kind, self.pid, self.name, self.restrictions, moved, attempted
            )?,
            Transition::Removed(kind) => write!(
                f,
                "Removed {} jail from process {} ({}), remaining jails: {}, {} of {} descendants moved",
                kind, self.pid, self.name, self.restrictions, moved, attempted
            )?,
            Transition::Released => write!(
                f,
                "Successfully unjailed process {} ({}), {} of {} descendants restored",
                self.pid, self.name, moved, attempted
            )?,
        }
        if let Some(root_error) = &self.root_error {
            write!(f, " (warning: {})", root_error)?;
        }
        Ok(())
    }
}

/// One row of the active jail listing
#[derive(Clone, Debug)]
pub struct ActiveJail {
    pub pid: u32,
    pub name: String,
    pub restrictions: RestrictionSet,
    pub child_count: usize,
    pub elapsed: Duration,
}

/// Mapping from root pid to its jail record
#[derive(Debug, Default)]
pub struct Registry {
    records: HashMap<u32, JailRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, pid: u32) -> Option<&JailRecord> {
        self.records.get(&pid)
    }

    /// Root pids in ascending order
    pub fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.records.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Track an already-confined process
    #[cfg(test)]
    pub(crate) fn insert(&mut self, record: JailRecord) {
        self.records.insert(record.pid, record);
    }

    pub(crate) fn get_mut(&mut self, pid: u32) -> Option<&mut JailRecord> {
        self.records.get_mut(&pid)
    }

    pub(crate) fn remove(&mut self, pid: u32) -> Option<JailRecord> {
        self.records.remove(&pid)
    }

    /// Listing rows ordered by pid
    pub fn rows(&self, explorer: &ProcessExplorer) -> Vec<ActiveJail> {
        self.pids()
            .into_iter()
            .filter_map(|pid| self.records.get(&pid))
            .map(|record| ActiveJail {
                pid: record.pid,
                name: explorer.name_of(record.pid),
                restrictions: record.restrictions,
                child_count: record.children.len(),
                elapsed: record.elapsed(),
            })
            .collect()
    }

    /// Apply `kind` to `pid`.
    ///
    /// Without a record the process and its descendants are moved into the
    /// single-type jail. With a record lacking `kind`, the root and its
    /// children move into the combined configuration in place.
    pub fn jail(
        &mut self,
        backend: &CgroupBackend,
        explorer: &ProcessExplorer,
        pid: u32,
        kind: JailType,
    ) -> Result<TransitionReport> {
        if let Some(record) = self.records.get_mut(&pid) {
            if record.restrictions.contains(kind) {
                return Err(JailError::AlreadyJailed { pid, kind });
            }
            let target = record.restrictions.with(kind);
            let name = explorer.name_of(pid);
            log::info!(
                "Adding {} jail to already jailed process {} ({}), moving to {} jail",
                kind,
                pid,
                name,
                target
            );
            let (root_error, children) = retarget(record, backend, explorer, target)?;
            return Ok(TransitionReport {
                pid,
                name,
                transition: Transition::Added(kind),
                restrictions: record.restrictions,
                root_error,
                children,
            });
        }

        explorer.validate_access(pid)?;
        let original = explorer.original_location(pid)?;
        let descendants = explorer.descendants_of(pid)?;
        let name = explorer.name_of(pid);
        let set = RestrictionSet::single(kind);

        log::info!(
            "Jailing process {} ({}) and {} descendants with {} jail...",
            pid,
            name,
            descendants.len(),
            kind
        );

        backend.move_to(pid, set)?;
        log::info!("  Moved main process {} into {} jail", pid, set);

        let children = move_many(backend, descendants, RestrictionSet::EMPTY, set, &original);
        let mut record =
            JailRecord::new(pid, original, kind, children.moved.iter().copied().collect());
        record.skipped = children.failed.iter().map(|(child, _)| *child).collect();
        self.records.insert(pid, record);

        Ok(TransitionReport {
            pid,
            name,
            transition: Transition::Jailed(kind),
            restrictions: set,
            root_error: None,
            children,
        })
    }

    /// Remove `kind` from `pid`; removing the last type releases the process
    pub fn unjail_type(
        &mut self,
        backend: &CgroupBackend,
        explorer: &ProcessExplorer,
        pid: u32,
        kind: JailType,
    ) -> Result<TransitionReport> {
        let record = self.records.get_mut(&pid).ok_or(JailError::NotJailed(pid))?;
        if !record.restrictions.contains(kind) {
            return Err(JailError::NotJailedWith { pid, kind });
        }

        let name = explorer.name_of(pid);
        if record.restrictions.len() == 1 {
            log::info!(
                "Removing last jail type ({}) from process {} ({}), completely unjailing...",
                kind,
                pid,
                name
            );
            return self.unjail(backend, explorer, pid);
        }

        let target = record.restrictions.without(kind);
        log::info!(
            "Removing {} jail from process {} ({}), moving to {} jail",
            kind,
            pid,
            name,
            target
        );
        let (root_error, children) = retarget(record, backend, explorer, target)?;
        Ok(TransitionReport {
            pid,
            name,
            transition: Transition::Removed(kind),
            restrictions: record.restrictions,
            root_error,
            children,
        })
    }

    /// Release `pid` completely.
    ///
    /// Restore failures are warnings; the record is always deleted.
    pub fn unjail(
        &mut self,
        backend: &CgroupBackend,
        explorer: &ProcessExplorer,
        pid: u32,
    ) -> Result<TransitionReport> {
        let record = self.records.remove(&pid).ok_or(JailError::NotJailed(pid))?;
        let name = explorer.name_of(pid);
        log::info!("Unjailing process {} ({}) and its descendants...", pid, name);

        let root_error = if !explorer.exists(pid) {
            log::info!("  Main process {} no longer exists", pid);
            Some(format!("main process {} no longer exists", pid))
        } else {
            match backend.restore(pid, &record.original) {
                Ok(()) => {
                    log::info!("  Restored main process {} to {}", pid, record.original);
                    None
                }
                Err(e) => {
                    log::warn!("Failed to restore main process {}: {}", pid, e);
                    Some(e.to_string())
                }
            }
        };

        let children = restore_many(backend, explorer, &record.children, &record.original);

        Ok(TransitionReport {
            pid,
            name,
            transition: Transition::Released,
            restrictions: RestrictionSet::EMPTY,
            root_error,
            children,
        })
    }
}

/// Move a jailed root and its live children into the configuration for
/// `target`, updating the record in place.
///
/// The root moves first. If it cannot be written into any hierarchy the
/// record is untouched and the error propagates; a partial root move is a
/// warning. Children that fail to follow are dropped from the record, sent
/// back to the original location and never retried. Descendants forked
/// since the last transition inherited the old jail and follow as well.
fn retarget(
    record: &mut JailRecord,
    backend: &CgroupBackend,
    explorer: &ProcessExplorer,
    target: RestrictionSet,
) -> Result<(Option<String>, MoveOutcome)> {
    let pid = record.pid;
    let current = record.restrictions;
    let root_error = match backend.move_between(pid, current, target, &record.original) {
        Ok(()) => {
            log::info!("  Moved main process {} into {} jail", pid, target);
            None
        }
        Err(e @ JailError::PartialMove { .. }) => {
            log::warn!("Main process {} is only partially jailed: {}", pid, e);
            Some(e.to_string())
        }
        Err(e) => return Err(e),
    };
    record.restrictions = target;

    let mut followers: BTreeSet<u32> = record
        .children
        .iter()
        .copied()
        .filter(|child| explorer.exists(*child))
        .collect();
    match explorer.descendants_of(pid) {
        Ok(descendants) => followers.extend(
            descendants
                .into_iter()
                .filter(|child| !record.skipped.contains(child)),
        ),
        Err(e) => log::warn!("Failed to rescan descendants of {}: {}", pid, e),
    }

    let children = move_many(backend, followers, current, target, &record.original);
    for (child, _) in &children.failed {
        if let Err(e) = backend.restore(*child, &record.original) {
            log::warn!("Failed to release stranded child {}: {}", child, e);
        }
        record.skipped.insert(*child);
    }
    record.children = children.moved.iter().copied().collect();

    Ok((root_error, children))
}

/// Best-effort move of every pid from `from` into `set`; `from` is empty
/// for processes entering their first jail
fn move_many(
    backend: &CgroupBackend,
    pids: impl IntoIterator<Item = u32>,
    from: RestrictionSet,
    set: RestrictionSet,
    original: &OriginalLocation,
) -> MoveOutcome {
    let mut outcome = MoveOutcome::default();
    for pid in pids {
        match backend.move_between(pid, from, set, original) {
            Ok(()) => {
                log::info!("  Moved descendant {} into {} jail", pid, set);
                outcome.moved.push(pid);
            }
            Err(e) => {
                log::warn!("Failed to move descendant {} into {} jail: {}", pid, set, e);
                outcome.failed.push((pid, e));
            }
        }
    }
    outcome
}

/// Best-effort restore of every still-living pid; each one independent
pub(crate) fn restore_many<'a>(
    backend: &CgroupBackend,
    explorer: &ProcessExplorer,
    pids: impl IntoIterator<Item = &'a u32>,
    original: &OriginalLocation,
) -> MoveOutcome {
    let mut outcome = MoveOutcome::default();
    for &pid in pids {
        if !explorer.exists(pid) {
            log::info!("  Child process {} no longer exists", pid);
            continue;
        }
        match backend.restore(pid, original) {
            Ok(()) => {
                log::info!("  Restored child process {} to {}", pid, original);
                outcome.moved.push(pid);
            }
            Err(e) => {
                log::warn!("Failed to restore child process {}: {}", pid, e);
                outcome.failed.push((pid, e));
            }
        }
    }
    outcome
}

/// Go-style compact duration, e.g. `1h2m3s`
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
