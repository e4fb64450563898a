/// Process tree exploration over procfs
use crate::types::{JailError, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::path::PathBuf;

/// Cgroup membership of a process captured before it is first jailed.
///
/// Under cgroup v2 only `unified` is set. Under v1 every controller listed in
/// `/proc/<pid>/cgroup` maps to the path it occupied in that hierarchy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OriginalLocation {
    unified: Option<String>,
    controllers: BTreeMap<String, String>,
}

impl OriginalLocation {
    /// Parse the content of `/proc/<pid>/cgroup`
    pub fn parse(content: &str) -> Option<Self> {
        let mut unified = None;
        let mut controllers = BTreeMap::new();

        for line in content.lines() {
            // hierarchy-ID:controller-list:path
            let mut parts = line.splitn(3, ':');
            let (Some(_id), Some(list), Some(path)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            if path.is_empty() {
                continue;
            }

            if list.is_empty() {
                unified = Some(path.to_string());
            } else {
                for controller in list.split(',') {
                    controllers.insert(controller.to_string(), path.to_string());
                }
            }
        }

        if unified.is_none() && controllers.is_empty() {
            return None;
        }
        Some(Self {
            unified,
            controllers,
        })
    }

    /// A location that only knows the unified path
    pub fn unified_only(path: &str) -> Self {
        Self {
            unified: Some(path.to_string()),
            controllers: BTreeMap::new(),
        }
    }

    pub fn unified(&self) -> Option<&str> {
        self.unified.as_deref()
    }

    /// Path inside the hierarchy of `controller`, falling back to the unified path
    pub fn for_controller(&self, controller: &str) -> Option<&str> {
        self.controllers
            .get(controller)
            .map(String::as_str)
            .or(self.unified.as_deref())
    }

    pub fn primary(&self) -> &str {
        self.unified
            .as_deref()
            .or_else(|| self.controllers.values().next().map(String::as_str))
            .unwrap_or("/")
    }
}

impl fmt::Display for OriginalLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.primary())
    }
}

/// Reads parent/child relationships and liveness from a procfs mount
#[derive(Clone, Debug)]
pub struct ProcessExplorer {
    proc_root: PathBuf,
}

impl Default for ProcessExplorer {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcessExplorer {
    pub fn new<P: Into<PathBuf>>(proc_root: P) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    fn pid_dir(&self, pid: u32) -> PathBuf {
        self.proc_root.join(pid.to_string())
    }

    /// Check if a process still exists
    pub fn exists(&self, pid: u32) -> bool {
        self.pid_dir(pid).is_dir()
    }

    /// Best-effort process name; a synthetic label when comm is unreadable
    pub fn name_of(&self, pid: u32) -> String {
        match fs::read_to_string(self.pid_dir(pid).join("comm")) {
            Ok(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => format!("PID-{}", pid),
        }
    }

    /// Parent pid from `/proc/<pid>/stat`, `None` if the process vanished
    pub fn parent_of(&self, pid: u32) -> Option<u32> {
        let content = fs::read_to_string(self.pid_dir(pid).join("stat")).ok()?;
        parse_stat_ppid(&content)
    }

    /// Direct children of `pid`.
    ///
    /// Only an unreadable process table is an error; processes that vanish
    /// during the scan are skipped.
    pub fn children_of(&self, pid: u32) -> Result<BTreeSet<u32>> {
        let table = self.parent_table()?;
        Ok(table.get(&pid).cloned().unwrap_or_default())
    }

    /// All descendants of `pid` reachable through the live parent chain.
    ///
    /// The table is read once and walked iteratively; a pid is never expanded
    /// twice, so inconsistent parent data (pid reuse mid-scan) cannot loop.
    pub fn descendants_of(&self, pid: u32) -> Result<BTreeSet<u32>> {
        let table = self.parent_table()?;

        let mut visited = BTreeSet::new();
        visited.insert(pid);
        let mut descendants = BTreeSet::new();
        let mut stack = vec![pid];

        while let Some(current) = stack.pop() {
            let Some(children) = table.get(&current) else {
                continue;
            };
            for &child in children {
                if !visited.insert(child) {
                    continue;
                }
                descendants.insert(child);
                stack.push(child);
            }
        }

        log::debug!("PID {} has {} descendants", pid, descendants.len());
        Ok(descendants)
    }

    /// Verify the process exists and its cgroup metadata is readable
    pub fn validate_access(&self, pid: u32) -> Result<()> {
        if !self.exists(pid) {
            return Err(JailError::ProcessInaccessible {
                pid,
                reason: "process does not exist".to_string(),
            });
        }

        let cgroup_file = self.pid_dir(pid).join("cgroup");
        fs::metadata(&cgroup_file).map_err(|e| JailError::ProcessInaccessible {
            pid,
            reason: format!("cannot access {}: {}", cgroup_file.display(), e),
        })?;

        Ok(())
    }

    /// Current cgroup membership of `pid`
    pub fn original_location(&self, pid: u32) -> Result<OriginalLocation> {
        let cgroup_file = self.pid_dir(pid).join("cgroup");
        let content =
            fs::read_to_string(&cgroup_file).map_err(|e| JailError::OriginalLocation {
                pid,
                reason: format!("failed to read {}: {}", cgroup_file.display(), e),
            })?;

        OriginalLocation::parse(&content).ok_or_else(|| JailError::OriginalLocation {
            pid,
            reason: "no cgroup entry found".to_string(),
        })
    }

    /// Snapshot of parent pid -> direct children for every readable process
    fn parent_table(&self) -> Result<HashMap<u32, BTreeSet<u32>>> {
        let entries = fs::read_dir(&self.proc_root).map_err(|e| {
            JailError::Lookup(format!(
                "failed to read {}: {}",
                self.proc_root.display(),
                e
            ))
        })?;

        let mut table: HashMap<u32, BTreeSet<u32>> = HashMap::new();
        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            // Process may have disappeared
            let Some(ppid) = self.parent_of(pid) else {
                continue;
            };
            if ppid != pid {
                table.entry(ppid).or_default().insert(pid);
            }
        }

        Ok(table)
    }
}

/// Extract the ppid field from a stat line: `pid (comm) state ppid ...`.
///
/// comm may itself contain spaces and parentheses, so fields are counted
/// from the last closing parenthesis.
fn parse_stat_ppid(content: &str) -> Option<u32> {
    let rest = &content[content.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}
