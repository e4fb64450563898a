/// Packet filter rules dropping the traffic of network-jailed cgroups
use crate::cgroup::{CgroupModel, Topology};
use crate::types::{FirewallChoice, JailError, Result};
use std::process::Command;

const NFT_TABLE: &str = "jail";

/// External collaborator realising the network jail
pub trait NetworkFilter: Send {
    fn name(&self) -> &str;

    /// Install rules for every network jail of `topology`
    fn setup(&mut self, topology: &Topology) -> Result<()>;

    /// Remove whatever `setup` installed
    fn teardown(&mut self) -> Result<()>;
}

/// Build the filter selected by configuration
pub fn build_filter(choice: FirewallChoice) -> Result<Box<dyn NetworkFilter>> {
    let tool = match choice {
        FirewallChoice::None => return Ok(Box::new(NoFilter)),
        FirewallChoice::Nftables => FirewallTool::Nftables,
        FirewallChoice::Iptables => FirewallTool::Iptables,
        FirewallChoice::Auto => FirewallTool::detect()?,
    };
    Ok(Box::new(CommandFilter::new(tool)))
}

/// Installs nothing; cgroup confinement only
#[derive(Debug, Default)]
pub struct NoFilter;

impl NetworkFilter for NoFilter {
    fn name(&self) -> &str {
        "none"
    }

    fn setup(&mut self, _topology: &Topology) -> Result<()> {
        log::warn!("No packet filter configured, network jail will not block traffic");
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirewallTool {
    Nftables,
    Iptables,
}

impl FirewallTool {
    /// Prefer nftables, fall back to iptables
    pub fn detect() -> Result<Self> {
        if probe("nft", &["list", "tables"]) {
            log::info!("Detected nftables as primary firewall tool");
            return Ok(FirewallTool::Nftables);
        }
        if probe("iptables", &["-L", "-n"]) {
            log::info!("Detected iptables as primary firewall tool");
            return Ok(FirewallTool::Iptables);
        }
        Err(JailError::Firewall(
            "neither nftables nor iptables found on system".to_string(),
        ))
    }

    pub fn name(&self) -> &'static str {
        match self {
            FirewallTool::Nftables => "nftables",
            FirewallTool::Iptables => "iptables",
        }
    }
}

/// Runs nft/iptables to drop traffic of the network jail cgroups
#[derive(Debug)]
pub struct CommandFilter {
    tool: FirewallTool,
    installed: Vec<Vec<String>>,
}

impl CommandFilter {
    pub fn new(tool: FirewallTool) -> Self {
        Self {
            tool,
            installed: Vec::new(),
        }
    }

    /// Commands `setup` runs for `topology`, in order
    pub fn setup_commands(tool: FirewallTool, topology: &Topology) -> Vec<Vec<String>> {
        let matchers = match_expressions(tool, topology);
        match tool {
            FirewallTool::Nftables => {
                let mut commands = vec![
                    args(&["nft", "add", "table", "inet", NFT_TABLE]),
                    args(&[
                        "nft", "add", "chain", "inet", NFT_TABLE, "output", "{", "type", "filter",
                        "hook", "output", "priority", "100", ";", "}",
                    ]),
                    args(&[
                        "nft", "add", "chain", "inet", NFT_TABLE, "input", "{", "type", "filter",
                        "hook", "input", "priority", "100", ";", "}",
                    ]),
                ];
                for matcher in &matchers {
                    for chain in ["output", "input"] {
                        let mut command = args(&["nft", "add", "rule", "inet", NFT_TABLE, chain]);
                        command.extend(matcher.iter().cloned());
                        command.push("drop".to_string());
                        commands.push(command);
                    }
                }
                commands
            }
            FirewallTool::Iptables => {
                let mut commands = Vec::new();
                for matcher in &matchers {
                    for chain in ["OUTPUT", "INPUT"] {
                        let mut command = args(&["iptables", "-A", chain]);
                        command.extend(matcher.iter().cloned());
                        command.extend(args(&["-j", "DROP"]));
                        commands.push(command);
                    }
                }
                commands
            }
        }
    }

    /// Commands undoing what is currently installed
    pub fn teardown_commands(&self) -> Vec<Vec<String>> {
        match self.tool {
            FirewallTool::Nftables if self.installed.is_empty() => Vec::new(),
            FirewallTool::Nftables => vec![args(&["nft", "delete", "table", "inet", NFT_TABLE])],
            FirewallTool::Iptables => self
                .installed
                .iter()
                .rev()
                .map(|command| {
                    command
                        .iter()
                        .map(|arg| if arg == "-A" { "-D".to_string() } else { arg.clone() })
                        .collect()
                })
                .collect(),
        }
    }
}

impl NetworkFilter for CommandFilter {
    fn name(&self) -> &str {
        self.tool.name()
    }

    fn setup(&mut self, topology: &Topology) -> Result<()> {
        for command in Self::setup_commands(self.tool, topology) {
            log::debug!("Executing {} command: {:?}", self.tool.name(), command);
            if let Err(e) = run(&command) {
                // Do not leave half a rule set behind
                if let Err(cleanup) = self.teardown() {
                    log::warn!("Failed to roll back partial rule set: {}", cleanup);
                }
                return Err(e);
            }
            self.installed.push(command);
        }
        log::info!("{} jail rules configured successfully", self.tool.name());
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        let mut first_error = None;
        for command in self.teardown_commands() {
            match run(&command) {
                Ok(()) => {}
                Err(JailError::Firewall(message)) if is_missing_rule(&message) => {
                    log::debug!("Rule already gone: {:?}", command);
                }
                Err(e) => {
                    log::warn!("Failed to remove {} rule {:?}: {}", self.tool.name(), command, e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        self.installed.clear();

        match first_error {
            Some(e) => Err(e),
            None => {
                log::info!("{} jail rules cleaned up", self.tool.name());
                Ok(())
            }
        }
    }
}

/// Rule fragments selecting jailed traffic, one per network jail
fn match_expressions(tool: FirewallTool, topology: &Topology) -> Vec<Vec<String>> {
    match (topology.model(), tool) {
        (CgroupModel::Unified, FirewallTool::Nftables) => topology
            .network_cgroup_names()
            .into_iter()
            .map(|name| {
                vec![
                    "socket".to_string(),
                    "cgroupv2".to_string(),
                    "level".to_string(),
                    "1".to_string(),
                    format!("\"{}\"", name),
                ]
            })
            .collect(),
        (CgroupModel::Unified, FirewallTool::Iptables) => topology
            .network_cgroup_names()
            .into_iter()
            .map(|name| args(&["-m", "cgroup", "--path", &name]))
            .collect(),
        (CgroupModel::PerSubsystem, FirewallTool::Nftables) => topology
            .class_id()
            .map(|id| vec![args(&["meta", "cgroup", &format!("{:#010x}", id)])])
            .unwrap_or_default(),
        (CgroupModel::PerSubsystem, FirewallTool::Iptables) => topology
            .class_id()
            .map(|id| vec![args(&["-m", "cgroup", "--cgroup", &format!("{:#010x}", id)])])
            .unwrap_or_default(),
    }
}

fn is_missing_rule(message: &str) -> bool {
    message.contains("No such file or directory")
        || message.contains("No chain/target/match by that name")
        || message.contains("does a matching rule exist")
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

fn probe(binary: &str, probe_args: &[&str]) -> bool {
    Command::new(binary)
        .args(probe_args)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn run(command: &[String]) -> Result<()> {
    let (binary, rest) = command
        .split_first()
        .ok_or_else(|| JailError::Firewall("empty command".to_string()))?;
    let output = Command::new(binary)
        .args(rest)
        .output()
        .map_err(|e| JailError::Firewall(format!("failed to execute {}: {}", binary, e)))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(JailError::Firewall(format!(
            "command {:?} failed: {}",
            command,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}
