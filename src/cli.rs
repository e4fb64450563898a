/// Command line arguments and the interactive jail shell
use crate::jailer::Jailer;
use crate::registry::{format_elapsed, ActiveJail};
use crate::types::{parse_pid, FirewallChoice, JailError, JailType, JailerConfig, Result};
use clap::Parser;
use std::io::{BufRead, Write};
use std::path::PathBuf;

const PROMPT: &str = "$> ";

pub const HELP: &str = "\
Available commands:
  jail network <pid>  - Put process in network jail
  jail n <pid>        - Short form for network jail
  jail cpu <pid>      - Put process in CPU jail (1% limit)
  jail c <pid>        - Short form for CPU jail
  jail both <pid>     - Put process in both network and CPU jail
  unjail <pid>        - Remove all jails from process
  unjail <type> <pid> - Remove specific jail type from process
  list                - List active jails
  help                - Show this help
  exit                - Clean up and exit

Jail types:
  network/n           - Block network access
  cpu/c               - Limit CPU usage to 1% of one core
  both                - Apply both network and CPU jails
";

#[derive(Parser, Debug)]
#[command(name = "jailer")]
#[command(author, version, about = "Quarantine running processes with cgroup network and CPU jails", long_about = None)]
pub struct Cli {
    /// JSON configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Mount point of the cgroup filesystem
    #[arg(long, value_name = "PATH")]
    pub cgroup_root: Option<PathBuf>,

    /// Mount point of procfs
    #[arg(long, value_name = "PATH")]
    pub proc_root: Option<PathBuf>,

    /// Packet filter used for the network jail
    #[arg(long, value_enum)]
    pub firewall: Option<FirewallChoice>,

    /// Reconcile jails with the process table every N seconds
    #[arg(long, value_name = "SECS")]
    pub sweep_interval: Option<u64>,

    /// Do not require root privileges
    #[arg(long)]
    pub no_root_check: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Defaults, then the config file, then command line flags
    pub fn load_config(&self) -> Result<JailerConfig> {
        let mut config = match &self.config {
            Some(path) => JailerConfig::from_file(path)?,
            None => JailerConfig::default(),
        };

        if let Some(root) = &self.cgroup_root {
            config.cgroup_root = root.clone();
        }
        if let Some(root) = &self.proc_root {
            config.proc_root = root.clone();
        }
        if let Some(firewall) = self.firewall {
            config.firewall = firewall;
        }
        if let Some(secs) = self.sweep_interval {
            config.sweep_interval_secs = Some(secs);
        }
        if self.no_root_check {
            config.require_root = false;
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JailTarget {
    One(JailType),
    Both,
}

/// One parsed line of the interactive shell
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShellCommand {
    Empty,
    Help,
    Exit,
    List,
    Jail { target: JailTarget, pid: u32 },
    Unjail { kind: Option<JailType>, pid: u32 },
}

pub fn parse_command(line: &str) -> Result<ShellCommand> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some(command) = parts.first() else {
        return Ok(ShellCommand::Empty);
    };

    match command.to_ascii_lowercase().as_str() {
        "help" => Ok(ShellCommand::Help),
        "exit" | "quit" => Ok(ShellCommand::Exit),
        "list" => Ok(ShellCommand::List),
        "jail" => {
            let [_, kind, pid] = parts.as_slice() else {
                return Err(JailError::Usage("jail <type> <pid>".to_string()));
            };
            let target = if kind.eq_ignore_ascii_case("both") {
                JailTarget::Both
            } else {
                JailTarget::One(kind.parse()?)
            };
            Ok(ShellCommand::Jail {
                target,
                pid: parse_pid(pid)?,
            })
        }
        "unjail" => match parts.as_slice() {
            [_, pid] => Ok(ShellCommand::Unjail {
                kind: None,
                pid: parse_pid(pid)?,
            }),
            [_, kind, pid] => Ok(ShellCommand::Unjail {
                kind: Some(kind.parse()?),
                pid: parse_pid(pid)?,
            }),
            _ => Err(JailError::Usage(
                "unjail <pid> or unjail <type> <pid>".to_string(),
            )),
        },
        other => Err(JailError::Usage(format!(
            "unknown command: {} (type 'help' for available commands)",
            other
        ))),
    }
}

/// Execute one command; `Ok(false)` means the shell should stop
pub fn execute<W: Write>(jailer: &Jailer, command: ShellCommand, out: &mut W) -> Result<bool> {
    match command {
        ShellCommand::Empty => {}
        ShellCommand::Help => write!(out, "{}", HELP)?,
        ShellCommand::Exit => {
            writeln!(out, "Cleaning up and exiting...")?;
            return Ok(false);
        }
        ShellCommand::List => {
            let rows = jailer.list_active()?;
            write!(out, "{}", render_rows(&rows))?;
        }
        ShellCommand::Jail {
            target: JailTarget::One(kind),
            pid,
        } => {
            let report = jailer.jail(pid, kind)?;
            writeln!(out, "{}", report)?;
        }
        ShellCommand::Jail {
            target: JailTarget::Both,
            pid,
        } => {
            for report in jailer.jail_both(pid)? {
                writeln!(out, "{}", report)?;
            }
        }
        ShellCommand::Unjail { kind, pid } => {
            let report = jailer.unjail(pid, kind)?;
            writeln!(out, "{}", report)?;
        }
    }
    Ok(true)
}

/// Read commands until `exit` or end of input.
///
/// Command errors are printed and the loop continues.
pub fn run_shell<R: BufRead, W: Write>(jailer: &Jailer, input: R, out: &mut W) -> Result<()> {
    let mut lines = input.lines();
    loop {
        write!(out, "{}", PROMPT)?;
        out.flush()?;

        let Some(line) = lines.next() else {
            writeln!(out)?;
            return Ok(());
        };
        let line = line?;

        let outcome = parse_command(&line).and_then(|command| execute(jailer, command, out));
        match outcome {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(JailError::ShuttingDown) => return Ok(()),
            Err(e) => writeln!(out, "Error: {}", e)?,
        }
    }
}

/// Table of active jails, one row per root ordered by pid
pub fn render_rows(rows: &[ActiveJail]) -> String {
    if rows.is_empty() {
        return "No active jails\n".to_string();
    }

    let mut table = String::from("Active jails:\n");
    table.push_str(&format!(
        "{:<8} {:<12} {:<15} {:<10} {:<20}\n",
        "PID", "Name", "Type", "Children", "Since"
    ));
    table.push_str(&"-".repeat(75));
    table.push('\n');
    for row in rows {
        table.push_str(&format!(
            "{:<8} {:<12} {:<15} {:<10} {:<20}\n",
            row.pid,
            row.name,
            row.restrictions.to_string(),
            row.child_count,
            format_elapsed(row.elapsed)
        ));
    }
    table
}
