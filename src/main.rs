/// jailer: interactive process quarantine
///
/// Moves running processes, together with their descendants, into cgroups that
/// drop their network traffic and/or throttle them to 1% of one core.
///
/// # Usage
/// ```bash
/// sudo jailer
/// $> jail network 1234
/// $> jail cpu 1234
/// $> list
/// $> unjail 1234
/// $> exit
/// ```
use anyhow::{bail, Context, Result};
use clap::Parser;
use jailer::cli::{run_shell, Cli};
use jailer::firewall::build_filter;
use jailer::reconcile::spawn_sweeper;
use jailer::shutdown::{block_termination_signals, spawn_signal_listener};
use jailer::Jailer;
use nix::unistd::geteuid;
use std::io;
use std::sync::Arc;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let config = cli.load_config().context("Invalid configuration")?;

    if config.require_root && !geteuid().is_root() {
        bail!("This tool requires root privileges. Please run with sudo or as root user");
    }

    let filter = build_filter(config.firewall).context("Error detecting firewall tool")?;

    // Before any thread exists, so only the listener ever sees these signals
    let mask = block_termination_signals().context("Failed to block termination signals")?;

    let jailer = Arc::new(Jailer::start(&config, filter).context("Error initializing jails")?);
    spawn_signal_listener(mask, Arc::clone(&jailer)).context("Failed to start signal listener")?;

    if let Some(interval) = config.sweep_interval() {
        spawn_sweeper(&jailer, interval).context("Failed to start background sweeper")?;
        log::info!("Background sweep every {}s", interval.as_secs());
    }

    println!("Jailer v{}", env!("CARGO_PKG_VERSION"));
    println!("Type 'help' for available commands or 'exit' to quit");
    println!();

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    run_shell(&jailer, stdin.lock(), &mut stdout)?;

    if let Some(report) = jailer.shutdown() {
        println!("{}", report);
    }
    println!("Goodbye!");
    Ok(())
}
