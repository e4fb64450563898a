use crate::Fixture;
use jailer::cgroup::Topology;
use jailer::cli::run_shell;
use jailer::firewall::{NetworkFilter, NoFilter};
use jailer::{JailError, JailType, Jailer, Result};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// Counts calls so teardown ordering and multiplicity can be checked
#[derive(Default)]
struct CountingFilter {
    setups: Arc<AtomicUsize>,
    teardowns: Arc<AtomicUsize>,
    fail_teardown: bool,
}

impl NetworkFilter for CountingFilter {
    fn name(&self) -> &str {
        "counting"
    }

    fn setup(&mut self, topology: &Topology) -> Result<()> {
        assert!(!topology.network_cgroup_names().is_empty());
        self.setups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        if self.fail_teardown {
            return Err(JailError::Firewall("table busy".to_string()));
        }
        Ok(())
    }
}

#[test]
fn test_shutdown_releases_everything_once() {
    let fixture = Fixture::unified();
    fixture.spawn(100, 1, "server");
    fixture.spawn(101, 100, "worker");
    fixture.spawn(200, 1, "daemon");

    let filter = CountingFilter::default();
    let setups = Arc::clone(&filter.setups);
    let teardowns = Arc::clone(&filter.teardowns);
    let backend = fixture.backend();
    let jailer = Jailer::with_backend(backend.clone(), fixture.explorer(), Box::new(filter))
        .unwrap();
    assert_eq!(setups.load(Ordering::SeqCst), 1);

    jailer.jail(100, JailType::Network).unwrap();
    jailer.jail_both(200).unwrap();
    fixture.clear_procs(&backend);

    let report = jailer.shutdown().unwrap();
    assert_eq!(report.released, vec![100, 200]);
    assert!(report.is_clean());
    for pid in [100, 101, 200] {
        assert!(fixture.restored(pid), "pid {} not restored", pid);
    }
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);

    assert!(jailer.shutdown().is_none());
    drop(jailer);
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
}

#[test]
fn test_shutdown_continues_past_failures() {
    let fixture = Fixture::unified();
    fixture.spawn(100, 1, "server");
    fixture.spawn(200, 1, "daemon");

    let filter = CountingFilter {
        fail_teardown: true,
        ..CountingFilter::default()
    };
    let jailer =
        Jailer::with_backend(fixture.backend(), fixture.explorer(), Box::new(filter)).unwrap();
    jailer.jail(100, JailType::Cpu).unwrap();
    jailer.jail(200, JailType::Cpu).unwrap();
    std::fs::remove_dir_all(fixture.cgroup_root.join(crate::ORIGINAL_CGROUP)).unwrap();

    let report = jailer.shutdown().unwrap();
    assert_eq!(report.released, vec![100, 200]);
    assert_eq!(report.restore_failures.len(), 2);
    assert!(report.filter_error.is_some());
    // Occupied jail directories stay
    assert!(fixture.cgroup_root.join("jail-cpu").is_dir());
    assert!(jailer.record(100).is_none());
}

#[test]
fn test_requests_after_shutdown_are_refused() {
    let fixture = Fixture::unified();
    fixture.spawn(100, 1, "server");

    let jailer =
        Jailer::with_backend(fixture.backend(), fixture.explorer(), Box::new(NoFilter)).unwrap();
    jailer.shutdown();

    assert!(matches!(
        jailer.jail(100, JailType::Network),
        Err(JailError::ShuttingDown)
    ));
    assert!(matches!(jailer.jail_both(100), Err(JailError::ShuttingDown)));
    assert!(matches!(
        jailer.unjail(100, Some(JailType::Cpu)),
        Err(JailError::ShuttingDown)
    ));
    assert!(jailer.record(100).is_none());
}

#[test]
fn test_concurrent_shutdown_runs_once() {
    let fixture = Fixture::unified();
    fixture.spawn(100, 1, "server");

    let filter = CountingFilter::default();
    let teardowns = Arc::clone(&filter.teardowns);
    let jailer = Arc::new(
        Jailer::with_backend(fixture.backend(), fixture.explorer(), Box::new(filter)).unwrap(),
    );
    jailer.jail(100, JailType::Cpu).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let jailer = Arc::clone(&jailer);
            thread::spawn(move || jailer.shutdown().is_some())
        })
        .collect();
    let winners = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .filter(|won| *won)
        .count();

    assert_eq!(winners, 1);
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
}

#[test]
fn test_shell_session() {
    let fixture = Fixture::unified();
    fixture.spawn(100, 1, "server");
    fixture.spawn(101, 100, "worker");

    let jailer =
        Jailer::with_backend(fixture.backend(), fixture.explorer(), Box::new(NoFilter)).unwrap();
    let input = Cursor::new(
        "jail n 100\njail both 100\njail c 100\nlist\nbogus\nunjail network 100\nunjail 100\nlist\nexit\njail c 100\n",
    );
    let mut out = Vec::new();
    run_shell(&jailer, input, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();

    assert!(out.contains("Successfully jailed process 100 (server) with network jail, 1 of 1 descendants moved"));
    assert!(out.contains("Error: Process 100 is already jailed with network jail"));
    assert!(out.contains("Added cpu jail to process 100 (server)"));
    assert!(out.contains("network,cpu"));
    assert!(out.contains("Error: usage: unknown command: bogus"));
    assert!(out.contains("Removed network jail from process 100 (server), remaining jails: cpu"));
    assert!(out.contains("Successfully unjailed process 100 (server)"));
    assert!(out.contains("No active jails"));
    assert!(out.contains("Cleaning up and exiting..."));
    // Nothing after exit is executed
    assert!(jailer.record(100).is_none());
}

#[test]
fn test_shell_stops_at_end_of_input() {
    let fixture = Fixture::unified();
    fixture.spawn(100, 1, "server");

    let jailer =
        Jailer::with_backend(fixture.backend(), fixture.explorer(), Box::new(NoFilter)).unwrap();
    let mut out = Vec::new();
    run_shell(&jailer, Cursor::new("jail cpu 100\n"), &mut out).unwrap();

    assert!(jailer.record(100).is_some());
    assert!(jailer.shutdown().is_some());
    assert!(jailer.record(100).is_none());
}
