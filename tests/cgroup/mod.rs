use crate::{procs_of, Fixture, ORIGINAL_CGROUP};
use jailer::cgroup::{CgroupBackend, CgroupModel};
use jailer::process::OriginalLocation;
use jailer::cgroup::Topology;
use jailer::{JailError, RestrictionSet};
use serial_test::serial;
use std::fs;
use std::path::Path;

fn v1_original() -> OriginalLocation {
    OriginalLocation::parse(&format!(
        "5:cpu,cpuacct:/{}\n3:net_cls,net_prio:/\n",
        ORIGINAL_CGROUP
    ))
    .unwrap()
}

#[test]
fn test_detect_prefers_unified() {
    let fixture = Fixture::unified();
    // A stray v1-looking layout must not win over cgroup.controllers
    fs::create_dir_all(fixture.cgroup_root.join("cpu")).unwrap();
    fs::create_dir_all(fixture.cgroup_root.join("net_cls")).unwrap();

    let topology = CgroupBackend::detect(&fixture.cgroup_root).unwrap();
    assert_eq!(topology.model(), CgroupModel::Unified);
}

#[test]
fn test_detect_per_subsystem() {
    let fixture = Fixture::per_subsystem();
    let topology = CgroupBackend::detect(&fixture.cgroup_root).unwrap();
    assert_eq!(topology.model(), CgroupModel::PerSubsystem);
    assert_eq!(topology.class_id(), Some(0x0010_0001));
}

#[test]
fn test_detect_requires_both_v1_subsystems() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("cpu")).unwrap();

    let result = CgroupBackend::detect(dir.path());
    assert!(matches!(result, Err(JailError::UnsupportedPlatform(_))));
}

#[test]
fn test_initialize_unified() {
    let fixture = Fixture::unified();
    let backend = fixture.backend();
    let root = &fixture.cgroup_root;

    for name in ["jail-network", "jail-cpu", "jail-network-cpu"] {
        assert!(root.join(name).is_dir(), "{} missing", name);
    }
    assert_eq!(
        fs::read_to_string(root.join("jail-cpu/cpu.max")).unwrap(),
        "1000 100000\n"
    );
    assert_eq!(
        fs::read_to_string(root.join("jail-network-cpu/cpu.max")).unwrap(),
        "1000 100000\n"
    );
    assert!(!root.join("jail-network/cpu.max").exists());
    assert!(root.join("cgroup.subtree_control").is_file());
    assert_eq!(backend.current_class_id(), None);
}

#[test]
fn test_initialize_per_subsystem() {
    let fixture = Fixture::per_subsystem();
    let backend = fixture.backend();
    let root = &fixture.cgroup_root;

    for cpu_path in ["cpu/jail-cpu", "cpu/jail-network-cpu"] {
        let dir = root.join(cpu_path);
        assert_eq!(
            fs::read_to_string(dir.join("cpu.cfs_period_us")).unwrap(),
            "100000\n"
        );
        assert_eq!(
            fs::read_to_string(dir.join("cpu.cfs_quota_us")).unwrap(),
            "1000\n"
        );
    }
    for net_path in ["net_cls/jail-network", "net_cls/jail-network-cpu"] {
        assert_eq!(
            fs::read_to_string(root.join(net_path).join("net_cls.classid")).unwrap(),
            "1048577\n"
        );
    }
    assert_eq!(backend.current_class_id(), Some(1_048_577));
}

#[test]
fn test_initialize_is_idempotent() {
    let fixture = Fixture::unified();
    let backend = fixture.backend();
    assert!(backend.initialize().is_ok());
}

#[test]
fn test_move_combined_per_subsystem_writes_both_hierarchies() {
    let fixture = Fixture::per_subsystem();
    let backend = fixture.backend();

    backend.move_to(42, RestrictionSet::BOTH).unwrap();

    assert_eq!(
        procs_of(&fixture.cgroup_root.join("net_cls/jail-network-cpu")),
        vec![42]
    );
    assert_eq!(
        procs_of(&fixture.cgroup_root.join("cpu/jail-network-cpu")),
        vec![42]
    );
}

#[test]
fn test_move_partial_failure() {
    let fixture = Fixture::per_subsystem();
    let backend = fixture.backend();

    let procs = fixture.cgroup_root.join("cpu/jail-network-cpu/cgroup.procs");
    let _ = fs::remove_file(&procs);
    fs::create_dir_all(&procs).unwrap();

    match backend.move_to(42, RestrictionSet::BOTH) {
        Err(JailError::PartialMove { pid, path, .. }) => {
            assert_eq!(pid, 42);
            assert_eq!(path, fixture.cgroup_root.join("cpu/jail-network-cpu"));
        }
        other => panic!("expected partial move, got {:?}", other),
    }
    assert_eq!(
        procs_of(&fixture.cgroup_root.join("net_cls/jail-network-cpu")),
        vec![42]
    );
}

#[test]
fn test_move_total_failure() {
    let fixture = Fixture::unified();
    let backend = fixture.backend();
    fs::remove_dir_all(fixture.cgroup_root.join("jail-network")).unwrap();

    assert!(matches!(
        backend.move_to(42, RestrictionSet::NETWORK),
        Err(JailError::Move { pid: 42, .. })
    ));
}

#[test]
fn test_move_empty_set_rejected() {
    let fixture = Fixture::unified();
    let backend = fixture.backend();
    assert!(matches!(
        backend.move_to(42, RestrictionSet::EMPTY),
        Err(JailError::Cgroup(_))
    ));
}

#[test]
fn test_restore_per_subsystem_uses_controller_paths() {
    let fixture = Fixture::per_subsystem();
    let backend = fixture.backend();
    backend.restore(42, &v1_original()).unwrap();
    assert!(fixture.restored(42));
}

#[test]
fn test_restore_missing_original() {
    let fixture = Fixture::unified();
    let backend = fixture.backend();
    let original = OriginalLocation::unified_only("/gone.slice/app.scope");

    assert!(matches!(
        backend.restore(42, &original),
        Err(JailError::Restore { pid: 42, .. })
    ));
}

#[test]
fn test_reclaim_keeps_occupied_jail() {
    let fixture = Fixture::unified();
    let backend = fixture.backend();
    backend.move_to(42, RestrictionSet::CPU).unwrap();

    let path = fixture.cgroup_root.join("jail-cpu");
    assert!(!backend.reclaim_if_empty(&path).unwrap());
    assert!(path.is_dir());
}

#[test]
fn test_reclaim_skips_directory_without_procs() {
    let fixture = Fixture::unified();
    let backend = fixture.backend();

    let path = fixture.cgroup_root.join("not-a-cgroup");
    fs::create_dir_all(&path).unwrap();
    assert!(!backend.reclaim_if_empty(&path).unwrap());
    assert!(path.is_dir());
}

#[test]
fn test_move_between_releases_dropped_cpu_hierarchy() {
    let fixture = Fixture::per_subsystem();
    let backend = fixture.backend();
    let root = &fixture.cgroup_root;

    backend
        .move_between(42, RestrictionSet::BOTH, RestrictionSet::NETWORK, &v1_original())
        .unwrap();

    assert_eq!(procs_of(&root.join("net_cls/jail-network")), vec![42]);
    assert_eq!(procs_of(&root.join("cpu").join(ORIGINAL_CGROUP)), vec![42]);
    assert!(procs_of(&root.join("net_cls")).is_empty());
}

#[test]
fn test_move_between_releases_dropped_net_cls_hierarchy() {
    let fixture = Fixture::per_subsystem();
    let backend = fixture.backend();
    let root = &fixture.cgroup_root;

    backend
        .move_between(42, RestrictionSet::BOTH, RestrictionSet::CPU, &v1_original())
        .unwrap();

    assert_eq!(procs_of(&root.join("cpu/jail-cpu")), vec![42]);
    assert_eq!(procs_of(&root.join("net_cls")), vec![42]);
    assert!(procs_of(&root.join("cpu").join(ORIGINAL_CGROUP)).is_empty());
}

#[test]
fn test_move_between_upgrade_releases_nothing() {
    let fixture = Fixture::per_subsystem();
    let backend = fixture.backend();

    backend
        .move_between(42, RestrictionSet::NETWORK, RestrictionSet::BOTH, &v1_original())
        .unwrap();

    assert!(fixture.resides_in(&backend, 42, RestrictionSet::BOTH));
    assert!(!fixture.restored(42));
    assert!(procs_of(&fixture.cgroup_root.join("net_cls")).is_empty());
}

#[test]
fn test_move_between_unified_is_a_single_write() {
    let fixture = Fixture::unified();
    let backend = fixture.backend();
    let original = OriginalLocation::unified_only(&format!("/{}", ORIGINAL_CGROUP));

    backend
        .move_between(42, RestrictionSet::BOTH, RestrictionSet::CPU, &original)
        .unwrap();

    assert_eq!(procs_of(&fixture.cgroup_root.join("jail-cpu")), vec![42]);
    assert!(!fixture.restored(42));
}

#[test]
fn test_move_between_failed_release_is_partial() {
    let fixture = Fixture::per_subsystem();
    let backend = fixture.backend();
    fs::remove_dir_all(fixture.cgroup_root.join("cpu").join(ORIGINAL_CGROUP)).unwrap();

    match backend.move_between(42, RestrictionSet::BOTH, RestrictionSet::NETWORK, &v1_original()) {
        Err(JailError::PartialMove { pid, path, .. }) => {
            assert_eq!(pid, 42);
            assert_eq!(path, fixture.cgroup_root.join("cpu").join(ORIGINAL_CGROUP));
        }
        other => panic!("expected partial move, got {:?}", other),
    }
    assert_eq!(
        procs_of(&fixture.cgroup_root.join("net_cls/jail-network")),
        vec![42]
    );
}

#[test]
fn test_move_between_total_failure_releases_nothing() {
    let fixture = Fixture::per_subsystem();
    let backend = fixture.backend();
    fs::remove_dir_all(fixture.cgroup_root.join("net_cls/jail-network")).unwrap();

    assert!(matches!(
        backend.move_between(42, RestrictionSet::BOTH, RestrictionSet::NETWORK, &v1_original()),
        Err(JailError::Move { pid: 42, .. })
    ));
    assert!(procs_of(&fixture.cgroup_root.join("cpu").join(ORIGINAL_CGROUP)).is_empty());
}

/// Only a real cgroupfs lets an empty cgroup directory be removed while its
/// kernel-provided control files are listed, so this needs a writable host
/// hierarchy and passes trivially elsewhere.
#[test]
#[serial]
fn test_reclaim_removes_empty_host_cgroup() {
    let root = Path::new("/sys/fs/cgroup");
    let path = root.join(format!("jailer-reclaim-{}", std::process::id()));
    if !root.join("cgroup.controllers").is_file() || fs::create_dir(&path).is_err() {
        eprintln!("skipping: no writable cgroup v2 hierarchy at {}", root.display());
        return;
    }

    let backend = CgroupBackend::new(Topology::unified(root));
    let removed = backend.reclaim_if_empty(&path);
    if path.is_dir() {
        let _ = fs::remove_dir(&path);
    }
    assert!(removed.unwrap());
    assert!(!path.exists());
}
