use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use nix::mount::MsFlags;
use nix::sys::stat::{makedev, Mode, SFlag};
use tempfile::TempDir;

use super::{BootSequencer, BootState};
use crate::config::Config;
use crate::device::{test::TestDevices, DeviceIds};
use crate::error::{BootError, ParseError, ResolutionError};
use crate::mounts::{MountPlan, PseudoMount};
use crate::syscall::test::{MknodArgs, TestHelperSyscall};

const PSEUDO_TARGETS: [&str; 4] = ["/proc", "/sys", "/dev", "/run"];

fn config(dir: &Path) -> Config {
    Config {
        staging_dir: dir.join("staging"),
        dev_dir: dir.join("dev"),
        root_wait_secs: 1,
        poll_interval_ms: 100,
        ..Default::default()
    }
}

/// A sequencer whose default pseudo mounts are already in place, so nothing
/// outside `dir` is created.
fn sequencer(dir: &Path, cmdline: &str) -> BootSequencer {
    let sequencer = BootSequencer::new(config(dir), Some(cmdline.to_string()), Vec::new());
    syscall(&sequencer).set_mount_points(PSEUDO_TARGETS.iter().map(PathBuf::from).collect());
    sequencer
}

fn syscall(sequencer: &BootSequencer) -> &TestHelperSyscall {
    sequencer
        .syscall
        .as_any()
        .downcast_ref::<TestHelperSyscall>()
        .unwrap()
}

fn devices(sequencer: &BootSequencer) -> &TestDevices {
    sequencer
        .resolver
        .probe()
        .as_any()
        .downcast_ref::<TestDevices>()
        .unwrap()
}

fn install_init(staging: &Path, path: &str) -> Result<PathBuf> {
    let init = staging.join(path.trim_start_matches('/'));
    if let Some(parent) = init.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&init, b"#!/bin/sh\n")?;
    fs::set_permissions(&init, fs::Permissions::from_mode(0o755))?;
    Ok(init)
}

fn states_until_rescue(last: BootState) -> Vec<BootState> {
    let mut states = vec![BootState::Init];
    while states.last() != Some(&last) {
        let next = states.last().and_then(BootState::next).unwrap();
        states.push(next);
    }
    states.push(BootState::Rescue);
    states
}

#[test]
fn test_device_path_hands_off() -> Result<()> {
    let tmp = TempDir::new()?;
    let mut sequencer = sequencer(tmp.path(), "root=/dev/sda2 rootfstype=ext4 rw");
    devices(&sequencer).add_device("/dev/sda2", DeviceIds::default());
    let staging = tmp.path().join("staging");
    install_init(&staging, "/sbin/init")?;

    assert_eq!(sequencer.run()?, BootState::HandingOff);
    assert_eq!(
        sequencer.states(),
        &[
            BootState::Init,
            BootState::DriversLoaded,
            BootState::Resolving,
            BootState::MountingRoot,
            BootState::Relocating,
            BootState::HandingOff,
        ]
    );
    assert!(sequencer.failure().is_none());

    let syscall = syscall(&sequencer);
    let mounts = syscall.get_mount_args();
    assert_eq!(mounts.len(), 1);
    assert_eq!(mounts[0].source, Some(PathBuf::from("/dev/sda2")));
    assert_eq!(mounts[0].target, staging);
    assert_eq!(mounts[0].fstype.as_deref(), Some("ext4"));
    assert!(!mounts[0].flags.contains(MsFlags::MS_RDONLY));

    let handoff = syscall.get_switch_root_args();
    assert_eq!(handoff.len(), 1);
    assert_eq!(handoff[0].new_root, staging);
    assert_eq!(handoff[0].init, PathBuf::from("/sbin/init"));
    assert!(syscall.get_exec_shell_args().is_empty());
    Ok(())
}

#[test]
fn test_unresolved_uuid_goes_to_rescue() -> Result<()> {
    let tmp = TempDir::new()?;
    let mut sequencer = sequencer(tmp.path(), "root=UUID=1234-5678");
    devices(&sequencer).add_device(
        "/dev/sda1",
        DeviceIds {
            uuid: Some("8765-4321".to_string()),
            ..Default::default()
        },
    );

    let started = Instant::now();
    assert_eq!(sequencer.run()?, BootState::Rescue);
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed <= Duration::from_millis(1100), "took {:?}", elapsed);
    assert_eq!(sequencer.states(), states_until_rescue(BootState::Resolving));
    match sequencer.failure() {
        Some(BootError::Resolution(ResolutionError::Timeout { spec, .. })) => {
            assert_eq!(spec.to_string(), "UUID=1234-5678");
        }
        other => panic!("unexpected failure {:?}", other),
    }
    assert!(sequencer
        .failure()
        .map_or(false, |err| err.to_string().contains("UUID=1234-5678")));

    let shell = syscall(&sequencer).get_exec_shell_args();
    assert_eq!(
        shell,
        vec![(PathBuf::from("/bin/sh"), PathBuf::from("/dev/console"))]
    );
    Ok(())
}

#[test]
fn test_missing_init_goes_to_rescue() -> Result<()> {
    let tmp = TempDir::new()?;
    let mut sequencer = sequencer(tmp.path(), "root=/dev/sda2");
    devices(&sequencer).add_device("/dev/sda2", DeviceIds::default());
    syscall(&sequencer).set_filesystems(&["ext4"]);

    assert_eq!(sequencer.run()?, BootState::Rescue);
    assert_eq!(sequencer.states(), states_until_rescue(BootState::HandingOff));
    match sequencer.failure() {
        Some(BootError::Handoff { init, .. }) => assert_eq!(init, Path::new("/sbin/init")),
        other => panic!("unexpected failure {:?}", other),
    }
    assert!(syscall(&sequencer).get_switch_root_args().is_empty());
    assert_eq!(syscall(&sequencer).get_exec_shell_args().len(), 1);
    Ok(())
}

#[test]
fn test_unknown_root_fails_without_polling() -> Result<()> {
    let tmp = TempDir::new()?;
    let mut sequencer = sequencer(tmp.path(), "root=LVM=weird");

    let started = Instant::now();
    assert_eq!(sequencer.run()?, BootState::Rescue);
    assert!(started.elapsed() < Duration::from_millis(100));

    assert_eq!(sequencer.states(), states_until_rescue(BootState::Resolving));
    assert!(matches!(
        sequencer.failure(),
        Some(BootError::Resolution(ResolutionError::UnsupportedSpec(raw))) if raw == "LVM=weird"
    ));
    assert_eq!(devices(&sequencer).get_identify_calls(), 0);
    Ok(())
}

#[test]
fn test_missing_root_never_mounts() -> Result<()> {
    for cmdline in ["", "quiet splash", "rootfstype=ext4 ro init=/bin/sh"] {
        let tmp = TempDir::new()?;
        let mut sequencer = sequencer(tmp.path(), cmdline);

        assert_eq!(sequencer.run()?, BootState::Rescue);
        assert!(!sequencer.states().contains(&BootState::MountingRoot));
        assert!(matches!(sequencer.failure(), Some(BootError::Parse(_))));
        assert!(syscall(&sequencer).get_mount_args().is_empty());
    }
    Ok(())
}

#[test]
fn test_init_mounts_plan_and_creates_nodes() -> Result<()> {
    let tmp = TempDir::new()?;
    let mut config = config(tmp.path());
    let proc_dir = tmp.path().join("proc");
    let run_dir = tmp.path().join("run");
    config.mounts = MountPlan(vec![
        PseudoMount::new("proc", proc_dir.to_str().unwrap(), "proc", "nosuid,noexec,nodev"),
        PseudoMount::new("run", run_dir.to_str().unwrap(), "tmpfs", "nosuid,nodev,mode=0755"),
    ]);
    fs::create_dir_all(&config.dev_dir)?;
    fs::write(config.dev_dir.join("null"), b"")?;
    let dev_dir = config.dev_dir.clone();

    let mut sequencer = BootSequencer::new(config, Some("root=LVM=none".to_string()), Vec::new());
    syscall(&sequencer).set_mount_points(vec![proc_dir.clone()]);
    assert_eq!(sequencer.run()?, BootState::Rescue);

    let mounts = syscall(&sequencer).get_mount_args();
    assert_eq!(mounts[0].target, run_dir);
    assert_eq!(mounts[0].fstype.as_deref(), Some("tmpfs"));
    assert_eq!(mounts[0].flags, MsFlags::MS_NOSUID | MsFlags::MS_NODEV);
    assert_eq!(mounts[0].data.as_deref(), Some("mode=0755"));
    assert!(run_dir.is_dir());
    assert!(mounts.iter().all(|m| m.target != proc_dir));
    assert_eq!(
        sequencer.established.iter().map(|m| m.target.clone()).collect::<Vec<_>>(),
        vec![proc_dir, run_dir]
    );

    assert_eq!(
        syscall(&sequencer).get_mknod_args(),
        vec![MknodArgs {
            path: dev_dir.join("console"),
            kind: SFlag::S_IFCHR,
            perm: Mode::from_bits_truncate(0o600),
            dev: makedev(5, 1),
        }]
    );
    Ok(())
}

#[test]
fn test_fatal_pseudo_mount_goes_to_rescue() -> Result<()> {
    let tmp = TempDir::new()?;
    let mut config = config(tmp.path());
    let sys_dir = tmp.path().join("sys");
    let mut sys = PseudoMount::new("sysfs", sys_dir.to_str().unwrap(), "sysfs", "");
    sys.fatal_on_failure = true;
    config.mounts = MountPlan(vec![sys]);

    let mut sequencer = BootSequencer::new(config, Some("root=/dev/vda".to_string()), Vec::new());
    syscall(&sequencer).fail_mounts_of_type("sysfs");

    assert_eq!(sequencer.run()?, BootState::Rescue);
    assert_eq!(sequencer.states(), &[BootState::Init, BootState::Rescue]);
    assert!(matches!(sequencer.failure(), Some(BootError::Setup { .. })));
    Ok(())
}

#[test]
fn test_best_effort_failures_do_not_stop_boot() -> Result<()> {
    let tmp = TempDir::new()?;
    let mut config = config(tmp.path());
    config.modules = vec!["virtio_blk".to_string(), "ext4".to_string()];
    let run_dir = tmp.path().join("run");
    config.mounts.0[3] = PseudoMount::new("run", run_dir.to_str().unwrap(), "tmpfs", "");
    let mut sequencer = BootSequencer::new(
        config,
        Some("root=/dev/vda rootfstype=ext4 modules=nvme,ext4".to_string()),
        vec!["single".to_string()],
    );
    let syscall = syscall(&sequencer);
    syscall.set_mount_points(PSEUDO_TARGETS[..3].iter().map(PathBuf::from).collect());
    syscall.fail_mounts_of_type("tmpfs");
    syscall.fail_module("virtio_blk");
    syscall.fail_module("nvme");
    devices(&sequencer).add_device("/dev/vda", DeviceIds::default());
    let staging = tmp.path().join("staging");
    install_init(&staging, "/sbin/init")?;

    assert_eq!(sequencer.run()?, BootState::HandingOff);
    let syscall = self::syscall(&sequencer);
    assert_eq!(
        syscall.get_load_module_args(),
        vec!["virtio_blk", "ext4", "nvme"]
    );
    // run never got mounted, so only three mounts follow the root
    assert_eq!(
        syscall.get_move_mount_args(),
        vec![
            (PathBuf::from("/proc"), staging.join("proc")),
            (PathBuf::from("/sys"), staging.join("sys")),
            (PathBuf::from("/dev"), staging.join("dev")),
        ]
    );
    assert_eq!(syscall.get_switch_root_args()[0].args, vec!["single"]);
    Ok(())
}

#[test]
fn test_fs_type_fallback() -> Result<()> {
    let tmp = TempDir::new()?;
    let mut sequencer = sequencer(tmp.path(), "root=LABEL=rootfs ro rootflags=noatime,commit=30");
    devices(&sequencer).add_device(
        "/dev/sdb1",
        DeviceIds {
            label: Some("rootfs".to_string()),
            fs_type: Some("btrfs".to_string()),
            ..Default::default()
        },
    );
    let syscall = syscall(&sequencer);
    syscall.set_filesystems(&["ext4", "btrfs", "xfs"]);
    syscall.fail_mounts_of_type("btrfs");
    syscall.fail_mounts_of_type("ext4");
    install_init(&tmp.path().join("staging"), "/sbin/init")?;

    assert_eq!(sequencer.run()?, BootState::HandingOff);
    let mounts = self::syscall(&sequencer).get_mount_args();
    let tried: Vec<_> = mounts.iter().filter_map(|m| m.fstype.clone()).collect();
    assert_eq!(tried, vec!["btrfs", "ext4", "xfs"]);
    assert!(mounts
        .iter()
        .all(|m| m.flags == MsFlags::MS_RDONLY | MsFlags::MS_NOATIME));
    assert!(mounts
        .iter()
        .all(|m| m.data.as_deref() == Some("commit=30")));
    Ok(())
}

#[test]
fn test_mount_failure_goes_to_rescue() -> Result<()> {
    let tmp = TempDir::new()?;
    let mut sequencer = sequencer(tmp.path(), "root=/dev/sda2 rootfstype=ext4,xfs");
    devices(&sequencer).add_device("/dev/sda2", DeviceIds::default());
    syscall(&sequencer).fail_mounts_on(&tmp.path().join("staging"));

    assert_eq!(sequencer.run()?, BootState::Rescue);
    assert_eq!(sequencer.states(), states_until_rescue(BootState::MountingRoot));
    match sequencer.failure() {
        Some(BootError::Mount {
            device, fs_types, ..
        }) => {
            assert_eq!(device, Path::new("/dev/sda2"));
            assert_eq!(fs_types, "ext4,xfs");
        }
        other => panic!("unexpected failure {:?}", other),
    }
    assert_eq!(syscall(&sequencer).get_mount_args().len(), 2);
    Ok(())
}

#[test]
fn test_fatal_relocation_goes_to_rescue() -> Result<()> {
    let tmp = TempDir::new()?;
    let mut config = config(tmp.path());
    let mut proc = PseudoMount::new("proc", "/proc", "proc", "");
    proc.fatal_on_failure = true;
    config.mounts = MountPlan(vec![proc]);
    let staging = config.staging_dir.clone();

    let mut sequencer = BootSequencer::new(
        config,
        Some("root=/dev/sda2 rootfstype=ext4".to_string()),
        Vec::new(),
    );
    syscall(&sequencer).set_mount_points(vec![PathBuf::from("/proc")]);
    syscall(&sequencer).fail_mounts_on(&staging.join("proc"));
    devices(&sequencer).add_device("/dev/sda2", DeviceIds::default());

    assert_eq!(sequencer.run()?, BootState::Rescue);
    assert_eq!(sequencer.states(), states_until_rescue(BootState::Relocating));
    assert!(matches!(sequencer.failure(), Some(BootError::Relocate { .. })));
    Ok(())
}

#[test]
fn test_failed_switch_root_goes_to_rescue() -> Result<()> {
    let tmp = TempDir::new()?;
    let mut sequencer = sequencer(tmp.path(), "root=/dev/sda2 rootfstype=ext4");
    devices(&sequencer).add_device("/dev/sda2", DeviceIds::default());
    syscall(&sequencer).fail_switch_root();
    install_init(&tmp.path().join("staging"), "/sbin/init")?;

    assert_eq!(sequencer.run()?, BootState::Rescue);
    assert_eq!(sequencer.states(), states_until_rescue(BootState::HandingOff));
    assert!(matches!(sequencer.failure(), Some(BootError::Handoff { .. })));
    assert_eq!(syscall(&sequencer).get_switch_root_args().len(), 1);
    Ok(())
}

#[test]
fn test_rescue_after_relocation_restores_mounts() -> Result<()> {
    let tmp = TempDir::new()?;
    let mut sequencer = sequencer(tmp.path(), "root=/dev/sda2 rootfstype=ext4");
    devices(&sequencer).add_device("/dev/sda2", DeviceIds::default());
    let staging = tmp.path().join("staging");

    assert_eq!(sequencer.run()?, BootState::Rescue);
    assert_eq!(sequencer.states(), states_until_rescue(BootState::HandingOff));

    let moved_to = |target: &str| staging.join(target.trim_start_matches('/'));
    let mut expected: Vec<(PathBuf, PathBuf)> = PSEUDO_TARGETS
        .iter()
        .map(|target| (PathBuf::from(target), moved_to(target)))
        .collect();
    expected.extend(
        PSEUDO_TARGETS
            .iter()
            .rev()
            .map(|target| (moved_to(target), PathBuf::from(target))),
    );
    let syscall = syscall(&sequencer);
    assert_eq!(syscall.get_move_mount_args(), expected);
    assert_eq!(
        syscall.get_exec_shell_args(),
        vec![(PathBuf::from("/bin/sh"), PathBuf::from("/dev/console"))]
    );
    Ok(())
}

#[test]
fn test_unreadable_cmdline_still_loads_drivers() -> Result<()> {
    let tmp = TempDir::new()?;
    let mut config = config(tmp.path());
    config.modules = vec!["virtio_blk".to_string()];
    let mut sequencer = BootSequencer::new(config, None, Vec::new());
    sequencer.cmdline_path = tmp.path().join("missing");
    syscall(&sequencer).set_mount_points(PSEUDO_TARGETS.iter().map(PathBuf::from).collect());

    assert_eq!(sequencer.run()?, BootState::Rescue);
    assert_eq!(
        sequencer.states(),
        &[
            BootState::Init,
            BootState::DriversLoaded,
            BootState::Resolving,
            BootState::Rescue,
        ]
    );
    assert_eq!(syscall(&sequencer).get_load_module_args(), vec!["virtio_blk"]);
    assert!(matches!(
        sequencer.failure(),
        Some(BootError::Parse(ParseError::Unreadable { .. }))
    ));
    assert!(syscall(&sequencer).get_mount_args().is_empty());
    Ok(())
}

#[test]
fn test_init_symlink_and_permissions() -> Result<()> {
    let tmp = TempDir::new()?;
    let staging = tmp.path().join("staging");
    install_init(&staging, "/lib/systemd/systemd")?;
    fs::create_dir_all(staging.join("sbin"))?;
    // absolute target, must be read relative to the new root
    symlink("/lib/systemd/systemd", staging.join("sbin/init"))?;

    let mut linked = sequencer(tmp.path(), "root=/dev/sda2 rootfstype=ext4");
    devices(&linked).add_device("/dev/sda2", DeviceIds::default());
    assert_eq!(linked.run()?, BootState::HandingOff);

    let tmp = TempDir::new()?;
    let staging = tmp.path().join("staging");
    let init = install_init(&staging, "/sbin/init")?;
    fs::set_permissions(&init, fs::Permissions::from_mode(0o644))?;

    let mut not_executable = sequencer(tmp.path(), "root=/dev/sda2 rootfstype=ext4");
    devices(&not_executable).add_device("/dev/sda2", DeviceIds::default());
    assert_eq!(not_executable.run()?, BootState::Rescue);
    assert!(matches!(
        not_executable.failure(),
        Some(BootError::Handoff { .. })
    ));
    Ok(())
}

#[test]
fn test_custom_init_and_late_device() -> Result<()> {
    let tmp = TempDir::new()?;
    let mut sequencer = sequencer(
        tmp.path(),
        "root=PARTUUID=0A1B2C3D-02 rootwait=2 rootfstype=ext4 init=/usr/lib/systemd/systemd",
    );
    devices(&sequencer).add_device_after(
        "/dev/nvme0n1p2",
        DeviceIds {
            part_uuid: Some("0a1b2c3d-02".to_string()),
            ..Default::default()
        },
        Duration::from_millis(300),
    );
    install_init(&tmp.path().join("staging"), "/usr/lib/systemd/systemd")?;

    assert_eq!(sequencer.run()?, BootState::HandingOff);
    let syscall = syscall(&sequencer);
    assert_eq!(
        syscall.get_mount_args()[0].source,
        Some(PathBuf::from("/dev/nvme0n1p2"))
    );
    assert_eq!(
        syscall.get_switch_root_args()[0].init,
        PathBuf::from("/usr/lib/systemd/systemd")
    );
    Ok(())
}
