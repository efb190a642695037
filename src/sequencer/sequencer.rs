use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result};
use nix::{
    mount::MsFlags,
    sys::stat::{makedev, Mode, SFlag},
};

use super::BootState;
use crate::cmdline::{self, BootOptions};
use crate::config::Config;
use crate::device::create_probe;
use crate::error::{BootError, ParseError};
use crate::logger;
use crate::mounts::{parse_mount_options, PseudoMount};
use crate::resolver::{ResolvedDevice, RootResolver};
use crate::syscall::{syscall::create_syscall, Syscall};
use crate::utils::{self, PathBufExt};

/// Device nodes the rescue shell and the real init expect before udev runs.
const DEVICE_NODES: &[(&str, u64, u64, u32)] =
    &[("console", 5, 1, 0o600), ("null", 1, 3, 0o666)];

/// Drives the boot from an empty initramfs to the real init. Every failure
/// ends in the rescue shell, the automated path never resumes after that.
pub struct BootSequencer {
    pub(super) config: Config,
    /// Preset command line; read from `cmdline_path` once /proc is mounted otherwise.
    pub(super) cmdline: Option<String>,
    pub(super) cmdline_path: PathBuf,
    pub(super) init_args: Vec<String>,
    pub(super) syscall: Box<dyn Syscall>,
    pub(super) resolver: RootResolver,
    pub(super) states: Vec<BootState>,
    /// Pseudo mounts that are in place and have to follow the root.
    pub(super) established: Vec<PseudoMount>,
    /// Mounts moved below the staging root, as (original, moved to).
    pub(super) relocated: Vec<(PathBuf, PathBuf)>,
    pub(super) failure: Option<BootError>,
}

impl BootSequencer {
    pub fn new(config: Config, cmdline: Option<String>, init_args: Vec<String>) -> Self {
        let resolver = RootResolver::new(
            create_probe(&config.dev_dir),
            config.poll_interval(),
            config.root_wait(),
        );
        Self {
            config,
            cmdline,
            cmdline_path: PathBuf::from(cmdline::PROC_CMDLINE),
            init_args,
            syscall: create_syscall(),
            resolver,
            states: Vec::new(),
            established: Vec::new(),
            relocated: Vec::new(),
            failure: None,
        }
    }

    /// States visited so far, in order.
    pub fn states(&self) -> &[BootState] {
        &self.states
    }

    /// Why the sequence ended up in Rescue, if it did.
    pub fn failure(&self) -> Option<&BootError> {
        self.failure.as_ref()
    }

    /// Run the whole sequence. On a real system neither the handoff nor the
    /// rescue shell return, so getting an `Err` back means even the shell
    /// could not be started.
    pub fn run(&mut self) -> Result<BootState> {
        match self.boot() {
            Ok(state) => Ok(state),
            Err(err) => self.rescue(err),
        }
    }

    fn boot(&mut self) -> Result<BootState, BootError> {
        self.enter(BootState::Init);
        self.setup_pseudo_mounts()?;
        self.create_device_nodes();
        let cmdline = self.read_cmdline();
        match &cmdline {
            Ok(cmdline) if cmdline::has_flag(cmdline, "debug") => logger::raise_to_debug(),
            Ok(_) => {}
            Err(err) => log::warn!("{}", err),
        }

        self.enter(BootState::DriversLoaded);
        self.load_modules(cmdline.as_deref().unwrap_or_default());

        self.enter(BootState::Resolving);
        let options = self.resolver.parse(&cmdline?)?;
        if let Some(delay) = options.root_delay() {
            log::info!("rootdelay: sleeping {:?}", delay);
            thread::sleep(delay);
        }
        let device = self.resolver.resolve(options.root(), options.root_wait())?;
        log::info!("root {} is {:?}", options.root(), device.path());

        self.enter(BootState::MountingRoot);
        self.mount_root(&options, &device)?;

        self.enter(BootState::Relocating);
        self.relocate()?;

        self.enter(BootState::HandingOff);
        self.hand_off(&options)?;

        Ok(BootState::HandingOff)
    }

    fn enter(&mut self, state: BootState) {
        debug_assert!(
            self.states.last().map_or(state == BootState::Init, |last| {
                state == BootState::Rescue || last.next() == Some(state)
            }),
            "invalid transition to {} after {:?}",
            state,
            self.states
        );
        log::info!("entering {}", state);
        self.states.push(state);
    }

    fn setup_pseudo_mounts(&mut self) -> Result<(), BootError> {
        let mounted = self.syscall.mount_points().unwrap_or_else(|err| {
            log::debug!("cannot list mount points: {:#}", err);
            Vec::new()
        });

        for entry in self.config.mounts.iter() {
            if mounted.contains(&entry.target) {
                log::debug!("{:?} is already mounted", entry.target);
                self.established.push(entry.clone());
                continue;
            }

            match self.mount_pseudo(entry) {
                Ok(()) => self.established.push(entry.clone()),
                Err(err) if entry.fatal_on_failure => {
                    return Err(BootError::Setup {
                        step: format!("{} on {:?}", entry.fs_type, entry.target),
                        cause: err,
                    })
                }
                Err(err) => log::warn!("skipping {:?}: {:#}", entry.target, err),
            }
        }

        Ok(())
    }

    fn mount_pseudo(&self, entry: &PseudoMount) -> Result<()> {
        utils::create_dir_all(&entry.target)?;
        let (flags, data) = parse_mount_options(&entry.options);
        self.syscall
            .mount(
                Some(Path::new(&entry.source)),
                &entry.target,
                Some(entry.fs_type.as_str()),
                flags,
                Some(data.as_str()).filter(|d| !d.is_empty()),
            )
            .with_context(|| format!("failed to mount {} on {:?}", entry.fs_type, entry.target))
    }

    fn create_device_nodes(&self) {
        for (name, major, minor, mode) in DEVICE_NODES {
            let path = self.config.dev_dir.join(name);
            if path.exists() {
                continue;
            }
            if let Err(err) = self.syscall.mknod(
                &path,
                SFlag::S_IFCHR,
                Mode::from_bits_truncate(*mode),
                makedev(*major, *minor),
            ) {
                log::warn!("failed to create {:?}: {:#}", path, err);
            }
        }
    }

    fn read_cmdline(&mut self) -> Result<String, ParseError> {
        if let Some(cmdline) = &self.cmdline {
            return Ok(cmdline.clone());
        }

        let cmdline =
            cmdline::read_cmdline(&self.cmdline_path).map_err(|err| ParseError::Unreadable {
                path: self.cmdline_path.clone(),
                reason: format!("{:#}", err),
            })?;
        log::debug!("kernel command line: {}", cmdline);
        self.cmdline = Some(cmdline.clone());
        Ok(cmdline)
    }

    /// Loading is best effort, a missing module often just means the driver
    /// is built in.
    fn load_modules(&self, cmdline: &str) {
        let mut modules: Vec<String> = Vec::new();
        for module in self.config.modules.iter().cloned().chain(cmdline::modules(cmdline)) {
            if !modules.contains(&module) {
                modules.push(module);
            }
        }

        for module in &modules {
            match self.syscall.load_module(module) {
                Ok(()) => log::debug!("loaded module {}", module),
                Err(err) => log::warn!("failed to load module {}: {:#}", module, err),
            }
        }
    }

    /// Filesystem types to try, most specific first.
    fn candidate_fs_types(&self, options: &BootOptions, device: &ResolvedDevice) -> Vec<String> {
        if let Some(types) = options.root_fs_type() {
            return types
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
        }

        let mut types = Vec::new();
        match self.resolver.probe().identify(device.path()) {
            Ok(ids) => types.extend(ids.fs_type),
            Err(err) => log::debug!("cannot identify {:?}: {:#}", device.path(), err),
        }
        match self.syscall.filesystems() {
            Ok(known) => {
                for fs_type in known {
                    if !types.contains(&fs_type) {
                        types.push(fs_type);
                    }
                }
            }
            Err(err) => log::warn!("cannot list filesystems: {:#}", err),
        }
        types
    }

    fn mount_root(&self, options: &BootOptions, device: &ResolvedDevice) -> Result<(), BootError> {
        let staging = &self.config.staging_dir;
        let fs_types = self.candidate_fs_types(options, device);
        let mount_error = |cause: anyhow::Error| BootError::Mount {
            device: device.path().to_path_buf(),
            target: staging.clone(),
            fs_types: fs_types.join(","),
            cause,
        };

        utils::create_dir_all(staging).map_err(mount_error)?;

        let (mut flags, data) = parse_mount_options(options.root_flags().unwrap_or_default());
        if options.read_write() {
            flags.remove(MsFlags::MS_RDONLY);
        } else {
            flags.insert(MsFlags::MS_RDONLY);
        }
        let data = Some(data.as_str()).filter(|d| !d.is_empty());

        let mut last_err = anyhow::anyhow!("no filesystem type to try");
        for fs_type in &fs_types {
            match self
                .syscall
                .mount(Some(device.path()), staging, Some(fs_type.as_str()), flags, data)
            {
                Ok(()) => {
                    log::info!("mounted {:?} ({}) on {:?}", device.path(), fs_type, staging);
                    return Ok(());
                }
                Err(err) => {
                    log::debug!("mounting {:?} as {} failed: {:#}", device.path(), fs_type, err);
                    last_err = err;
                }
            }
        }

        Err(mount_error(last_err))
    }

    fn relocate(&mut self) -> Result<(), BootError> {
        let staging = &self.config.staging_dir;
        for entry in &self.established {
            let moved = staging.join_absolute_path(&entry.target).and_then(|to| {
                utils::create_dir_all(&to)?;
                self.syscall.move_mount(&entry.target, &to)?;
                Ok(to)
            });

            match moved {
                Ok(to) => {
                    log::debug!("moved {:?} to {:?}", entry.target, to);
                    self.relocated.push((entry.target.clone(), to));
                }
                Err(err) if entry.fatal_on_failure => {
                    return Err(BootError::Relocate {
                        from: entry.target.clone(),
                        to: staging.clone(),
                        cause: err,
                    })
                }
                Err(err) => log::warn!("leaving {:?} behind: {:#}", entry.target, err),
            }
        }

        Ok(())
    }

    fn hand_off(&self, options: &BootOptions) -> Result<(), BootError> {
        let staging = &self.config.staging_dir;
        let init = options.init();
        let handoff_error = |reason: String| BootError::Handoff {
            init: init.to_path_buf(),
            reason,
        };

        let resolved = utils::resolve_in_root(staging, init)
            .map_err(|err| handoff_error(format!("{:#}", err)))?;
        if !utils::is_executable(&resolved) {
            return Err(handoff_error(format!(
                "{:?} is not an executable file",
                resolved
            )));
        }

        log::info!("switching to {:?}, executing {:?}", staging, init);
        self.syscall
            .switch_root(staging, init, &self.init_args)
            .map_err(|err| handoff_error(format!("{:#}", err)))
    }

    /// Put relocated mounts back so the shell finds /dev/console and friends
    /// where it expects them.
    fn restore_mounts(&mut self) {
        while let Some((original, moved)) = self.relocated.pop() {
            match self.syscall.move_mount(&moved, &original) {
                Ok(()) => log::debug!("moved {:?} back to {:?}", moved, original),
                Err(err) => log::warn!("cannot move {:?} back: {:#}", moved, err),
            }
        }
    }

    fn rescue(&mut self, err: BootError) -> Result<BootState> {
        self.enter(BootState::Rescue);
        log::error!("boot failed: {}", err);
        self.failure = Some(err);
        self.restore_mounts();

        let shell = &self.config.rescue_shell;
        let console = &self.config.console;
        log::error!("starting rescue shell {:?} on {:?}", shell, console);
        self.syscall
            .exec_shell(shell, console)
            .with_context(|| format!("failed to start rescue shell {:?}", shell))?;

        Ok(BootState::Rescue)
    }
}
