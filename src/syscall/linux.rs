//! Implements Syscall trait for Linux systems
use std::ffi::CString;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::process::Command;
use std::{
    any::Any,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use nix::{
    errno::Errno,
    fcntl::{open, OFlag},
    kmod::{finit_module, ModuleInitFlags},
    mount::{mount, MsFlags},
    sys::{
        stat::{mknod, Mode, SFlag},
        statfs::{statfs, FsType, TMPFS_MAGIC},
        utsname::uname,
    },
    unistd::{chdir, chroot, close, dup2, execv, setsid},
};
use procfs::process::Process;

use super::Syscall;
use crate::kmod;
use crate::utils;

const PROC_FILESYSTEMS: &str = "/proc/filesystems";
const MODULES_ROOT: &str = "/lib/modules";
/// From linux/magic.h, nix only exports the tmpfs one.
const RAMFS_MAGIC: FsType = FsType(0x858458f6_u32 as _);

/// Empty structure to implement Syscall trait for
#[derive(Clone)]
pub struct LinuxSyscall;

impl LinuxSyscall {
    /// Load a module without the help of modprobe. Dependencies are not
    /// resolved, so the initramfs has to ship them pre-ordered in the module list.
    fn insert_module(&self, name: &str) -> Result<()> {
        let uts = uname()?;
        let modules_root = Path::new(MODULES_ROOT).join(uts.release());
        let path = kmod::find_module(&modules_root, name)
            .with_context(|| format!("module {} not found under {:?}", name, modules_root))?;

        let file = File::open(&path).with_context(|| format!("failed to open {:?}", path))?;
        match finit_module(&file, &CString::default(), ModuleInitFlags::empty()) {
            Ok(()) | Err(Errno::EEXIST) => Ok(()),
            Err(errno) => bail!("finit_module {:?} failed: {}", path, errno),
        }
    }

    /// Remove everything on the initramfs without descending into other
    /// mounts, the same way switch_root(8) frees the memory it occupies.
    fn delete_initramfs(dir: &Path, root_dev: u64) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                log::debug!("cannot read {:?}: {}", dir, err);
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let metadata = match fs::symlink_metadata(&path) {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            if metadata.dev() != root_dev {
                continue;
            }

            if metadata.is_dir() {
                Self::delete_initramfs(&path, root_dev);
                let _ = fs::remove_dir(&path);
            } else if let Err(err) = fs::remove_file(&path) {
                log::debug!("cannot remove {:?}: {}", path, err);
            }
        }
    }
}

impl Syscall for LinuxSyscall {
    /// To enable dynamic typing,
    /// see https://doc.rust-lang.org/std/any/index.html for more information
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()> {
        mount(source, target, fstype, flags, data)?;
        Ok(())
    }

    fn move_mount(&self, from: &Path, to: &Path) -> Result<()> {
        mount(
            Some(from),
            to,
            None::<&str>,
            MsFlags::MS_MOVE,
            None::<&str>,
        )?;
        Ok(())
    }

    fn mount_points(&self) -> Result<Vec<PathBuf>> {
        let mount_infos = Process::myself()?.mountinfo()?;
        Ok(mount_infos.into_iter().map(|mi| mi.mount_point).collect())
    }

    fn mknod(&self, path: &Path, kind: SFlag, perm: Mode, dev: u64) -> Result<()> {
        mknod(path, kind, perm, dev)?;
        Ok(())
    }

    /// Prefer modprobe from the initramfs, it knows about module dependencies
    /// and compressed modules. Fall back to finit_module when it is absent.
    fn load_module(&self, name: &str) -> Result<()> {
        match Command::new("modprobe").arg("-q").arg(name).status() {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => bail!("modprobe {} exited with {}", name, status),
            Err(err) if err.kind() == ErrorKind::NotFound => self.insert_module(name),
            Err(err) => Err(err).with_context(|| format!("failed to run modprobe {}", name)),
        }
    }

    fn filesystems(&self) -> Result<Vec<String>> {
        let content = fs::read_to_string(PROC_FILESYSTEMS)
            .with_context(|| format!("failed to read {}", PROC_FILESYSTEMS))?;
        Ok(utils::parse_filesystems(&content))
    }

    fn switch_root(&self, new_root: &Path, init: &Path, args: &[String]) -> Result<()> {
        chdir(new_root).with_context(|| format!("failed to chdir to {:?}", new_root))?;

        // pivot_root(2) refuses to work on the initramfs, so the classic
        // delete, move, chroot dance is used instead.
        let root_fs = statfs("/")?;
        if root_fs.filesystem_type() == RAMFS_MAGIC || root_fs.filesystem_type() == TMPFS_MAGIC {
            let root_dev = fs::symlink_metadata("/")?.dev();
            if fs::symlink_metadata(".")?.dev() == root_dev {
                bail!("{:?} is not a mount point", new_root);
            }
            Self::delete_initramfs(Path::new("/"), root_dev);
        } else {
            log::warn!("current root is not an initramfs, leaving its contents in place");
        }

        mount(
            Some("."),
            "/",
            None::<&str>,
            MsFlags::MS_MOVE,
            None::<&str>,
        )
        .context("failed to move new root onto /")?;
        chroot(".").context("failed to chroot into new root")?;
        chdir("/")?;

        let path = CString::new(init.as_os_str().as_bytes())?;
        let mut argv = vec![path.clone()];
        for arg in args {
            argv.push(CString::new(arg.as_bytes())?);
        }
        match execv(&path, &argv) {
            Ok(never) => match never {},
            Err(errno) => bail!("failed to execute {:?}: {}", init, errno),
        }
    }

    fn exec_shell(&self, shell: &Path, console: &Path) -> Result<()> {
        // fails with EPERM when we already lead a process group, which is fine
        if let Err(errno) = setsid() {
            log::debug!("setsid: {}", errno);
        }

        match open(console, OFlag::O_RDWR, Mode::empty()) {
            Ok(fd) => {
                // give the shell a controlling terminal so job control works
                if unsafe { libc::ioctl(fd, libc::TIOCSCTTY, 0) } < 0 {
                    log::debug!("TIOCSCTTY on {:?}: {}", console, Errno::last());
                }
                for target in 0..=2 {
                    dup2(fd, target)?;
                }
                if fd > 2 {
                    close(fd)?;
                }
            }
            // the kernel already opened its console as our stdio
            Err(errno) => log::warn!(
                "cannot open {:?} ({}), shell keeps the inherited stdio",
                console,
                errno
            ),
        }

        let path = CString::new(shell.as_os_str().as_bytes())?;
        match execv(&path, &[path.clone()]) {
            Ok(never) => match never {},
            Err(errno) => bail!("failed to execute {:?}: {}", shell, errno),
        }
    }
}
