//! An interface trait so that rest of bootinit can call
//! necessary functions without having to worry about their
//! implementation details
use std::{
    any::Any,
    path::{Path, PathBuf},
};

use anyhow::Result;
use nix::{
    mount::MsFlags,
    sys::stat::{Mode, SFlag},
};

use crate::syscall::{linux::LinuxSyscall, test::TestHelperSyscall};

/// This specifies the kernel and userspace primitives the boot sequence
/// drives: mounting, device nodes, module loading and the final exec.
pub trait Syscall {
    fn as_any(&self) -> &dyn Any;
    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()>;
    /// Atomically move an existing mount to a new location (MS_MOVE).
    fn move_mount(&self, from: &Path, to: &Path) -> Result<()>;
    /// Mount points currently visible to this process.
    fn mount_points(&self) -> Result<Vec<PathBuf>>;
    fn mknod(&self, path: &Path, kind: SFlag, perm: Mode, dev: u64) -> Result<()>;
    fn load_module(&self, name: &str) -> Result<()>;
    /// Block device filesystems registered with the running kernel.
    fn filesystems(&self) -> Result<Vec<String>>;
    /// Replace the initramfs with `new_root` and exec `init` inside it.
    /// Only returns on failure.
    fn switch_root(&self, new_root: &Path, init: &Path, args: &[String]) -> Result<()>;
    /// Exec an interactive shell bound to `console`. Only returns on failure.
    fn exec_shell(&self, shell: &Path, console: &Path) -> Result<()>;
}

pub fn create_syscall() -> Box<dyn Syscall> {
    if cfg!(test) {
        Box::new(TestHelperSyscall::default())
    } else {
        Box::new(LinuxSyscall)
    }
}
