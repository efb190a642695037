//! Pseudo-filesystem mount plan and fstab-style option parsing.
use std::path::PathBuf;

use nix::mount::MsFlags;
use serde::{Deserialize, Serialize};

/// One pseudo-filesystem the initramfs sets up and later hands to the real root.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PseudoMount {
    pub source: String,
    pub target: PathBuf,
    pub fs_type: String,
    #[serde(default)]
    pub options: String,
    /// When unset, failing to mount or move this entry is only logged.
    #[serde(default)]
    pub fatal_on_failure: bool,
}

impl PseudoMount {
    pub fn new(source: &str, target: &str, fs_type: &str, options: &str) -> Self {
        Self {
            source: source.to_string(),
            target: PathBuf::from(target),
            fs_type: fs_type.to_string(),
            options: options.to_string(),
            fatal_on_failure: false,
        }
    }
}

/// Ordered list of pseudo-filesystems, mounted front to back.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct MountPlan(pub Vec<PseudoMount>);

impl Default for MountPlan {
    fn default() -> Self {
        MountPlan(vec![
            PseudoMount::new("proc", "/proc", "proc", "nosuid,noexec,nodev"),
            PseudoMount::new("sysfs", "/sys", "sysfs", "nosuid,noexec,nodev"),
            PseudoMount::new("devtmpfs", "/dev", "devtmpfs", "nosuid,mode=0755"),
            PseudoMount::new("run", "/run", "tmpfs", "nosuid,nodev,mode=0755"),
        ])
    }
}

impl MountPlan {
    pub fn iter(&self) -> impl Iterator<Item = &PseudoMount> {
        self.0.iter()
    }
}

/// Split comma separated mount options into flags and the data string the
/// filesystem driver sees.
pub fn parse_mount_options(options: &str) -> (MsFlags, String) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();
    for s in options.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if let Some((is_clear, flag)) = match s {
            "defaults" => Some((false, MsFlags::empty())),
            "ro" => Some((false, MsFlags::MS_RDONLY)),
            "rw" => Some((true, MsFlags::MS_RDONLY)),
            "suid" => Some((true, MsFlags::MS_NOSUID)),
            "nosuid" => Some((false, MsFlags::MS_NOSUID)),
            "dev" => Some((true, MsFlags::MS_NODEV)),
            "nodev" => Some((false, MsFlags::MS_NODEV)),
            "exec" => Some((true, MsFlags::MS_NOEXEC)),
            "noexec" => Some((false, MsFlags::MS_NOEXEC)),
            "sync" => Some((false, MsFlags::MS_SYNCHRONOUS)),
            "async" => Some((true, MsFlags::MS_SYNCHRONOUS)),
            "dirsync" => Some((false, MsFlags::MS_DIRSYNC)),
            "mand" => Some((false, MsFlags::MS_MANDLOCK)),
            "nomand" => Some((true, MsFlags::MS_MANDLOCK)),
            "atime" => Some((true, MsFlags::MS_NOATIME)),
            "noatime" => Some((false, MsFlags::MS_NOATIME)),
            "diratime" => Some((true, MsFlags::MS_NODIRATIME)),
            "nodiratime" => Some((false, MsFlags::MS_NODIRATIME)),
            "relatime" => Some((false, MsFlags::MS_RELATIME)),
            "norelatime" => Some((true, MsFlags::MS_RELATIME)),
            "strictatime" => Some((false, MsFlags::MS_STRICTATIME)),
            "nostrictatime" => Some((true, MsFlags::MS_STRICTATIME)),
            "lazytime" => Some((false, MsFlags::MS_LAZYTIME)),
            "nolazytime" => Some((true, MsFlags::MS_LAZYTIME)),
            _ => None,
        } {
            if is_clear {
                flags &= !flag;
            } else {
                flags |= flag;
            }
        } else {
            data.push(s);
        };
    }
    (flags, data.join(","))
}
