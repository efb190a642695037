//! Utility functionality

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};

/// Linux gives up after this many symlinks while resolving one path.
const MAX_SYMLINK_HOPS: usize = 40;

pub trait PathBufExt {
    fn join_absolute_path(&self, p: &Path) -> Result<PathBuf>;
}

impl PathBufExt for PathBuf {
    fn join_absolute_path(&self, p: &Path) -> Result<PathBuf> {
        if !p.is_absolute() && !p.as_os_str().is_empty() {
            bail!(
                "cannot join {:?} because it is not the absolute path.",
                p.display()
            )
        }
        Ok(PathBuf::from(format!("{}{}", self.display(), p.display())))
    }
}

pub fn create_dir_all<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    fs::create_dir_all(path).with_context(|| format!("failed to create directory {:?}", path))
}

/// Resolve `path` as if `root` were `/`: absolute symlink targets are
/// rebased onto `root` and `..` never climbs above it. Components that do
/// not exist are kept as they are.
pub fn resolve_in_root(root: &Path, path: &Path) -> Result<PathBuf> {
    let mut pending: Vec<PathBuf> = path
        .components()
        .rev()
        .map(|c| PathBuf::from(c.as_os_str()))
        .collect();
    let mut resolved = PathBuf::new();
    let mut hops = 0;

    while let Some(part) = pending.pop() {
        match part.components().next() {
            Some(Component::RootDir) | Some(Component::Prefix(_)) => resolved = PathBuf::new(),
            Some(Component::ParentDir) => {
                resolved.pop();
            }
            Some(Component::CurDir) | None => {}
            Some(Component::Normal(name)) => {
                let candidate = resolved.join(name);
                let on_host = root.join(&candidate);
                match fs::symlink_metadata(&on_host) {
                    Ok(metadata) if metadata.file_type().is_symlink() => {
                        hops += 1;
                        if hops > MAX_SYMLINK_HOPS {
                            bail!("too many levels of symbolic links in {:?}", path);
                        }
                        let target = fs::read_link(&on_host)
                            .with_context(|| format!("failed to read link {:?}", on_host))?;
                        pending.extend(
                            target
                                .components()
                                .rev()
                                .map(|c| PathBuf::from(c.as_os_str())),
                        );
                    }
                    _ => resolved = candidate,
                }
            }
        }
    }

    Ok(root.join(resolved))
}

/// A regular file with at least one execute bit set.
pub fn is_executable(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(metadata) => metadata.is_file() && metadata.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

/// Parse /proc/filesystems, keeping only filesystems that need a block device.
pub fn parse_filesystems(content: &str) -> Vec<String> {
    content
        .lines()
        .filter(|line| !line.starts_with("nodev"))
        .map(|line| line.trim())
        .filter(|fs| !fs.is_empty())
        .map(|fs| fs.to_string())
        .collect()
}
