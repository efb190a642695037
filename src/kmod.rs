//! Kernel module lookup for initramfs images that ship raw `.ko` files
//! but no modprobe.
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Kernel module names treat `-` and `_` as the same character.
pub fn normalize_module_name(name: &str) -> String {
    name.replace('-', "_")
}

/// Find `<name>.ko` anywhere below `modules_root`. Entries are visited in
/// sorted order so that duplicates resolve the same way on every boot.
pub fn find_module(modules_root: &Path, name: &str) -> Option<PathBuf> {
    let wanted = format!("{}.ko", normalize_module_name(name));
    WalkDir::new(modules_root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .find(|entry| {
            entry
                .file_name()
                .to_str()
                .map_or(false, |file_name| normalize_module_name(file_name) == wanted)
        })
        .map(|entry| entry.into_path())
}
