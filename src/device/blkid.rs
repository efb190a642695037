use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::FileTypeExt;
use std::process::Command;
use std::{
    any::Any,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};

use super::{DeviceIds, DeviceProbe};

/// blkid exits with 2 when the device carries nothing it recognizes.
const BLKID_NOTHING_FOUND: i32 = 2;
const SYS_CLASS_BLOCK: &str = "/sys/class/block";
/// Kernel-internal devices that never hold a root filesystem found by id.
const SKIPPED_PREFIXES: &[&str] = &["ram", "loop"];

/// Looks devices up in a devtmpfs directory. Metadata comes from the udev
/// `disk/by-*` links when an event daemon populated them, otherwise from
/// running `blkid` (util-linux or BusyBox, both print `KEY="value"` pairs).
pub struct BlkidProbe {
    dev_dir: PathBuf,
    sys_block_dir: PathBuf,
}

impl BlkidProbe {
    pub fn new<P: Into<PathBuf>>(dev_dir: P) -> Self {
        Self {
            dev_dir: dev_dir.into(),
            sys_block_dir: PathBuf::from(SYS_CLASS_BLOCK),
        }
    }

    /// Whether a node is worth running blkid on. Empty devices (size 0 in
    /// sysfs, e.g. an unpopulated card reader) are skipped; an unreadable
    /// size keeps the node.
    fn is_candidate(&self, name: &str) -> bool {
        if SKIPPED_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
            return false;
        }
        match fs::read_to_string(self.sys_block_dir.join(name).join("size")) {
            Ok(size) => size.trim() != "0",
            Err(_) => true,
        }
    }

    fn from_disk_links(&self, device: &Path) -> DeviceIds {
        let mut ids = DeviceIds::default();
        let device = match fs::canonicalize(device) {
            Ok(device) => device,
            Err(_) => return ids,
        };

        for (dir, slot) in [
            ("by-uuid", &mut ids.uuid),
            ("by-partuuid", &mut ids.part_uuid),
            ("by-label", &mut ids.label),
        ] {
            let entries = match fs::read_dir(self.dev_dir.join("disk").join(dir)) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                if fs::canonicalize(entry.path()).ok().as_ref() == Some(&device) {
                    *slot = Some(unescape_udev(&entry.file_name().to_string_lossy()));
                    break;
                }
            }
        }

        ids
    }

    fn from_blkid(&self, device: &Path) -> Result<DeviceIds> {
        let output = match Command::new("blkid").arg(device).output() {
            Ok(output) => output,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                bail!("blkid is not available to identify {:?}", device)
            }
            Err(err) => return Err(err).with_context(|| format!("failed to run blkid {:?}", device)),
        };

        match output.status.code() {
            Some(0) => Ok(parse_blkid_output(&String::from_utf8_lossy(&output.stdout))),
            Some(BLKID_NOTHING_FOUND) => Ok(DeviceIds::default()),
            _ => bail!(
                "blkid {:?} failed with {}: {}",
                device,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        }
    }
}

impl DeviceProbe for BlkidProbe {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn block_devices(&self) -> Result<Vec<PathBuf>> {
        let mut devices = Vec::new();
        for dir in [self.dev_dir.clone(), self.dev_dir.join("mapper")] {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound && dir != self.dev_dir => continue,
                Err(err) => return Err(err).with_context(|| format!("failed to read {:?}", dir)),
            };
            for entry in entries.flatten() {
                let is_block = entry
                    .file_type()
                    .map_or(false, |file_type| file_type.is_block_device());
                if is_block && self.is_candidate(&entry.file_name().to_string_lossy()) {
                    devices.push(entry.path());
                }
            }
        }

        devices.sort();
        Ok(devices)
    }

    fn is_block_device(&self, path: &Path) -> bool {
        fs::metadata(path).map_or(false, |metadata| metadata.file_type().is_block_device())
    }

    fn identify(&self, device: &Path) -> Result<DeviceIds> {
        let ids = self.from_disk_links(device);
        if !ids.is_empty() {
            return Ok(ids);
        }
        self.from_blkid(device)
    }
}

/// Parse one line of blkid output such as
/// `/dev/sda1: LABEL="root" UUID="..." TYPE="ext4" PARTUUID="..."`.
pub fn parse_blkid_output(output: &str) -> DeviceIds {
    let mut ids = DeviceIds::default();
    let line = output.lines().next().unwrap_or("");
    let pairs = match line.find(": ") {
        Some(pos) => &line[pos + 2..],
        None => line,
    };

    for (key, value) in parse_pairs(pairs) {
        match key {
            "UUID" => ids.uuid = Some(value),
            "PARTUUID" => ids.part_uuid = Some(value),
            "LABEL" => ids.label = Some(value),
            "TYPE" => ids.fs_type = Some(value),
            _ => {}
        }
    }

    ids
}

fn parse_pairs(line: &str) -> Vec<(&str, String)> {
    let mut pairs = Vec::new();
    let mut rest = line.trim_start();

    while let Some(eq) = rest.find("=\"") {
        let key = rest[..eq].trim();
        let value_start = eq + 2;
        let mut value = String::new();
        let mut end = None;

        let mut chars = rest[value_start..].char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => {
                    if let Some((_, escaped)) = chars.next() {
                        value.push(escaped);
                    }
                }
                '"' => {
                    end = Some(value_start + i + 1);
                    break;
                }
                c => value.push(c),
            }
        }

        pairs.push((key, value));
        match end {
            Some(end) => rest = rest[end..].trim_start(),
            None => break,
        }
    }

    pairs
}

/// udev encodes unsafe characters in link names as `\xNN`.
fn unescape_udev(name: &str) -> String {
    let mut out = String::new();
    let mut rest = name;

    while let Some(pos) = rest.find("\\x") {
        out.push_str(&rest[..pos]);
        let byte = rest
            .get(pos + 2..pos + 4)
            .and_then(|hex| u8::from_str_radix(hex, 16).ok());
        match byte {
            Some(byte) => {
                out.push(byte as char);
                rest = &rest[pos + 4..];
            }
            None => {
                out.push_str("\\x");
                rest = &rest[pos + 2..];
            }
        }
    }
    out.push_str(rest);

    out
}
