//! Optional JSON configuration baked into the initramfs.
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::mounts::MountPlan;

pub const DEFAULT_PATH: &str = "/etc/bootinit.json";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Where the real root is mounted before the handoff.
    pub staging_dir: PathBuf,
    pub dev_dir: PathBuf,
    /// Loaded before resolving, in order.
    pub modules: Vec<String>,
    pub root_wait_secs: u64,
    pub poll_interval_ms: u64,
    pub rescue_shell: PathBuf,
    pub console: PathBuf,
    pub mounts: MountPlan,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::from("/staging"),
            dev_dir: PathBuf::from("/dev"),
            modules: Vec::new(),
            root_wait_secs: 10,
            poll_interval_ms: 200,
            rescue_shell: PathBuf::from("/bin/sh"),
            console: PathBuf::from("/dev/console"),
            mounts: MountPlan::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {:?}", path))?;
        Ok(config)
    }

    /// A missing file means defaults. A broken one is reported and also
    /// falls back to defaults.
    pub fn load_or_default(path: &Path) -> Self {
        match fs::metadata(path) {
            Err(err) if err.kind() == ErrorKind::NotFound => {
                log::debug!("no config at {:?}, using defaults", path);
                return Self::default();
            }
            _ => {}
        }

        match Self::load(path) {
            Ok(config) => config,
            Err(err) => {
                log::warn!("{:#}, using defaults", err);
                Self::default()
            }
        }
    }

    pub fn root_wait(&self) -> Duration {
        Duration::from_secs(self.root_wait_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
