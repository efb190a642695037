//! Kernel command line parsing.
//!
//! The kernel passes one flat string. Only the handful of parameters that
//! decide how the real root is found and mounted are interpreted here,
//! everything else is ignored so that new or foreign parameters never stop
//! a boot.
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::error::ParseError;

pub const PROC_CMDLINE: &str = "/proc/cmdline";
pub const DEFAULT_INIT: &str = "/sbin/init";

/// How the root filesystem is addressed on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootSpec {
    DevicePath(PathBuf),
    Uuid(String),
    PartUuid(String),
    Label(String),
    /// Anything the resolver cannot interpret, kept verbatim for diagnostics.
    Unknown(String),
}

impl RootSpec {
    pub fn parse(value: &str) -> RootSpec {
        let tagged = [
            ("UUID=", RootSpec::Uuid as fn(String) -> RootSpec),
            ("PARTUUID=", RootSpec::PartUuid),
            ("LABEL=", RootSpec::Label),
        ];
        for (prefix, make) in tagged.iter() {
            if let Some(payload) = value.strip_prefix(prefix) {
                return if payload.is_empty() {
                    RootSpec::Unknown(value.to_string())
                } else {
                    make(payload.to_string())
                };
            }
        }

        if value.starts_with('/') {
            RootSpec::DevicePath(PathBuf::from(value))
        } else {
            RootSpec::Unknown(value.to_string())
        }
    }

    /// Specs that need the device metadata instead of just a path.
    pub fn needs_probe(&self) -> bool {
        matches!(
            self,
            RootSpec::Uuid(_) | RootSpec::PartUuid(_) | RootSpec::Label(_)
        )
    }
}

impl Display for RootSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DevicePath(path) => write!(f, "{}", path.display()),
            Self::Uuid(uuid) => write!(f, "UUID={}", uuid),
            Self::PartUuid(uuid) => write!(f, "PARTUUID={}", uuid),
            Self::Label(label) => write!(f, "LABEL={}", label),
            Self::Unknown(raw) => write!(f, "{}", raw),
        }
    }
}

/// Boot parameters relevant to mounting the real root. Built once from the
/// command line and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootOptions {
    root: RootSpec,
    root_fs_type: Option<String>,
    root_flags: Option<String>,
    read_write: bool,
    init: PathBuf,
    root_wait: Duration,
    root_delay: Option<Duration>,
}

impl BootOptions {
    pub fn root(&self) -> &RootSpec {
        &self.root
    }

    pub fn root_fs_type(&self) -> Option<&str> {
        self.root_fs_type.as_deref()
    }

    pub fn root_flags(&self) -> Option<&str> {
        self.root_flags.as_deref()
    }

    pub fn read_write(&self) -> bool {
        self.read_write
    }

    pub fn init(&self) -> &Path {
        &self.init
    }

    pub fn root_wait(&self) -> Duration {
        self.root_wait
    }

    pub fn root_delay(&self) -> Option<Duration> {
        self.root_delay
    }
}

/// Parse a command line. `default_wait` is used unless `rootwait=N` says
/// otherwise. Only a missing `root=` is an error.
pub fn parse(cmdline: &str, default_wait: Duration) -> Result<BootOptions, ParseError> {
    let mut root = None;
    let mut root_fs_type = None;
    let mut root_flags = None;
    let mut read_write = true;
    let mut init = PathBuf::from(DEFAULT_INIT);
    let mut root_wait = default_wait;
    let mut root_delay = None;

    for token in split(cmdline) {
        let (key, value) = match token.split_once('=') {
            Some((key, value)) => (key, Some(value)),
            None => (token.as_str(), None),
        };

        match (key, value) {
            ("root", Some(value)) => root = Some(RootSpec::parse(value)),
            ("root", None) => root = Some(RootSpec::Unknown(String::new())),
            ("rootfstype", Some(value)) if !value.is_empty() => {
                root_fs_type = Some(value.to_string())
            }
            ("rootflags", Some(value)) if !value.is_empty() => root_flags = Some(value.to_string()),
            ("ro", None) => read_write = false,
            ("rw", None) => read_write = true,
            ("init", Some(value)) if !value.is_empty() => init = PathBuf::from(value),
            ("rootwait", None) => root_wait = default_wait,
            ("rootwait", Some(value)) => {
                if let Some(secs) = parse_seconds(key, value) {
                    root_wait = secs;
                }
            }
            ("rootdelay", Some(value)) => {
                if let Some(secs) = parse_seconds(key, value) {
                    root_delay = Some(secs);
                }
            }
            _ => {}
        }
    }

    Ok(BootOptions {
        root: root.ok_or(ParseError::MissingRoot)?,
        root_fs_type,
        root_flags,
        read_write,
        init,
        root_wait,
        root_delay,
    })
}

fn parse_seconds(key: &str, value: &str) -> Option<Duration> {
    match value.parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(err) => {
            log::warn!("ignoring {}={}: {}", key, value, err);
            None
        }
    }
}

/// Modules requested with `modules=a,b,c`. Repeated parameters accumulate.
pub fn modules(cmdline: &str) -> Vec<String> {
    split(cmdline)
        .iter()
        .filter_map(|token| token.strip_prefix("modules="))
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(|m| m.to_string())
        .collect()
}

/// Split on whitespace the way the kernel does: double quotes group a
/// value containing spaces and are dropped from the result.
pub fn split(cmdline: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;

    for c in cmdline.chars() {
        match c {
            '"' => in_quote = !in_quote,
            c if c.is_whitespace() && !in_quote => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

/// Whether a bare flag such as `debug` is present.
pub fn has_flag(cmdline: &str, flag: &str) -> bool {
    split(cmdline).iter().any(|token| token == flag)
}

pub fn read_cmdline(path: &Path) -> Result<String> {
    let cmdline =
        fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))?;
    Ok(cmdline.trim_end().to_string())
}
