use std::path::PathBuf;
use std::time::Duration;

use crate::cmdline::RootSpec;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("no root= argument on the kernel command line")]
    MissingRoot,
    #[error("cannot read the kernel command line from {path:?}: {reason}")]
    Unreadable { path: PathBuf, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("root device {spec} did not appear within {waited:?} ({attempts} attempts)")]
    Timeout {
        spec: RootSpec,
        waited: Duration,
        attempts: u32,
    },
    #[error("unsupported root specification {0:?}")]
    UnsupportedSpec(String),
}

/// Every way the automated boot path can end. Each variant routes the
/// sequencer to the rescue shell.
#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("parsing command line: {0}")]
    Parse(#[from] ParseError),
    #[error("resolving root: {0}")]
    Resolution(#[from] ResolutionError),
    #[error("setting up {step}: {cause:#}")]
    Setup { step: String, cause: anyhow::Error },
    #[error("mounting {device:?} on {target:?} (tried {fs_types}): {cause:#}")]
    Mount {
        device: PathBuf,
        target: PathBuf,
        fs_types: String,
        cause: anyhow::Error,
    },
    #[error("moving {from:?} into {to:?}: {cause:#}")]
    Relocate {
        from: PathBuf,
        to: PathBuf,
        cause: anyhow::Error,
    },
    #[error("handing off to {init:?}: {reason}")]
    Handoff { init: PathBuf, reason: String },
}
