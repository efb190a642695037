//! Turns a root specification into a block device node.
//!
//! Block devices show up asynchronously while drivers probe their buses, so
//! resolution is a bounded poll: look, sleep a short fixed interval, look
//! again, until the wall-clock deadline passes.
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::cmdline::{self, BootOptions, RootSpec};
use crate::device::DeviceProbe;
use crate::error::{ParseError, ResolutionError};

pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const MAX_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A device node that was a block device when this value was built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDevice {
    path: PathBuf,
    attempts: u32,
    elapsed: Duration,
}

impl ResolvedDevice {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

pub struct RootResolver {
    probe: Box<dyn DeviceProbe>,
    poll_interval: Duration,
    default_wait: Duration,
}

impl RootResolver {
    pub fn new(probe: Box<dyn DeviceProbe>, poll_interval: Duration, default_wait: Duration) -> Self {
        Self {
            probe,
            poll_interval: poll_interval.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL),
            default_wait,
        }
    }

    pub fn probe(&self) -> &dyn DeviceProbe {
        self.probe.as_ref()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn parse(&self, cmdline: &str) -> Result<BootOptions, ParseError> {
        cmdline::parse(cmdline, self.default_wait)
    }

    /// Poll until `spec` names a present block device or `timeout` elapses.
    /// Never mutates anything; safe to call repeatedly.
    pub fn resolve(
        &self,
        spec: &RootSpec,
        timeout: Duration,
    ) -> Result<ResolvedDevice, ResolutionError> {
        if let RootSpec::Unknown(raw) = spec {
            return Err(ResolutionError::UnsupportedSpec(raw.clone()));
        }

        let started = Instant::now();
        // a timeout too large to represent means waiting forever
        let deadline = started.checked_add(timeout);
        let mut attempts = 0;

        loop {
            attempts += 1;
            if let Some(path) = self.find(spec) {
                // the device may have vanished since it was found
                if self.probe.is_block_device(&path) {
                    let elapsed = started.elapsed();
                    log::debug!(
                        "{} resolved to {:?} after {} attempts in {:?}",
                        spec,
                        path,
                        attempts,
                        elapsed
                    );
                    return Ok(ResolvedDevice {
                        path,
                        attempts,
                        elapsed,
                    });
                }
            }

            let now = Instant::now();
            let remaining = match deadline {
                Some(deadline) if now >= deadline => {
                    return Err(ResolutionError::Timeout {
                        spec: spec.clone(),
                        waited: now - started,
                        attempts,
                    });
                }
                Some(deadline) => deadline - now,
                None => self.poll_interval,
            };
            if attempts == 1 {
                log::info!("waiting up to {:?} for {}", timeout, spec);
            }
            thread::sleep(self.poll_interval.min(remaining));
        }
    }

    fn find(&self, spec: &RootSpec) -> Option<PathBuf> {
        match spec {
            RootSpec::DevicePath(path) => Some(path.clone()),
            spec if spec.needs_probe() => self.find_by_ids(spec),
            _ => None,
        }
    }

    fn find_by_ids(&self, spec: &RootSpec) -> Option<PathBuf> {
        let devices = match self.probe.block_devices() {
            Ok(devices) => devices,
            Err(err) => {
                log::debug!("failed to list block devices: {:#}", err);
                return None;
            }
        };

        devices.into_iter().find(|device| match self.probe.identify(device) {
            Ok(ids) => ids.matches(spec),
            Err(err) => {
                log::debug!("failed to identify {:?}: {:#}", device, err);
                false
            }
        })
    }
}
