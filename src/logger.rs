use std::env;
use std::io::{stderr, Write};
use std::path::PathBuf;
use std::{
    fs::{File, OpenOptions},
    str::FromStr,
};

use anyhow::{Context, Result};
use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;

pub static BOOT_LOGGER: OnceCell<BootLogger> = OnceCell::new();
pub static LOG_FILE: OnceCell<Option<File>> = OnceCell::new();

pub const LOG_LEVEL_ENV: &str = "BOOTINIT_LOG_LEVEL";

/// Install the logger. `log_file` may be `/dev/kmsg` so that messages end
/// up in the kernel ring buffer next to the driver output.
pub fn init(log_file: Option<PathBuf>, log_level: Option<&str>) -> Result<()> {
    let level_filter = log_level
        .map(str::to_string)
        .or_else(|| env::var(LOG_LEVEL_ENV).ok())
        .and_then(|level| LevelFilter::from_str(&level).ok())
        .unwrap_or(LevelFilter::Info);

    let file = match log_file {
        Some(path) => Some(
            OpenOptions::new()
                .create(true)
                .write(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed opening log file {:?}", path))?,
        ),
        None => None,
    };
    // a second init keeps the first destination
    let _ = LOG_FILE.set(file);

    let logger = BOOT_LOGGER.get_or_init(BootLogger::new);
    log::set_logger(logger)
        .map(|()| log::set_max_level(level_filter))
        .map_err(|err| anyhow::anyhow!("set logger failed: {}", err))
}

/// Used when `debug` is on the kernel command line.
pub fn raise_to_debug() {
    if log::max_level() < LevelFilter::Debug {
        log::set_max_level(LevelFilter::Debug);
        log::debug!("log level raised to debug");
    }
}

pub struct BootLogger;

impl BootLogger {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BootLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for BootLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let log_msg = match (record.file(), record.line()) {
                (Some(file), Some(line)) => format!(
                    "bootinit: [{} {}:{}] {} {}\n",
                    record.level(),
                    file,
                    line,
                    chrono::Local::now().to_rfc3339(),
                    record.args()
                ),
                (_, _) => format!(
                    "bootinit: [{}] {} {}\n",
                    record.level(),
                    chrono::Local::now().to_rfc3339(),
                    record.args()
                ),
            };
            // one write per record, /dev/kmsg treats each write as a message
            if let Some(mut log_file) = LOG_FILE.get().and_then(Option::as_ref) {
                let _ = log_file.write_all(log_msg.as_bytes());
            } else {
                let _ = stderr().write_all(log_msg.as_bytes());
            }
        }
    }

    fn flush(&self) {
        if let Some(mut log_file) = LOG_FILE.get().and_then(Option::as_ref) {
            let _ = log_file.flush();
        } else {
            let _ = stderr().flush();
        }
    }
}
