//! # bootinit
//! Minimal `/init` for an initramfs: mounts the pseudo filesystems, waits for
//! the root device named on the kernel command line, mounts it and switches
//! to the real init. Anything going wrong ends in a shell on the console.

use std::env;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use nix::unistd::{getpid, pause, Pid};

use bootinit::config::{self, Config};
use bootinit::sequencer::{BootSequencer, BootState};

/// Options for running outside of early boot, e.g. under a VM test harness.
/// As PID 1 the arguments come from the kernel and are not parsed.
#[derive(Parser, Debug)]
#[clap(version, about)]
struct Opts {
    /// use this command line instead of /proc/cmdline
    #[clap(long)]
    cmdline: Option<String>,
    #[clap(long, default_value = config::DEFAULT_PATH)]
    config: PathBuf,
    /// write log messages here instead of stderr, /dev/kmsg works
    #[clap(short, long)]
    log: Option<PathBuf>,
    #[clap(long)]
    log_level: Option<String>,
    /// arguments passed on to the real init
    #[clap(last = true)]
    init_args: Vec<String>,
}

fn main() {
    let is_pid1 = getpid() == Pid::from_raw(1);
    let opts = if is_pid1 {
        Opts {
            cmdline: None,
            config: PathBuf::from(config::DEFAULT_PATH),
            log: None,
            log_level: None,
            init_args: env::args().skip(1).collect(),
        }
    } else {
        Opts::parse()
    };

    let result = run(opts);
    if let Err(e) = &result {
        log::error!("{:#}", e);
        eprintln!("bootinit: {:#}", e);
    }

    // the kernel panics when init exits
    if is_pid1 {
        log::error!("nothing left to run, halting");
        loop {
            pause();
        }
    }
    std::process::exit(match result {
        Ok(BootState::HandingOff) => 0,
        _ => 1,
    })
}

fn run(opts: Opts) -> Result<BootState> {
    if let Err(e) = bootinit::logger::init(opts.log, opts.log_level.as_deref()) {
        eprintln!("log init failed: {:?}", e);
    }

    let config = Config::load_or_default(&opts.config);
    log::debug!("config: {:?}", config);

    let mut sequencer = BootSequencer::new(config, opts.cmdline, opts.init_args);
    let state = sequencer.run()?;
    log::info!("boot sequence ended in {}", state);
    Ok(state)
}
