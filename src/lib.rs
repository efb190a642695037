#[cfg(test)]
#[macro_use]
extern crate quickcheck;

pub mod cmdline;
pub mod config;
pub mod device;
pub mod error;
pub mod kmod;
pub mod logger;
pub mod mounts;
pub mod resolver;
pub mod sequencer;
pub mod syscall;
pub mod utils;
