//! Contains a wrapper of syscalls for unit tests
//! This provides a uniform interface for rest of bootinit
//! to call the kernel facilities required during early boot

pub mod linux;
#[allow(clippy::module_inception)]
pub mod syscall;

pub use syscall::Syscall;
