//! Block device enumeration and identification, the blkid side of root
//! resolution. The real implementation reads the device directory and asks
//! udev links or blkid for metadata; tests use an in-memory device table.

pub mod blkid;
#[allow(clippy::module_inception)]
pub mod device;

pub use device::{create_probe, DeviceIds, DeviceProbe};
