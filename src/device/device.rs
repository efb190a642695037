use std::{
    any::Any,
    path::{Path, PathBuf},
};

use anyhow::Result;

use crate::cmdline::RootSpec;
use crate::device::{blkid::BlkidProbe, test::TestDevices};

/// Identifiers a block device can be addressed by.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIds {
    pub uuid: Option<String>,
    pub part_uuid: Option<String>,
    pub label: Option<String>,
    pub fs_type: Option<String>,
}

impl DeviceIds {
    pub fn is_empty(&self) -> bool {
        self.uuid.is_none() && self.part_uuid.is_none() && self.label.is_none()
    }

    /// UUIDs compare case-insensitively since firmware, blkid and users all
    /// disagree on the case. Labels are compared exactly.
    pub fn matches(&self, spec: &RootSpec) -> bool {
        fn same_uuid(have: &Option<String>, want: &str) -> bool {
            have.as_deref()
                .map_or(false, |have| have.eq_ignore_ascii_case(want))
        }

        match spec {
            RootSpec::Uuid(uuid) => same_uuid(&self.uuid, uuid),
            RootSpec::PartUuid(uuid) => same_uuid(&self.part_uuid, uuid),
            RootSpec::Label(label) => self.label.as_deref() == Some(label.as_str()),
            RootSpec::DevicePath(_) | RootSpec::Unknown(_) => false,
        }
    }
}

/// Read-only view of the block devices present right now. Nothing here
/// caches; devices come and go while the kernel probes buses.
pub trait DeviceProbe {
    fn as_any(&self) -> &dyn Any;
    /// Block device nodes currently present, sorted by path.
    fn block_devices(&self) -> Result<Vec<PathBuf>>;
    fn is_block_device(&self, path: &Path) -> bool;
    fn identify(&self, device: &Path) -> Result<DeviceIds>;
}

pub fn create_probe(dev_dir: &Path) -> Box<dyn DeviceProbe> {
    if cfg!(test) {
        Box::new(TestDevices::default())
    } else {
        Box::new(BlkidProbe::new(dev_dir))
    }
}
