//! Steps of the boot sequence
use std::fmt::Display;

/// Indicates how far the boot has progressed
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BootState {
    // Pseudo filesystems and device nodes are being set up
    Init,
    // Requested kernel modules have been loaded or skipped
    DriversLoaded,
    // Waiting for the root device to show up
    Resolving,
    // Mounting the root device on the staging directory
    MountingRoot,
    // Moving pseudo filesystems into the new root
    Relocating,
    // Switching to the new root and executing its init
    HandingOff,
    // Something failed, an interactive shell takes over
    Rescue,
}

impl Default for BootState {
    fn default() -> Self {
        BootState::Init
    }
}

impl BootState {
    /// The state that follows this one when nothing goes wrong.
    pub fn next(&self) -> Option<BootState> {
        use BootState::*;
        match self {
            Init => Some(DriversLoaded),
            DriversLoaded => Some(Resolving),
            Resolving => Some(MountingRoot),
            MountingRoot => Some(Relocating),
            Relocating => Some(HandingOff),
            HandingOff | Rescue => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BootState::HandingOff | BootState::Rescue)
    }
}

impl Display for BootState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let print = match *self {
            Self::Init => "Init",
            Self::DriversLoaded => "DriversLoaded",
            Self::Resolving => "Resolving",
            Self::MountingRoot => "MountingRoot",
            Self::Relocating => "Relocating",
            Self::HandingOff => "HandingOff",
            Self::Rescue => "Rescue",
        };

        write!(f, "{}", print)
    }
}
