//! The boot state machine. It walks Init, DriversLoaded, Resolving,
//! MountingRoot, Relocating and HandingOff strictly in that order; any
//! failure on the way diverts to Rescue, which starts a shell on the console.

#[allow(clippy::module_inception)]
mod sequencer;
mod state;
#[cfg(test)]
mod tests;

pub use sequencer::BootSequencer;
pub use state::BootState;
