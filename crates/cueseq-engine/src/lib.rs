//! Sequencing core for the cueseq interactive music engine.
//!
//! Plays back one or more concurrently active sequences ("players"), each
//! driving a subset of a shared pool of output channels ("parts"), with
//! live parameter fades, loop windows, hook-gated control commands, and a
//! silent scan mode for resynchronizing state after a seek.

mod engine;
mod error;
mod fader;
mod hooks;
mod looper;
mod part;
mod player;
mod save;
#[cfg(test)]
mod testutil;

pub use engine::{Engine, MAX_PLAYERS, NUM_VOL_GROUPS, VOL_GROUP_MASTER};
pub use error::EngineError;
pub use fader::{fade_param, ParameterFader, FADER_SLOTS, FADE_QUANTUM_US};
pub use hooks::HookGate;
pub use looper::LoopState;
pub use part::{Part, PartId, PartPool, MAX_PARTS, NUM_HW_CHANNELS, PERCUSSION_CHANNEL};
pub use player::{Player, PlayerContext};
pub use save::{SaveError, SAVE_VERSION};
