//! Engine error type.

use thiserror::Error;

/// Errors reported by engine and player operations.
///
/// None of these are fatal to the process; the worst outcome anywhere in
/// the engine is the deactivation of a single player.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("sound {0} not found")]
    SoundNotFound(u32),
    #[error("sound {0} could not be loaded")]
    LoadFailed(u32),
    #[error("no free player")]
    NoFreePlayer,
    #[error("sound {0} is not playing")]
    NotPlaying(u32),
    #[error("player is not active")]
    NotActive,
    #[error("loop window must span at least one full beat")]
    InvalidLoop,
    #[error("seek rejected by the parser")]
    SeekRejected,
    #[error("value out of range")]
    OutOfRange,
    #[error("all fader slots are busy")]
    NoFreeFader,
}
