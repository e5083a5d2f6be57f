//! Core types for the cueseq interactive music engine.
//!
//! Shared contracts between the sequencing engine and the format parsers:
//! channel-voice messages, musical time, resource headers, and the parser
//! and hardware-sink trait seams.

mod config;
mod header;
mod message;
mod parser;
mod sink;
mod time;

pub use config::{DeviceClass, EngineConfig};
pub use header::{ResourceProvider, SoundHeader};
pub use message::{ChannelMessage, SequenceEvent, SysExData, MAX_SYSEX_LEN};
pub use parser::{detect_kind, ParserFactory, ParserKind, SequenceParser};
pub use sink::{MidiSink, NullSink};
pub use time::{beat_of_tick, beat_tick_to_ticks, tick_in_beat, TICKS_PER_BEAT};
