//! The hardware output contract.

use crate::message::ChannelMessage;

/// A hardware (or emulated) MIDI output device.
pub trait MidiSink {
    /// Transmit a channel-voice message.
    fn send(&mut self, msg: ChannelMessage);

    /// Transmit a raw system-exclusive message (vendor byte first, no
    /// framing bytes). `delay_hint_ms` is extra settle time the engine
    /// asks for after this message; devices that keep up fine ignore it.
    fn sysex(&mut self, data: &[u8], delay_hint_ms: u16);

    /// Microseconds of real time between two engine timer callbacks.
    fn base_tempo(&self) -> u32 {
        10000
    }
}

/// A sink that discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl MidiSink for NullSink {
    fn send(&mut self, _msg: ChannelMessage) {}
    fn sysex(&mut self, _data: &[u8], _delay_hint_ms: u16) {}
}
