//! Decoded sequence events delivered by a parser.

use arrayvec::ArrayVec;

/// Maximum accepted system-exclusive payload, including the vendor byte.
pub const MAX_SYSEX_LEN: usize = 128;

/// System-exclusive payload: vendor byte followed by the message body.
pub type SysExData = ArrayVec<u8, MAX_SYSEX_LEN>;

/// A three-byte channel-voice message.
///
/// The top nibble of `status` is the operation, the bottom nibble the
/// channel. One-data-byte messages leave `data2` at zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelMessage {
    pub status: u8,
    pub data1: u8,
    pub data2: u8,
}

impl ChannelMessage {
    pub fn new(status: u8, data1: u8, data2: u8) -> Self {
        Self { status, data1, data2 }
    }

    /// Operation nibble (0x8 = note off, 0x9 = note on, 0xB = control, ...).
    pub fn kind(&self) -> u8 {
        self.status >> 4
    }

    /// Channel nibble.
    pub fn channel(&self) -> u8 {
        self.status & 0x0F
    }

    pub fn note_on(chan: u8, key: u8, velocity: u8) -> Self {
        Self::new(0x90 | (chan & 0x0F), key, velocity)
    }

    pub fn note_off(chan: u8, key: u8) -> Self {
        Self::new(0x80 | (chan & 0x0F), key, 0)
    }

    pub fn control_change(chan: u8, controller: u8, value: u8) -> Self {
        Self::new(0xB0 | (chan & 0x0F), controller, value)
    }

    pub fn program_change(chan: u8, program: u8) -> Self {
        Self::new(0xC0 | (chan & 0x0F), program, 0)
    }

    /// Pitch bend, `value` in -8192..=8191.
    pub fn pitch_bend(chan: u8, value: i16) -> Self {
        let raw = (value.clamp(-8192, 8191) + 0x2000) as u16;
        Self::new(0xE0 | (chan & 0x0F), (raw & 0x7F) as u8, (raw >> 7) as u8)
    }

    /// Signed pitch-bend value encoded in `data1`/`data2`.
    pub fn pitch_bend_value(&self) -> i16 {
        (((self.data2 as i32) << 7 | self.data1 as i32) - 0x2000) as i16
    }
}

/// One decoded event from a sequence resource.
#[derive(Clone, Debug, PartialEq)]
pub enum SequenceEvent {
    /// Channel-voice message.
    Channel(ChannelMessage),
    /// System-exclusive message (vendor byte first, no framing bytes).
    SysEx(SysExData),
    /// End of the current track.
    EndOfTrack,
}

impl SequenceEvent {
    /// Build a sysex event from raw payload bytes, truncating oversized input.
    pub fn sysex(payload: &[u8]) -> Self {
        let mut data = SysExData::new();
        let take = payload.len().min(MAX_SYSEX_LEN);
        let _ = data.try_extend_from_slice(&payload[..take]);
        SequenceEvent::SysEx(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nibble_accessors() {
        let msg = ChannelMessage::note_on(5, 60, 100);
        assert_eq!(msg.kind(), 0x9);
        assert_eq!(msg.channel(), 5);
        assert_eq!(msg.data1, 60);
        assert_eq!(msg.data2, 100);
    }

    #[test]
    fn pitch_bend_round_trip() {
        for value in [-8192, -1, 0, 1, 100, 8191] {
            let msg = ChannelMessage::pitch_bend(2, value);
            assert_eq!(msg.pitch_bend_value(), value);
        }
    }

    #[test]
    fn oversized_sysex_is_truncated() {
        let payload = [0x7D; MAX_SYSEX_LEN + 10];
        let SequenceEvent::SysEx(data) = SequenceEvent::sysex(&payload) else {
            panic!("expected sysex");
        };
        assert_eq!(data.len(), MAX_SYSEX_LEN);
    }
}
