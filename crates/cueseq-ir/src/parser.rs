//! The contract between the engine and a sequence parser.

use crate::message::SequenceEvent;

/// The three interchangeable parser kinds, selected from the first bytes
/// of the raw resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParserKind {
    /// Legacy "RO" resource.
    Ro,
    /// "FORM"-tagged extended MIDI resource.
    Xmidi,
    /// Standard MIDI file.
    Smf,
}

/// Inspect a resource's magic bytes and pick the parser kind for it.
///
/// Anything that is neither "RO" nor "FORM" is assumed to be standard MIDI.
pub fn detect_kind(data: &[u8]) -> ParserKind {
    if data.starts_with(b"RO") {
        ParserKind::Ro
    } else if data.starts_with(b"FORM") {
        ParserKind::Xmidi
    } else {
        ParserKind::Smf
    }
}

/// Constructor for a parser of a given kind, injected into the engine.
pub type ParserFactory = dyn Fn(ParserKind) -> Box<dyn SequenceParser>;

/// A loaded sequence resource that delivers timed events on demand.
///
/// Positions are absolute ticks on the currently selected track. The
/// parser keeps its own clock: `set_timer_rate` declares how many
/// microseconds of musical time one `on_timer` call represents, and
/// `on_timer` appends every event that has come due to the output buffer.
pub trait SequenceParser {
    /// Load a resource. Returns false (and leaves the parser unloaded)
    /// if the data is malformed.
    fn load(&mut self, data: &[u8]) -> bool;

    /// Drop the loaded resource.
    fn unload(&mut self);

    /// Select a track. Returns false if the track does not exist.
    /// Switching tracks rewinds to tick 0; re-selecting the current
    /// track keeps the position.
    fn set_track(&mut self, track: u16) -> bool;

    /// Number of tracks in the loaded resource.
    fn num_tracks(&self) -> u16;

    /// Reposition to an absolute tick without delivering the skipped
    /// events. Returns false if the target lies past the end of the track.
    fn jump_to_tick(&mut self, tick: u32) -> bool;

    /// Reposition to an absolute tick, appending every skipped event to
    /// `out` so the caller can replay the intermediate state. End-of-track
    /// is never reported through `out`. Returns false if the target lies
    /// past the end of the track.
    fn scan_to_tick(&mut self, tick: u32, out: &mut Vec<SequenceEvent>) -> bool;

    /// Advance to the end of the current track, appending every remaining
    /// event to `out` (end-of-track excluded).
    fn scan_to_end(&mut self, out: &mut Vec<SequenceEvent>);

    /// Current absolute tick.
    fn tick(&self) -> u32;

    /// Ticks per beat of the loaded resource.
    fn ppqn(&self) -> u32;

    /// Microseconds of musical time represented by one `on_timer` call.
    fn set_timer_rate(&mut self, rate_us: u32);

    /// Advance the parser clock by one timer period and append all events
    /// now due. A single `EndOfTrack` is delivered once the track is
    /// exhausted.
    fn on_timer(&mut self, out: &mut Vec<SequenceEvent>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_detection() {
        assert_eq!(detect_kind(b"RO\x01\x02"), ParserKind::Ro);
        assert_eq!(detect_kind(b"FORM\x00\x00\x00\x10XDIR"), ParserKind::Xmidi);
        assert_eq!(detect_kind(b"MThd\x00\x00\x00\x06"), ParserKind::Smf);
        assert_eq!(detect_kind(b""), ParserKind::Smf);
    }
}
