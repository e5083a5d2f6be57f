//! Beat/tick position math.
//!
//! All sequence positions are absolute parser ticks; beats are 1-based
//! (beat 1 starts at tick 0), matching the convention of the control
//! protocol's jump and loop commands.

/// Parser ticks per beat.
pub const TICKS_PER_BEAT: u32 = 480;

/// Convert a 1-based beat plus tick-within-beat to an absolute tick.
///
/// Beat 0 is treated as beat 1.
pub fn beat_tick_to_ticks(beat: u32, tick: u32) -> u32 {
    (beat.max(1) - 1) * TICKS_PER_BEAT + tick
}

/// The 1-based beat containing an absolute tick.
pub fn beat_of_tick(tick: u32) -> u32 {
    tick / TICKS_PER_BEAT + 1
}

/// Tick offset within the beat containing an absolute tick.
pub fn tick_in_beat(tick: u32) -> u32 {
    tick % TICKS_PER_BEAT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beat_one_starts_at_tick_zero() {
        assert_eq!(beat_tick_to_ticks(1, 0), 0);
        assert_eq!(beat_of_tick(0), 1);
        assert_eq!(tick_in_beat(0), 0);
    }

    #[test]
    fn beat_zero_normalizes_to_beat_one() {
        assert_eq!(beat_tick_to_ticks(0, 12), beat_tick_to_ticks(1, 12));
    }

    #[test]
    fn round_trips_through_absolute_ticks() {
        for (beat, tick) in [(1, 0), (2, 479), (10, 1), (100, 240)] {
            let abs = beat_tick_to_ticks(beat, tick);
            assert_eq!(beat_of_tick(abs), beat);
            assert_eq!(tick_in_beat(abs), tick);
        }
    }
}
