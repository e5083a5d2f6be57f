//! Loop window tracking.

use crate::error::EngineError;

/// A loop region (to/from beat+tick) and its remaining repeat count.
/// A counter of zero means no loop is armed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopState {
    pub to_beat: u16,
    pub to_tick: u16,
    pub from_beat: u16,
    pub from_tick: u16,
    pub counter: u16,
}

impl Default for LoopState {
    fn default() -> Self {
        Self { to_beat: 1, to_tick: 0, from_beat: 1, from_tick: 0, counter: 0 }
    }
}

impl LoopState {
    /// Arm a loop. The window must span at least one full beat; `to_beat`
    /// of zero is normalized to one.
    pub fn set(
        &mut self,
        count: u16,
        to_beat: u16,
        to_tick: u16,
        from_beat: u16,
        from_tick: u16,
    ) -> Result<(), EngineError> {
        // Widened so the maximal to_beat cannot wrap the comparison.
        if to_beat as u32 + 1 >= from_beat as u32 {
            return Err(EngineError::InvalidLoop);
        }
        let to_beat = to_beat.max(1);

        // Counter is zeroed before the window is replaced so a timer
        // callback never pairs a stale count with the new window.
        self.counter = 0;
        self.to_beat = to_beat;
        self.to_tick = to_tick;
        self.from_beat = from_beat;
        self.from_tick = from_tick;
        self.counter = count;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.counter = 0;
    }

    /// Has playback reached or passed the loop-from boundary?
    pub fn crossed_from(&self, beat: u32, tick: u32) -> bool {
        self.counter != 0
            && (beat > self.from_beat as u32
                || (beat == self.from_beat as u32 && tick >= self.from_tick as u32))
    }

    /// Consume one repeat and return the jump-back destination.
    pub fn take_jump(&mut self) -> (u16, u16) {
        self.counter -= 1;
        (self.to_beat, self.to_tick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_window_narrower_than_a_beat() {
        let mut lp = LoopState::default();
        assert_eq!(lp.set(2, 5, 0, 6, 0), Err(EngineError::InvalidLoop));
        assert_eq!(lp.set(2, 5, 0, 5, 0), Err(EngineError::InvalidLoop));
        assert_eq!(lp.counter, 0, "rejected set mutates nothing");
    }

    #[test]
    fn maximal_to_beat_is_rejected_without_wrapping() {
        let mut lp = LoopState::default();
        assert_eq!(lp.set(2, u16::MAX, 0, 10, 0), Err(EngineError::InvalidLoop));
        assert_eq!(lp.counter, 0);
    }

    #[test]
    fn accepts_minimal_valid_window() {
        let mut lp = LoopState::default();
        assert!(lp.set(2, 5, 0, 7, 0).is_ok());
        assert_eq!(lp.counter, 2);
    }

    #[test]
    fn to_beat_zero_normalizes_to_one() {
        let mut lp = LoopState::default();
        lp.set(1, 0, 10, 4, 0).unwrap();
        assert_eq!(lp.to_beat, 1);
        assert_eq!(lp.to_tick, 10);
    }

    #[test]
    fn crossing_detection() {
        let mut lp = LoopState::default();
        lp.set(3, 2, 0, 10, 120).unwrap();
        assert!(!lp.crossed_from(9, 479));
        assert!(!lp.crossed_from(10, 119));
        assert!(lp.crossed_from(10, 120));
        assert!(lp.crossed_from(11, 0));
    }

    #[test]
    fn cleared_loop_never_crosses() {
        let mut lp = LoopState::default();
        lp.set(3, 2, 0, 10, 0).unwrap();
        lp.clear();
        assert!(!lp.crossed_from(50, 0));
    }

    #[test]
    fn take_jump_counts_down() {
        let mut lp = LoopState::default();
        lp.set(2, 2, 30, 10, 0).unwrap();
        assert_eq!(lp.take_jump(), (2, 30));
        assert_eq!(lp.take_jump(), (2, 30));
        assert_eq!(lp.counter, 0);
        assert!(!lp.crossed_from(10, 0));
    }
}
