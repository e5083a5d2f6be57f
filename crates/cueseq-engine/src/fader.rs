//! Linear parameter fades with fixed-point accumulation.
//!
//! A player owns a small fixed array of fader slots. Each slot advances
//! once per fade quantum by an integer step plus a fractional remainder
//! carried in integer arithmetic, so a fade of `time` quanta lands on its
//! target exactly, with no float drift.

/// Number of concurrently fading parameters per player.
pub const FADER_SLOTS: usize = 4;

/// Microseconds per fade step (~60 Hz, independent of musical tempo).
pub const FADE_QUANTUM_US: u32 = 16667;

/// Parameter ids understood by the fade command.
pub mod fade_param {
    /// Free slot marker.
    pub const NONE: i16 = 0;
    pub const VOLUME: i16 = 1;
    /// Fades the player's detune (fine-grained transpose).
    pub const TRANSPOSE: i16 = 3;
    pub const SPEED: i16 = 4;
    /// Reserved id: clears every fader slot unconditionally.
    pub const CLEAR_ALL: i16 = 127;
}

/// One fade slot. Free when `param == fade_param::NONE`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParameterFader {
    pub param: i16,
    /// Direction sign of the fade (+1 or -1).
    pub dir: i8,
    /// Whole step applied per quantum.
    pub incr: i16,
    /// Fractional step numerator, denominator `ttime`.
    pub ifrac: u16,
    /// Fractional accumulator.
    pub irem: u16,
    /// Total fade length in quanta (fraction denominator).
    pub ttime: u16,
    /// Remaining quanta.
    pub cntdwn: u16,
    /// Current interpolated value.
    pub state: i16,
}

impl ParameterFader {
    pub fn is_free(&self) -> bool {
        self.param == fade_param::NONE
    }

    pub fn clear(&mut self) {
        *self = ParameterFader::default();
    }

    /// Arm the slot for a fade from `from` to `target` over `time` quanta.
    /// `time` must be non-zero.
    pub fn start(&mut self, param: i16, from: i16, target: i16, time: u16) {
        debug_assert!(time > 0);
        let diff = target as i32 - from as i32;
        self.param = param;
        self.state = from;
        self.ttime = time;
        self.cntdwn = time;
        self.dir = if diff >= 0 { 1 } else { -1 };
        self.incr = (diff / time as i32) as i16;
        self.ifrac = (diff.unsigned_abs() % time as u32) as u16;
        self.irem = 0;
    }

    /// Advance one quantum. Returns the new interpolated value when it
    /// changed this quantum. The slot frees itself when the countdown is
    /// exhausted or the step has converged to zero.
    pub fn step(&mut self) -> Option<i16> {
        let mut step = self.incr as i32;
        self.irem = self.irem.wrapping_add(self.ifrac);
        if self.irem >= self.ttime {
            self.irem -= self.ttime;
            step += self.dir as i32;
        }

        if step == 0 {
            self.tick_countdown();
            return None;
        }

        self.state = (self.state as i32 + step) as i16;
        let state = self.state;
        self.tick_countdown();
        Some(state)
    }

    fn tick_countdown(&mut self) {
        if self.cntdwn == 0 {
            self.param = fade_param::NONE;
        } else {
            self.cntdwn -= 1;
            if self.cntdwn == 0 {
                self.param = fade_param::NONE;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_to_completion(fader: &mut ParameterFader) -> Vec<i16> {
        let mut states = Vec::new();
        for _ in 0..10_000 {
            if fader.is_free() {
                break;
            }
            if let Some(state) = fader.step() {
                states.push(state);
            }
        }
        states
    }

    #[test]
    fn fade_lands_exactly_on_target() {
        let mut fader = ParameterFader::default();
        fader.start(fade_param::VOLUME, 100, 0, 50);
        let states = run_to_completion(&mut fader);
        assert_eq!(states.len(), 50);
        assert_eq!(*states.last().unwrap(), 0);
        assert!(fader.is_free());
    }

    #[test]
    fn fractional_remainder_accumulates_without_drift() {
        // 127 / 60 leaves a remainder of 7 to be folded in over the fade.
        let mut fader = ParameterFader::default();
        fader.start(fade_param::VOLUME, 0, 127, 60);
        let states = run_to_completion(&mut fader);
        assert_eq!(*states.last().unwrap(), 127);
        // Monotonic rise.
        assert!(states.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn downward_fade_with_remainder() {
        let mut fader = ParameterFader::default();
        fader.start(fade_param::SPEED, 128, 64, 100);
        let states = run_to_completion(&mut fader);
        assert_eq!(*states.last().unwrap(), 64);
    }

    #[test]
    fn zero_diff_frees_slot_without_reporting() {
        let mut fader = ParameterFader::default();
        fader.start(fade_param::VOLUME, 64, 64, 10);
        let states = run_to_completion(&mut fader);
        assert!(states.is_empty());
        assert!(fader.is_free());
    }

    #[test]
    fn fade_takes_exactly_time_quanta() {
        let mut fader = ParameterFader::default();
        fader.start(fade_param::VOLUME, 0, 100, 30);
        let mut quanta = 0;
        while !fader.is_free() {
            fader.step();
            quanta += 1;
        }
        assert_eq!(quanta, 30);
    }
}
