//! Hook gates for conditional control commands.
//!
//! A script arms a hook value; a conditional command embedded in the
//! sequence only takes effect when its command byte matches the armed
//! value (or is zero, which is unconditional). Command bytes in 1..=127
//! clear the arming when consumed; bytes >= 0x80 leave it armed.

/// Per-player table of armed hook values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HookGate {
    /// Jump hook plus one queued follow-up value.
    pub jump: [u8; 2],
    pub transpose: u8,
    pub part_onoff: [u8; 16],
    pub part_volume: [u8; 16],
    pub part_program: [u8; 16],
    pub part_transpose: [u8; 16],
}

/// Hook classes addressable by the arming command.
pub(crate) mod hook_class {
    pub const JUMP: u8 = 0;
    pub const TRANSPOSE: u8 = 1;
    pub const PART_ONOFF: u8 = 2;
    pub const PART_VOLUME: u8 = 3;
    pub const PART_PROGRAM: u8 = 4;
    pub const PART_TRANSPOSE: u8 = 5;
}

/// Check `cmd` against an armed slot and consume one-shot arming.
///
/// Returns true when the command should be applied.
pub(crate) fn gate(slot: &mut u8, cmd: u8) -> bool {
    if cmd != 0 && *slot != cmd {
        return false;
    }
    if cmd != 0 && cmd < 0x80 {
        *slot = 0;
    }
    true
}

impl HookGate {
    pub fn clear(&mut self) {
        *self = HookGate::default();
    }

    /// Arm a hook. Returns false for an unknown class or channel.
    pub fn set(&mut self, class: u8, value: u8, chan: u8) -> bool {
        let chan = chan as usize;
        if class != hook_class::JUMP && class != hook_class::TRANSPOSE && chan >= 16 {
            return false;
        }
        match class {
            hook_class::JUMP => {
                // A second arming is queued behind the first.
                if value != self.jump[0] {
                    self.jump[1] = self.jump[0];
                    self.jump[0] = value;
                }
            }
            hook_class::TRANSPOSE => self.transpose = value,
            hook_class::PART_ONOFF => self.part_onoff[chan] = value,
            hook_class::PART_VOLUME => self.part_volume[chan] = value,
            hook_class::PART_PROGRAM => self.part_program[chan] = value,
            hook_class::PART_TRANSPOSE => self.part_transpose[chan] = value,
            _ => return false,
        }
        true
    }

    /// Consume the jump hook if `cmd` passes its gate; pulls the queued
    /// value forward on a one-shot match.
    pub(crate) fn gate_jump(&mut self, cmd: u8) -> bool {
        if cmd != 0 && self.jump[0] != cmd {
            return false;
        }
        if cmd != 0 && cmd < 0x80 {
            self.jump[0] = self.jump[1];
            self.jump[1] = 0;
        }
        true
    }

    /// Read-only query access, addressed by the player query codes 18..=23.
    pub fn query_param(&self, param: i32, chan: u8) -> i32 {
        let chan = chan as usize;
        if param >= 20 && chan >= 16 {
            return -1;
        }
        match param {
            18 => self.jump[0] as i32,
            19 => self.transpose as i32,
            20 => self.part_onoff[chan] as i32,
            21 => self.part_volume[chan] as i32,
            22 => self.part_program[chan] as i32,
            23 => self.part_transpose[chan] as i32,
            _ => -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_command_always_passes() {
        let mut slot = 5;
        assert!(gate(&mut slot, 0));
        assert_eq!(slot, 5, "unconditional commands leave arming alone");
    }

    #[test]
    fn matching_command_passes_once() {
        let mut slot = 5;
        assert!(gate(&mut slot, 5));
        assert_eq!(slot, 0, "one-shot arming clears on consume");
        assert!(!gate(&mut slot, 5));
    }

    #[test]
    fn non_matching_command_is_blocked() {
        let mut slot = 5;
        assert!(!gate(&mut slot, 6));
        assert_eq!(slot, 5);
    }

    #[test]
    fn high_command_bytes_do_not_clear_arming() {
        let mut slot = 0x90;
        assert!(gate(&mut slot, 0x90));
        assert_eq!(slot, 0x90, "bytes >= 0x80 are persistent");
        assert!(gate(&mut slot, 0x90));
    }

    #[test]
    fn jump_hook_queues_second_arming() {
        let mut hooks = HookGate::default();
        hooks.set(hook_class::JUMP, 3, 0);
        hooks.set(hook_class::JUMP, 7, 0);
        assert!(!hooks.gate_jump(3));
        assert!(hooks.gate_jump(7));
        // Consuming pulls the queued value forward.
        assert_eq!(hooks.jump, [3, 0]);
        assert!(hooks.gate_jump(3));
        assert_eq!(hooks.jump, [0, 0]);
    }

    #[test]
    fn set_rejects_unknown_class_and_channel() {
        let mut hooks = HookGate::default();
        assert!(!hooks.set(9, 1, 0));
        assert!(!hooks.set(hook_class::PART_VOLUME, 1, 16));
        assert!(hooks.set(hook_class::PART_VOLUME, 1, 15));
    }

    #[test]
    fn query_codes_read_back_arming() {
        let mut hooks = HookGate::default();
        hooks.set(hook_class::TRANSPOSE, 9, 0);
        hooks.set(hook_class::PART_PROGRAM, 4, 2);
        assert_eq!(hooks.query_param(19, 0), 9);
        assert_eq!(hooks.query_param(22, 2), 4);
        assert_eq!(hooks.query_param(22, 3), 0);
        assert_eq!(hooks.query_param(24, 0), -1);
    }
}
