//! The shared part pool: output channels contended by all players.
//!
//! A part belongs to at most one player at a time. Allocation may evict a
//! strictly lower-priority part owned by another player. Parts compete
//! again for the 16 hardware channels: only a part holding one actually
//! transmits.

use cueseq_ir::{ChannelMessage, MidiSink, SysExData};
use log::debug;

/// Index of a part in the shared pool.
pub type PartId = usize;

/// Size of the shared part pool.
pub const MAX_PARTS: usize = 32;

/// Hardware output channels available for transmission.
pub const NUM_HW_CHANNELS: usize = 16;

/// Fixed hardware channel for percussion parts.
pub const PERCUSSION_CHANNEL: u8 = 9;

/// Fold a transpose value into range by whole octaves, then clamp.
pub(crate) fn transpose_clamp(mut value: i32, min: i32, max: i32) -> i32 {
    while value < min {
        value += 12;
    }
    while value > max {
        value -= 12;
    }
    value
}

/// One output channel and its transmit state.
#[derive(Clone, Debug)]
pub struct Part {
    pub owner: Option<usize>,
    /// Sequence channel this part serves for its owner.
    pub chan: u8,
    pub on: bool,
    pub vol: u8,
    /// Volume after owner scaling; this is what gets transmitted.
    pub vol_eff: u8,
    pub pan: i8,
    pub pan_eff: i8,
    pub transpose: i8,
    pub transpose_eff: i8,
    pub detune: i8,
    pub detune_eff: i16,
    /// Priority offset relative to the owner's priority.
    pub pri: i8,
    pub pri_eff: u8,
    pub pedal: bool,
    pub modwheel: u8,
    pub pitchbend: i16,
    pub pitchbend_factor: u8,
    pub polyphony: u8,
    pub program: u8,
    pub effect_level: u8,
    pub chorus_level: u8,
    /// Percussion parts bypass transpose and use the fixed channel.
    pub percussion: bool,
    pub hw_channel: Option<u8>,
    /// Hardware instrument definition, retransmitted when eligible.
    pub instrument: Option<SysExData>,
    /// Allocation stamp; larger = more recently allocated.
    pub(crate) stamp: u64,
}

impl Default for Part {
    fn default() -> Self {
        Self {
            owner: None,
            chan: 0,
            on: false,
            vol: 127,
            vol_eff: 127,
            pan: 0,
            pan_eff: 0,
            transpose: 0,
            transpose_eff: 0,
            detune: 0,
            detune_eff: 0,
            pri: 0,
            pri_eff: 0,
            pedal: false,
            modwheel: 0,
            pitchbend: 0,
            pitchbend_factor: 2,
            polyphony: 1,
            program: 0,
            effect_level: 64,
            chorus_level: 0,
            percussion: false,
            hw_channel: None,
            instrument: None,
            stamp: 0,
        }
    }
}

impl Part {
    /// Is this part eligible to transmit to the hardware right now?
    pub fn clear_to_transmit(&self) -> bool {
        self.on && self.hw_channel.is_some()
    }

    pub fn note_on(&mut self, key: u8, velocity: u8, sink: &mut dyn MidiSink) {
        let Some(hw) = self.hw_channel else { return };
        if !self.on {
            return;
        }
        let key = if self.percussion {
            key
        } else {
            (key as i32 + self.transpose_eff as i32).clamp(0, 127) as u8
        };
        sink.send(ChannelMessage::note_on(hw, key, velocity));
    }

    pub fn note_off(&mut self, key: u8, sink: &mut dyn MidiSink) {
        let Some(hw) = self.hw_channel else { return };
        if !self.on {
            return;
        }
        let key = if self.percussion {
            key
        } else {
            (key as i32 + self.transpose_eff as i32).clamp(0, 127) as u8
        };
        sink.send(ChannelMessage::note_off(hw, key));
    }

    pub fn all_notes_off(&mut self, sink: &mut dyn MidiSink) {
        if let Some(hw) = self.hw_channel {
            sink.send(ChannelMessage::control_change(hw, 123, 0));
        }
    }

    pub fn set_volume(&mut self, vol: u8, owner_vol_eff: u8, sink: &mut dyn MidiSink) {
        self.vol = vol;
        self.vol_eff = (((vol as u16 + 1) * owner_vol_eff as u16) >> 7) as u8;
        if let Some(hw) = self.hw_channel {
            sink.send(ChannelMessage::control_change(hw, 7, self.vol_eff));
        }
    }

    pub fn set_pan(&mut self, pan: i8, owner_pan: i8, sink: &mut dyn MidiSink) {
        self.pan = pan;
        self.pan_eff = (pan as i32 + owner_pan as i32).clamp(-64, 63) as i8;
        if let Some(hw) = self.hw_channel {
            sink.send(ChannelMessage::control_change(hw, 10, (self.pan_eff as i32 + 0x40) as u8));
        }
    }

    pub fn set_transpose(
        &mut self,
        transpose: i8,
        owner_transpose: i8,
        limit: i8,
        sink: &mut dyn MidiSink,
    ) {
        self.transpose = transpose;
        self.transpose_eff = transpose_clamp(
            transpose as i32 + owner_transpose as i32,
            -(limit as i32),
            limit as i32,
        ) as i8;
        self.send_pitch(sink);
    }

    pub fn set_detune(&mut self, detune: i8, owner_detune: i16, sink: &mut dyn MidiSink) {
        self.detune = detune;
        self.detune_eff = (owner_detune + detune as i16).clamp(-128, 127);
        self.send_pitch(sink);
    }

    pub fn pitch_bend(&mut self, value: i16, sink: &mut dyn MidiSink) {
        self.pitchbend = value;
        self.send_pitch(sink);
    }

    /// Transmit the combined pitch state: bend plus detune and transpose
    /// expressed in bend units (12 semitones per 8192).
    fn send_pitch(&self, sink: &mut dyn MidiSink) {
        let Some(hw) = self.hw_channel else { return };
        let value = (self.pitchbend as i32
            + self.detune_eff as i32 * 64 / 12
            + self.transpose_eff as i32 * 8192 / 12)
            .clamp(-8192, 8191) as i16;
        sink.send(ChannelMessage::pitch_bend(hw, value));
    }

    pub fn sustain(&mut self, on: bool, sink: &mut dyn MidiSink) {
        self.pedal = on;
        if let Some(hw) = self.hw_channel {
            sink.send(ChannelMessage::control_change(hw, 64, if on { 127 } else { 0 }));
        }
    }

    pub fn modulation_wheel(&mut self, value: u8, sink: &mut dyn MidiSink) {
        self.modwheel = value;
        if let Some(hw) = self.hw_channel {
            sink.send(ChannelMessage::control_change(hw, 1, value));
        }
    }

    pub fn pitch_bend_factor(&mut self, semitones: u8, sink: &mut dyn MidiSink) {
        self.pitchbend_factor = semitones;
        if let Some(hw) = self.hw_channel {
            sink.send(ChannelMessage::control_change(hw, 16, semitones));
        }
    }

    pub fn set_polyphony(&mut self, voices: u8) {
        self.polyphony = voices;
    }

    /// Part priority offset; the effective priority combines it with the
    /// owner's base priority.
    pub fn set_pri(&mut self, pri: i8, owner_pri: u8) {
        self.pri = pri;
        self.pri_eff = (pri as i32 + owner_pri as i32).clamp(0, 255) as u8;
    }

    pub fn effect_level(&mut self, level: u8, sink: &mut dyn MidiSink) {
        self.effect_level = level;
        if let Some(hw) = self.hw_channel {
            sink.send(ChannelMessage::control_change(hw, 91, level));
        }
    }

    pub fn chorus_level(&mut self, level: u8, sink: &mut dyn MidiSink) {
        self.chorus_level = level;
        if let Some(hw) = self.hw_channel {
            sink.send(ChannelMessage::control_change(hw, 93, level));
        }
    }

    /// Program change for a native-MIDI resource.
    pub fn program_change(&mut self, program: u8, sink: &mut dyn MidiSink) {
        self.program = program;
        if let Some(hw) = self.hw_channel {
            if self.on {
                sink.send(ChannelMessage::program_change(hw, program));
            }
        }
    }

    /// Program selection for an internal-instrument resource. The program
    /// indexes the engine's instrument set rather than the device's.
    pub fn load_internal_instrument(&mut self, program: u8, sink: &mut dyn MidiSink) {
        debug!("part chan {} loads internal instrument {program}", self.chan);
        self.program_change(program, sink);
    }

    /// Enable or disable the part. Disabling silences it and gives up its
    /// hardware channel; the caller is expected to reallocate afterwards.
    pub fn set_onoff(&mut self, on: bool, sink: &mut dyn MidiSink) {
        if self.on == on {
            return;
        }
        self.on = on;
        if !on {
            if self.pedal {
                self.sustain(false, sink);
            }
            self.all_notes_off(sink);
            self.hw_channel = None;
        }
    }

    /// Bring a freshly assigned hardware channel up to date.
    fn send_setup(&self, sink: &mut dyn MidiSink) {
        let Some(hw) = self.hw_channel else { return };
        sink.send(ChannelMessage::program_change(hw, self.program));
        sink.send(ChannelMessage::control_change(hw, 7, self.vol_eff));
        sink.send(ChannelMessage::control_change(hw, 10, (self.pan_eff as i32 + 0x40) as u8));
        self.send_pitch(sink);
    }
}

/// Fixed-capacity pool of parts shared by every player.
pub struct PartPool {
    parts: Vec<Part>,
    next_stamp: u64,
}

impl Default for PartPool {
    fn default() -> Self {
        Self::new()
    }
}

impl PartPool {
    pub fn new() -> Self {
        Self {
            parts: (0..MAX_PARTS).map(|_| Part::default()).collect(),
            next_stamp: 1,
        }
    }

    pub fn part(&self, id: PartId) -> &Part {
        &self.parts[id]
    }

    pub fn part_mut(&mut self, id: PartId) -> &mut Part {
        &mut self.parts[id]
    }

    /// Allocate a part for `owner` at effective priority `pri`.
    ///
    /// Prefers a free part; otherwise evicts the lowest-priority part that
    /// sits strictly below `pri`. Returns `None` when the pool is
    /// exhausted and nothing is reclaimable.
    pub fn allocate(&mut self, owner: usize, pri: u8, sink: &mut dyn MidiSink) -> Option<PartId> {
        let id = match self.parts.iter().position(|p| p.owner.is_none()) {
            Some(free) => free,
            None => {
                let (victim, victim_pri) = self
                    .parts
                    .iter()
                    .enumerate()
                    .map(|(i, p)| (i, p.pri_eff))
                    .min_by_key(|&(_, pri)| pri)?;
                if victim_pri >= pri {
                    return None;
                }
                debug!("part {victim} (pri {victim_pri}) evicted for pri {pri}");
                self.release(victim, sink);
                victim
            }
        };

        let stamp = self.next_stamp;
        self.next_stamp += 1;
        let part = &mut self.parts[id];
        *part = Part {
            owner: Some(owner),
            on: true,
            pri_eff: pri,
            stamp,
            ..Part::default()
        };
        Some(id)
    }

    /// Return a part to the pool, silencing it first.
    pub fn release(&mut self, id: PartId, sink: &mut dyn MidiSink) {
        let part = &mut self.parts[id];
        if part.owner.is_some() {
            if part.pedal {
                part.sustain(false, sink);
            }
            part.all_notes_off(sink);
        }
        part.hw_channel = None;
        part.owner = None;
        part.on = false;
    }

    /// Release every part owned by `owner`.
    pub fn release_owned_by(&mut self, owner: usize, sink: &mut dyn MidiSink) {
        for id in 0..self.parts.len() {
            if self.parts[id].owner == Some(owner) {
                self.release(id, sink);
            }
        }
    }

    /// Hand the hardware channels to the highest-priority enabled parts.
    ///
    /// Percussion parts always map to the fixed percussion channel; the
    /// remaining channels go to melodic parts by effective priority, most
    /// recently allocated first on ties. Losing a channel silences the
    /// part; gaining one replays its setup state.
    pub fn reallocate(&mut self, sink: &mut dyn MidiSink) {
        let mut melodic: Vec<PartId> = (0..self.parts.len())
            .filter(|&i| {
                let p = &self.parts[i];
                p.owner.is_some() && p.on && !p.percussion
            })
            .collect();
        melodic.sort_by(|&a, &b| {
            let pa = &self.parts[a];
            let pb = &self.parts[b];
            pb.pri_eff.cmp(&pa.pri_eff).then(pb.stamp.cmp(&pa.stamp))
        });
        melodic.truncate(NUM_HW_CHANNELS - 1);

        // Revoke channels from parts that no longer qualify.
        for id in 0..self.parts.len() {
            let keeps = self.parts[id].percussion && self.parts[id].on
                || melodic.contains(&id);
            if self.parts[id].hw_channel.is_some() && !keeps {
                self.parts[id].all_notes_off(sink);
                self.parts[id].hw_channel = None;
            }
        }

        for id in 0..self.parts.len() {
            let p = &mut self.parts[id];
            if p.percussion && p.on && p.owner.is_some() {
                p.hw_channel = Some(PERCUSSION_CHANNEL);
            }
        }

        let mut used = [false; NUM_HW_CHANNELS];
        used[PERCUSSION_CHANNEL as usize] = true;
        for &id in &melodic {
            if let Some(hw) = self.parts[id].hw_channel {
                used[hw as usize] = true;
            }
        }
        for &id in &melodic {
            if self.parts[id].hw_channel.is_some() {
                continue;
            }
            let Some(free) = used.iter().position(|&u| !u) else { break };
            used[free] = true;
            self.parts[id].hw_channel = Some(free as u8);
            self.parts[id].send_setup(sink);
        }
    }

    /// Number of parts currently owned by any player.
    pub fn allocated_count(&self) -> usize {
        self.parts.iter().filter(|p| p.owner.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cueseq_ir::NullSink;

    #[test]
    fn allocate_prefers_free_parts() {
        let mut pool = PartPool::new();
        let mut sink = NullSink;
        let a = pool.allocate(0, 0x80, &mut sink).unwrap();
        let b = pool.allocate(1, 0x40, &mut sink).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.part(a).owner, Some(0));
        assert_eq!(pool.part(b).owner, Some(1));
    }

    #[test]
    fn exhausted_pool_evicts_strictly_lower_priority() {
        let mut pool = PartPool::new();
        let mut sink = NullSink;
        for _ in 0..MAX_PARTS {
            pool.allocate(0, 0x40, &mut sink).unwrap();
        }
        let id = pool.allocate(1, 0x80, &mut sink).unwrap();
        assert_eq!(pool.part(id).owner, Some(1));
        assert_eq!(pool.allocated_count(), MAX_PARTS);
    }

    #[test]
    fn equal_priority_is_not_evicted() {
        let mut pool = PartPool::new();
        let mut sink = NullSink;
        for _ in 0..MAX_PARTS {
            pool.allocate(0, 0x80, &mut sink).unwrap();
        }
        assert!(pool.allocate(1, 0x80, &mut sink).is_none());
    }

    #[test]
    fn release_makes_part_reusable() {
        let mut pool = PartPool::new();
        let mut sink = NullSink;
        let id = pool.allocate(0, 0x80, &mut sink).unwrap();
        pool.release(id, &mut sink);
        assert_eq!(pool.part(id).owner, None);
        let again = pool.allocate(1, 0x10, &mut sink).unwrap();
        assert_eq!(again, id);
    }

    #[test]
    fn reallocate_assigns_channels_by_priority() {
        let mut pool = PartPool::new();
        let mut sink = NullSink;
        let mut ids = Vec::new();
        for i in 0..20 {
            ids.push(pool.allocate(0, 100 + (i % 3) as u8, &mut sink).unwrap());
        }
        pool.reallocate(&mut sink);
        let with_hw = ids.iter().filter(|&&id| pool.part(id).hw_channel.is_some()).count();
        assert_eq!(with_hw, NUM_HW_CHANNELS - 1);
        // Nobody holds the percussion channel.
        assert!(ids
            .iter()
            .all(|&id| pool.part(id).hw_channel != Some(PERCUSSION_CHANNEL)));
        // Every assigned part outranks or matches every unassigned one.
        let min_assigned = ids
            .iter()
            .filter(|&&id| pool.part(id).hw_channel.is_some())
            .map(|&id| pool.part(id).pri_eff)
            .min()
            .unwrap();
        let max_unassigned = ids
            .iter()
            .filter(|&&id| pool.part(id).hw_channel.is_none())
            .map(|&id| pool.part(id).pri_eff)
            .max()
            .unwrap();
        assert!(min_assigned >= max_unassigned);
    }

    #[test]
    fn percussion_part_gets_fixed_channel() {
        let mut pool = PartPool::new();
        let mut sink = NullSink;
        let id = pool.allocate(0, 0x80, &mut sink).unwrap();
        pool.part_mut(id).percussion = true;
        pool.reallocate(&mut sink);
        assert_eq!(pool.part(id).hw_channel, Some(PERCUSSION_CHANNEL));
    }

    #[test]
    fn disabled_part_loses_channel_on_reallocate() {
        let mut pool = PartPool::new();
        let mut sink = NullSink;
        let id = pool.allocate(0, 0x80, &mut sink).unwrap();
        pool.reallocate(&mut sink);
        assert!(pool.part(id).hw_channel.is_some());
        pool.part_mut(id).set_onoff(false, &mut sink);
        pool.reallocate(&mut sink);
        assert!(pool.part(id).hw_channel.is_none());
    }

    #[test]
    fn transpose_clamp_folds_by_octaves() {
        assert_eq!(transpose_clamp(13, -12, 12), 1);
        assert_eq!(transpose_clamp(-13, -12, 12), -1);
        assert_eq!(transpose_clamp(7, -7, 7), 7);
        assert_eq!(transpose_clamp(8, -7, 7), -4);
    }
}
