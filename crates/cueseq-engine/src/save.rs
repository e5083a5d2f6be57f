//! Versioned save/restore of the whole engine state.
//!
//! One serializer drives both directions through version-gated `sync_*`
//! calls in a fixed field order, so the layout of every version stays
//! auditable in one place. Runtime state (parsers, hardware channels) is
//! rebuilt after loading.

use thiserror::Error;

use crate::engine::{Engine, NUM_VOL_GROUPS};
use crate::fader::ParameterFader;
use crate::part::{Part, PartId, PartPool, MAX_PARTS};
use crate::player::{Player, PlayerContext};

const SAVE_MAGIC: &[u8; 4] = b"CSAV";

/// Current save format version.
///
/// Version 1 stored detune as one byte and fader slots as
/// `(start, end, total time, elapsed time)`; both are converted on load.
pub const SAVE_VERSION: u16 = 2;

/// Shorthand for "no upper version bound".
const ANY: u16 = u16::MAX;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SaveError {
    #[error("not a save stream")]
    BadMagic,
    #[error("unsupported save version {0}")]
    UnsupportedVersion(u16),
    #[error("save stream ended unexpectedly")]
    UnexpectedEof,
}

enum Mode<'a> {
    Save(&'a mut Vec<u8>),
    Load { data: &'a [u8], pos: usize },
}

/// Bidirectional field serializer. Every `sync_*` call names the version
/// range in which the field exists; outside it the call is a no-op.
struct Serializer<'a> {
    mode: Mode<'a>,
    version: u16,
}

impl<'a> Serializer<'a> {
    fn saver(buf: &'a mut Vec<u8>) -> Self {
        Self { mode: Mode::Save(buf), version: SAVE_VERSION }
    }

    fn loader(data: &'a [u8], version: u16) -> Self {
        Self { mode: Mode::Load { data, pos: 0 }, version }
    }

    fn is_loading(&self) -> bool {
        matches!(self.mode, Mode::Load { .. })
    }

    fn version(&self) -> u16 {
        self.version
    }

    fn in_range(&self, min: u16, max: u16) -> bool {
        self.version >= min && self.version <= max
    }

    fn read(&mut self, n: usize) -> Result<&[u8], SaveError> {
        match &mut self.mode {
            Mode::Load { data, pos } => {
                if *pos + n > data.len() {
                    return Err(SaveError::UnexpectedEof);
                }
                let slice = &data[*pos..*pos + n];
                *pos += n;
                Ok(slice)
            }
            Mode::Save(_) => Err(SaveError::UnexpectedEof),
        }
    }

    fn sync_u8(&mut self, value: &mut u8, min: u16, max: u16) -> Result<(), SaveError> {
        if !self.in_range(min, max) {
            return Ok(());
        }
        if let Mode::Save(buf) = &mut self.mode {
            buf.push(*value);
            return Ok(());
        }
        *value = self.read(1)?[0];
        Ok(())
    }

    fn sync_i8(&mut self, value: &mut i8, min: u16, max: u16) -> Result<(), SaveError> {
        let mut raw = *value as u8;
        self.sync_u8(&mut raw, min, max)?;
        *value = raw as i8;
        Ok(())
    }

    fn sync_u16(&mut self, value: &mut u16, min: u16, max: u16) -> Result<(), SaveError> {
        if !self.in_range(min, max) {
            return Ok(());
        }
        if let Mode::Save(buf) = &mut self.mode {
            buf.extend_from_slice(&value.to_le_bytes());
            return Ok(());
        }
        let bytes = self.read(2)?;
        *value = u16::from_le_bytes([bytes[0], bytes[1]]);
        Ok(())
    }

    fn sync_i16(&mut self, value: &mut i16, min: u16, max: u16) -> Result<(), SaveError> {
        let mut raw = *value as u16;
        self.sync_u16(&mut raw, min, max)?;
        *value = raw as i16;
        Ok(())
    }

    fn sync_u32(&mut self, value: &mut u32, min: u16, max: u16) -> Result<(), SaveError> {
        if !self.in_range(min, max) {
            return Ok(());
        }
        if let Mode::Save(buf) = &mut self.mode {
            buf.extend_from_slice(&value.to_le_bytes());
            return Ok(());
        }
        let bytes = self.read(4)?;
        *value = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Ok(())
    }

    fn sync_bool(&mut self, value: &mut bool, min: u16, max: u16) -> Result<(), SaveError> {
        let mut raw = *value as u8;
        self.sync_u8(&mut raw, min, max)?;
        *value = raw != 0;
        Ok(())
    }

    fn sync_bytes(&mut self, bytes: &mut [u8], min: u16, max: u16) -> Result<(), SaveError> {
        if !self.in_range(min, max) {
            return Ok(());
        }
        if let Mode::Save(buf) = &mut self.mode {
            buf.extend_from_slice(bytes);
            return Ok(());
        }
        let src = self.read(bytes.len())?;
        bytes.copy_from_slice(src);
        Ok(())
    }
}

fn sync_fader(s: &mut Serializer, pf: &mut ParameterFader) -> Result<(), SaveError> {
    s.sync_i16(&mut pf.param, 1, ANY)?;

    if s.is_loading() && s.version() < 2 {
        // Version 1 stored endpoints and elapsed time; reconstruct the
        // fixed-point stepping state from them. Total time below one fade
        // step is rounded up; a degenerate fade is dropped.
        let mut start = 0i16;
        let mut end = 0i16;
        let mut total = 0u32;
        let mut elapsed = 0u32;
        s.sync_i16(&mut start, 1, ANY)?;
        s.sync_i16(&mut end, 1, ANY)?;
        s.sync_u32(&mut total, 1, ANY)?;
        s.sync_u32(&mut elapsed, 1, ANY)?;

        let diff = end as i32 - start as i32;
        if pf.param != 0 && diff != 0 && total != 0 {
            if total < 10000 {
                total = 10000;
                elapsed = (total as i32 - diff) as u32;
            }
            let steps = (total / 10000) as i32;
            pf.dir = if diff >= 0 { 1 } else { -1 };
            pf.incr = (diff / steps) as i16;
            pf.ifrac = (diff.unsigned_abs() % steps as u32) as u16;
            pf.state = (start as i32 + diff * elapsed as i32 / total as i32) as i16;
        } else {
            pf.param = 0;
        }
        pf.irem = 0;
        pf.ttime = 0;
        pf.cntdwn = 0;
    } else {
        s.sync_i8(&mut pf.dir, 2, ANY)?;
        s.sync_i16(&mut pf.incr, 2, ANY)?;
        s.sync_u16(&mut pf.ifrac, 2, ANY)?;
        s.sync_u16(&mut pf.irem, 2, ANY)?;
        s.sync_u16(&mut pf.ttime, 2, ANY)?;
        s.sync_u16(&mut pf.cntdwn, 2, ANY)?;
        s.sync_i16(&mut pf.state, 2, ANY)?;
    }
    Ok(())
}

fn sync_player(s: &mut Serializer, player: &mut Player, new_system: bool) -> Result<(), SaveError> {
    // Part linkage: count, then pool indices front to back.
    let mut count = player.parts.len() as u16;
    s.sync_u16(&mut count, 1, ANY)?;
    if s.is_loading() {
        while player.parts.pop_front().is_some() {}
        for _ in 0..count.min(MAX_PARTS as u16) {
            let mut id = 0u16;
            s.sync_u16(&mut id, 1, ANY)?;
            let _ = player.parts.push_back(id as PartId % MAX_PARTS);
        }
    } else {
        let ids: Vec<u16> = player.parts.iter().map(|&id| id as u16).collect();
        for mut id in ids {
            s.sync_u16(&mut id, 1, ANY)?;
        }
    }

    s.sync_bool(&mut player.active, 1, ANY)?;
    s.sync_u32(&mut player.id, 1, ANY)?;
    s.sync_u8(&mut player.priority, 1, ANY)?;
    s.sync_u8(&mut player.volume, 1, ANY)?;
    s.sync_i8(&mut player.pan, 1, ANY)?;
    s.sync_i8(&mut player.transpose, 1, ANY)?;
    // Detune widened to two bytes at version 2.
    if s.is_loading() && s.version() < 2 {
        let mut detune = 0i8;
        s.sync_i8(&mut detune, 1, ANY)?;
        player.detune = detune as i16;
    } else {
        s.sync_i16(&mut player.detune, 2, ANY)?;
    }
    s.sync_u16(&mut player.vol_group, 1, ANY)?;
    s.sync_u8(&mut player.vol_eff, 1, ANY)?;
    s.sync_u8(&mut player.speed, 1, ANY)?;
    s.sync_u16(&mut player.track_index, 1, ANY)?;
    s.sync_u16(&mut player.looper.to_beat, 1, ANY)?;
    s.sync_u16(&mut player.looper.from_beat, 1, ANY)?;
    s.sync_u16(&mut player.looper.counter, 1, ANY)?;
    s.sync_u16(&mut player.looper.to_tick, 1, ANY)?;
    s.sync_u16(&mut player.looper.from_tick, 1, ANY)?;
    s.sync_u32(&mut player.music_tick, 1, ANY)?;
    s.sync_u8(&mut player.hooks.jump[0], 1, ANY)?;
    s.sync_u8(&mut player.hooks.transpose, 1, ANY)?;
    s.sync_bytes(&mut player.hooks.part_onoff, 1, ANY)?;
    s.sync_bytes(&mut player.hooks.part_volume, 1, ANY)?;
    s.sync_bytes(&mut player.hooks.part_program, 1, ANY)?;
    s.sync_bytes(&mut player.hooks.part_transpose, 1, ANY)?;
    for fader in player.faders.iter_mut() {
        sync_fader(s, fader)?;
    }

    // Old saves on the new parameter scale kept the legacy speed default.
    if new_system && s.is_loading() && s.version() < 2 && player.speed == 128 {
        player.speed = 64;
    }
    Ok(())
}

fn sync_part(s: &mut Serializer, part: &mut Part) -> Result<(), SaveError> {
    let mut owner = part.owner.map(|o| o as u8 + 1).unwrap_or(0);
    s.sync_u8(&mut owner, 1, ANY)?;
    if s.is_loading() {
        part.owner = (owner != 0).then(|| owner as usize - 1);
    }

    s.sync_u8(&mut part.chan, 1, ANY)?;
    s.sync_bool(&mut part.on, 1, ANY)?;
    s.sync_u8(&mut part.vol, 1, ANY)?;
    s.sync_u8(&mut part.vol_eff, 1, ANY)?;
    s.sync_i8(&mut part.pan, 1, ANY)?;
    s.sync_i8(&mut part.pan_eff, 1, ANY)?;
    s.sync_i8(&mut part.transpose, 1, ANY)?;
    s.sync_i8(&mut part.transpose_eff, 1, ANY)?;
    s.sync_i8(&mut part.detune, 1, ANY)?;
    s.sync_i16(&mut part.detune_eff, 1, ANY)?;
    s.sync_i8(&mut part.pri, 1, ANY)?;
    s.sync_u8(&mut part.pri_eff, 1, ANY)?;
    s.sync_bool(&mut part.pedal, 1, ANY)?;
    s.sync_u8(&mut part.modwheel, 1, ANY)?;
    s.sync_i16(&mut part.pitchbend, 1, ANY)?;
    s.sync_u8(&mut part.pitchbend_factor, 1, ANY)?;
    s.sync_u8(&mut part.polyphony, 1, ANY)?;
    s.sync_u8(&mut part.program, 1, ANY)?;
    s.sync_u8(&mut part.effect_level, 1, ANY)?;
    s.sync_u8(&mut part.chorus_level, 1, ANY)?;
    s.sync_bool(&mut part.percussion, 1, ANY)?;
    Ok(())
}

fn sync_engine(
    s: &mut Serializer,
    players: &mut [Player],
    pool: &mut PartPool,
    group_volumes: &mut [u8; NUM_VOL_GROUPS],
    new_system: bool,
) -> Result<(), SaveError> {
    s.sync_bytes(group_volumes, 1, ANY)?;
    for player in players.iter_mut() {
        sync_player(s, player, new_system)?;
    }
    for i in 0..MAX_PARTS {
        sync_part(s, pool.part_mut(i))?;
    }
    Ok(())
}

impl Engine {
    /// Serialize the whole engine state.
    pub fn save(&mut self) -> Result<Vec<u8>, SaveError> {
        for player in self.players.iter_mut() {
            player.music_tick = player.current_tick();
        }

        let mut buf = Vec::new();
        buf.extend_from_slice(SAVE_MAGIC);
        buf.extend_from_slice(&SAVE_VERSION.to_le_bytes());
        {
            let Engine { players, pool, group_volumes, config, .. } = &mut *self;
            let mut s = Serializer::saver(&mut buf);
            sync_engine(&mut s, players, pool, group_volumes, config.new_system)?;
        }
        Ok(buf)
    }

    /// Restore engine state from a save stream. Everything currently
    /// playing is stopped first; players whose resource can no longer be
    /// found come back stopped.
    pub fn load(&mut self, data: &[u8]) -> Result<(), SaveError> {
        if data.len() < 6 || &data[0..4] != SAVE_MAGIC {
            return Err(SaveError::BadMagic);
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version == 0 || version > SAVE_VERSION {
            return Err(SaveError::UnsupportedVersion(version));
        }

        self.stop_all();
        self.pool = PartPool::new();

        {
            let Engine { players, pool, group_volumes, config, .. } = &mut *self;
            let mut s = Serializer::loader(&data[6..], version);
            sync_engine(&mut s, players, pool, group_volumes, config.new_system)?;
        }

        // Rebuild runtime state: parsers, positions, hardware channels.
        let Engine { players, pool, sink, config, group_volumes, factory, provider } = self;
        let mut ctx = PlayerContext {
            pool,
            sink: sink.as_mut(),
            config,
            group_volumes,
            factory: factory.as_ref(),
        };
        for player in players.iter_mut() {
            if !player.active {
                continue;
            }
            match provider.sound_data(player.id) {
                Some(bytes) => {
                    if player.fix_after_load(bytes, &mut ctx).is_err() {
                        player.stop(&mut ctx);
                    }
                }
                None => player.stop(&mut ctx),
            }
        }
        ctx.pool.reallocate(ctx.sink);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fader::fade_param;
    use crate::testutil::engine_with_sounds;

    #[test]
    fn round_trip_preserves_player_state() {
        let mut engine = engine_with_sounds(&[10, 11]);
        engine.start_sound(10).unwrap();
        engine.set_volume(10, 90).unwrap();
        engine.set_loop(10, 3, 2, 30, 10, 0).unwrap();
        engine.set_hook(10, 1, 5, 0).unwrap();
        engine.jump(10, 0, 4, 120).unwrap();
        engine
            .add_parameter_fader(10, fade_param::SPEED, 100, 40)
            .unwrap();

        let saved = engine.save().unwrap();

        let mut restored = engine_with_sounds(&[10, 11]);
        restored.load(&saved).unwrap();

        assert!(restored.is_sound_active(10));
        assert_eq!(restored.get_param(10, 1, 0), 90);
        assert_eq!(restored.get_param(10, 9, 0), 3);
        assert_eq!(restored.get_param(10, 10, 0), 2);
        assert_eq!(restored.get_param(10, 11, 0), 30);
        assert_eq!(restored.get_param(10, 19, 0), 5);
        // Position survives via the saved music tick.
        assert_eq!(restored.get_param(10, 7, 0), 4);
        assert_eq!(restored.get_param(10, 8, 0), 120);
    }

    #[test]
    fn load_rejects_garbage_and_future_versions() {
        let mut engine = engine_with_sounds(&[]);
        assert_eq!(engine.load(b"nope"), Err(SaveError::BadMagic));

        let mut future = b"CSAV".to_vec();
        future.extend_from_slice(&99u16.to_le_bytes());
        assert_eq!(engine.load(&future), Err(SaveError::UnsupportedVersion(99)));

        let mut truncated = b"CSAV".to_vec();
        truncated.extend_from_slice(&2u16.to_le_bytes());
        truncated.push(0);
        assert_eq!(engine.load(&truncated), Err(SaveError::UnexpectedEof));
    }

    #[test]
    fn missing_resource_leaves_player_stopped() {
        let mut engine = engine_with_sounds(&[10]);
        engine.start_sound(10).unwrap();
        let saved = engine.save().unwrap();

        let mut restored = engine_with_sounds(&[]);
        restored.load(&saved).unwrap();
        assert!(!restored.is_sound_active(10));
    }

    #[test]
    fn legacy_fader_slots_are_converted() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&fade_param::VOLUME.to_le_bytes());
        bytes.extend_from_slice(&100i16.to_le_bytes()); // start
        bytes.extend_from_slice(&0i16.to_le_bytes()); // end
        bytes.extend_from_slice(&50000u32.to_le_bytes()); // total time
        bytes.extend_from_slice(&20000u32.to_le_bytes()); // elapsed

        let mut s = Serializer::loader(&bytes, 1);
        let mut pf = ParameterFader::default();
        sync_fader(&mut s, &mut pf).unwrap();

        assert_eq!(pf.param, fade_param::VOLUME);
        assert_eq!(pf.dir, -1);
        assert_eq!(pf.incr, -20); // -100 over 5 steps
        assert_eq!(pf.ifrac, 0);
        assert_eq!(pf.state, 60); // 100 + (-100) * 20000 / 50000
        assert_eq!(pf.ttime, 0);
        assert_eq!(pf.cntdwn, 0);
    }

    #[test]
    fn degenerate_legacy_fader_is_dropped() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&fade_param::VOLUME.to_le_bytes());
        bytes.extend_from_slice(&64i16.to_le_bytes());
        bytes.extend_from_slice(&64i16.to_le_bytes()); // no difference
        bytes.extend_from_slice(&50000u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());

        let mut s = Serializer::loader(&bytes, 1);
        let mut pf = ParameterFader::default();
        sync_fader(&mut s, &mut pf).unwrap();
        assert!(pf.is_free());
    }

    #[test]
    fn legacy_speed_default_corrected_on_new_scale() {
        // A version-1 player record with speed 128.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0u16.to_le_bytes()); // no parts
        bytes.push(1); // active
        bytes.extend_from_slice(&7u32.to_le_bytes()); // id
        bytes.push(0x80); // priority
        bytes.push(127); // volume
        bytes.push(0); // pan
        bytes.push(0); // transpose
        bytes.push(0); // detune (one byte at version 1)
        bytes.extend_from_slice(&0xFFFFu16.to_le_bytes()); // vol group
        bytes.push(127); // vol_eff
        bytes.push(128); // speed
        bytes.extend_from_slice(&[0; 2]); // track index
        bytes.extend_from_slice(&[0; 10]); // loop fields
        bytes.extend_from_slice(&[0; 4]); // music tick
        bytes.extend_from_slice(&[0; 2]); // jump + transpose hooks
        bytes.extend_from_slice(&[0; 64]); // per-channel hooks
        for _ in 0..4 {
            bytes.extend_from_slice(&[0; 14]); // free version-1 fader slot
        }

        let mut s = Serializer::loader(&bytes, 1);
        let mut player = Player::new(0, 64);
        sync_player(&mut s, &mut player, true).unwrap();
        assert!(player.active);
        assert_eq!(player.id, 7);
        assert_eq!(player.speed, 64);
    }
}
