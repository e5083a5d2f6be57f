//! The multi-player engine driver.
//!
//! Owns the player slots, the shared part pool, the output sink and the
//! parser factory. All players advance cooperatively inside `on_timer`,
//! in slot order; every entry point takes `&mut self`, so mutation is
//! serialized on the caller's thread.

use cueseq_ir::{EngineConfig, MidiSink, ParserFactory, ResourceProvider};

use crate::error::EngineError;
use crate::part::PartPool;
use crate::player::{Player, PlayerContext};

/// Number of player slots.
pub const MAX_PLAYERS: usize = 8;

/// Number of volume groups. Group 0 is the master group.
pub const NUM_VOL_GROUPS: usize = 8;

/// Group id scripts use to address the master group directly.
pub const VOL_GROUP_MASTER: u16 = 0xFFFF;

pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) players: Vec<Player>,
    pub(crate) pool: PartPool,
    pub(crate) group_volumes: [u8; NUM_VOL_GROUPS],
    pub(crate) sink: Box<dyn MidiSink>,
    pub(crate) factory: Box<ParserFactory>,
    pub(crate) provider: Box<dyn ResourceProvider>,
}

/// Split-borrow the engine fields into a `PlayerContext`.
macro_rules! context {
    ($engine:expr) => {
        PlayerContext {
            pool: &mut $engine.pool,
            sink: $engine.sink.as_mut(),
            config: &$engine.config,
            group_volumes: &$engine.group_volumes,
            factory: $engine.factory.as_ref(),
        }
    };
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        sink: Box<dyn MidiSink>,
        factory: Box<ParserFactory>,
        provider: Box<dyn ResourceProvider>,
    ) -> Self {
        let players = (0..MAX_PLAYERS)
            .map(|i| Player::new(i, config.default_speed()))
            .collect();
        Self {
            config,
            players,
            pool: PartPool::new(),
            group_volumes: [127; NUM_VOL_GROUPS],
            sink,
            factory,
            provider,
        }
    }

    /// Start a sound on a free player slot. A sound already playing under
    /// the same id is stopped first.
    pub fn start_sound(&mut self, id: u32) -> Result<(), EngineError> {
        let _ = self.stop_sound(id);

        let Engine { players, pool, sink, config, group_volumes, factory, provider } = self;
        let data = provider.sound_data(id).ok_or(EngineError::SoundNotFound(id))?;
        let header = provider.sound_header(id);
        let mut ctx = PlayerContext {
            pool,
            sink: sink.as_mut(),
            config,
            group_volumes,
            factory: factory.as_ref(),
        };
        let player = players
            .iter_mut()
            .find(|p| !p.is_active())
            .ok_or(EngineError::NoFreePlayer)?;
        player.start(id, data, header, &mut ctx)
    }

    pub fn stop_sound(&mut self, id: u32) -> Result<(), EngineError> {
        let mut ctx = context!(self);
        let mut found = false;
        for player in self.players.iter_mut() {
            if player.is_active() && player.sound_id() == id {
                player.stop(&mut ctx);
                found = true;
            }
        }
        if found {
            Ok(())
        } else {
            Err(EngineError::NotPlaying(id))
        }
    }

    pub fn stop_all(&mut self) {
        let mut ctx = context!(self);
        for player in self.players.iter_mut() {
            player.stop(&mut ctx);
        }
    }

    /// Advance every active player by one timer period.
    pub fn on_timer(&mut self) {
        let mut ctx = context!(self);
        for player in self.players.iter_mut() {
            if player.is_active() {
                player.on_timer(&mut ctx);
            }
        }
    }

    fn with_player<R>(
        &mut self,
        id: u32,
        f: impl FnOnce(&mut Player, &mut PlayerContext) -> R,
    ) -> Result<R, EngineError> {
        let mut ctx = context!(self);
        let player = self
            .players
            .iter_mut()
            .find(|p| p.is_active() && p.sound_id() == id)
            .ok_or(EngineError::NotPlaying(id))?;
        Ok(f(player, &mut ctx))
    }

    fn find_player(&self, id: u32) -> Option<&Player> {
        self.players.iter().find(|p| p.is_active() && p.sound_id() == id)
    }

    pub fn set_volume(&mut self, id: u32, volume: u8) -> Result<(), EngineError> {
        self.with_player(id, |p, ctx| p.set_volume(volume, ctx))?
    }

    pub fn set_pan(&mut self, id: u32, pan: i8) -> Result<(), EngineError> {
        self.with_player(id, |p, ctx| p.set_pan(pan, ctx))
    }

    pub fn set_detune(&mut self, id: u32, detune: i16) -> Result<(), EngineError> {
        self.with_player(id, |p, ctx| p.set_detune(detune, ctx))
    }

    pub fn set_priority(&mut self, id: u32, priority: u8) -> Result<(), EngineError> {
        self.with_player(id, |p, ctx| p.set_priority(priority, ctx))
    }

    pub fn set_speed(&mut self, id: u32, speed: u8) -> Result<(), EngineError> {
        self.with_player(id, |p, ctx| p.set_speed(speed, ctx))
    }

    pub fn set_transpose(
        &mut self,
        id: u32,
        relative: bool,
        value: i8,
    ) -> Result<(), EngineError> {
        self.with_player(id, |p, ctx| p.set_transpose(relative, value, ctx))?
    }

    pub fn part_set_transpose(
        &mut self,
        id: u32,
        chan: u8,
        relative: bool,
        value: i8,
    ) -> Result<(), EngineError> {
        self.with_player(id, |p, ctx| p.part_set_transpose(chan, relative, value, ctx))
    }

    pub fn set_note_offset(&mut self, id: u32, offset: i16) -> Result<(), EngineError> {
        self.with_player(id, |p, _| p.set_note_offset(offset))
    }

    pub fn set_vol_group(&mut self, id: u32, group: u16) -> Result<(), EngineError> {
        self.with_player(id, |p, ctx| p.set_vol_group(group, ctx))
    }

    pub fn jump(&mut self, id: u32, track: u16, beat: u32, tick: u32) -> Result<(), EngineError> {
        self.with_player(id, |p, ctx| p.jump(track, beat, tick, ctx))?
    }

    pub fn scan(&mut self, id: u32, track: u16, beat: u32, tick: u32) -> Result<(), EngineError> {
        self.with_player(id, |p, ctx| p.scan(track, beat, tick, ctx))?
    }

    pub fn set_loop(
        &mut self,
        id: u32,
        count: u16,
        to_beat: u16,
        to_tick: u16,
        from_beat: u16,
        from_tick: u16,
    ) -> Result<(), EngineError> {
        self.with_player(id, |p, _| p.set_loop(count, to_beat, to_tick, from_beat, from_tick))?
    }

    pub fn clear_loop(&mut self, id: u32) -> Result<(), EngineError> {
        self.with_player(id, |p, _| p.clear_loop())
    }

    /// Arm a hook value for a player. `class` addresses the hook table
    /// (0 jump, 1 transpose, 2..=5 the per-channel tables).
    pub fn set_hook(
        &mut self,
        id: u32,
        class: u8,
        value: u8,
        chan: u8,
    ) -> Result<(), EngineError> {
        let applied = self.with_player(id, |p, _| p.hooks.set(class, value, chan))?;
        if applied {
            Ok(())
        } else {
            Err(EngineError::OutOfRange)
        }
    }

    pub fn clear_hooks(&mut self, id: u32) -> Result<(), EngineError> {
        self.with_player(id, |p, _| p.hooks.clear())
    }

    pub fn add_parameter_fader(
        &mut self,
        id: u32,
        param: i16,
        target: i16,
        time: u16,
    ) -> Result<(), EngineError> {
        self.with_player(id, |p, ctx| p.add_parameter_fader(param, target, time, ctx))?
    }

    /// Numeric player query; -1 when the sound is not playing.
    pub fn get_param(&self, id: u32, param: i32, chan: u8) -> i32 {
        self.find_player(id)
            .map(|p| p.get_param(param, chan, &self.pool))
            .unwrap_or(-1)
    }

    pub fn is_sound_active(&self, id: u32) -> bool {
        self.find_player(id).is_some()
    }

    pub fn is_fading_out(&self, id: u32) -> bool {
        self.find_player(id).map(|p| p.is_fading_out()).unwrap_or(false)
    }

    pub fn music_timer(&self, id: u32) -> u32 {
        self.find_player(id).map(|p| p.music_timer()).unwrap_or(0)
    }

    pub fn active_sound_count(&self) -> usize {
        self.players.iter().filter(|p| p.is_active()).count()
    }

    /// Set a group volume and push it through every active player.
    pub fn set_group_volume(&mut self, group: usize, volume: u8) -> Result<(), EngineError> {
        if group >= NUM_VOL_GROUPS || volume > 127 {
            return Err(EngineError::OutOfRange);
        }
        self.group_volumes[group] = volume;
        let mut ctx = context!(self);
        for player in self.players.iter_mut() {
            if player.is_active() {
                player.refresh_volume(&mut ctx);
            }
        }
        Ok(())
    }

    pub fn set_master_volume(&mut self, volume: u8) -> Result<(), EngineError> {
        self.set_group_volume(0, volume)
    }

    pub fn group_volume(&self, group: usize) -> u8 {
        self.group_volumes.get(group).copied().unwrap_or(self.group_volumes[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::engine_with_sounds;

    #[test]
    fn start_and_stop_lifecycle() {
        let mut engine = engine_with_sounds(&[10, 11]);
        engine.start_sound(10).unwrap();
        assert!(engine.is_sound_active(10));
        assert_eq!(engine.active_sound_count(), 1);
        engine.stop_sound(10).unwrap();
        assert!(!engine.is_sound_active(10));
        assert_eq!(engine.stop_sound(10), Err(EngineError::NotPlaying(10)));
    }

    #[test]
    fn missing_resource_fails_cleanly() {
        let mut engine = engine_with_sounds(&[]);
        assert_eq!(engine.start_sound(5), Err(EngineError::SoundNotFound(5)));
        assert_eq!(engine.active_sound_count(), 0);
    }

    #[test]
    fn restarting_a_sound_reuses_its_slot() {
        let mut engine = engine_with_sounds(&[10]);
        engine.start_sound(10).unwrap();
        engine.start_sound(10).unwrap();
        assert_eq!(engine.active_sound_count(), 1);
    }

    #[test]
    fn player_slots_are_exhausted_at_capacity() {
        let ids: Vec<u32> = (1..=MAX_PLAYERS as u32 + 1).collect();
        let mut engine = engine_with_sounds(&ids);
        for &id in &ids[..MAX_PLAYERS] {
            engine.start_sound(id).unwrap();
        }
        assert_eq!(
            engine.start_sound(ids[MAX_PLAYERS]),
            Err(EngineError::NoFreePlayer)
        );
    }

    #[test]
    fn group_volume_scales_effective_volume() {
        let mut engine = engine_with_sounds(&[10]);
        engine.start_sound(10).unwrap();
        assert_eq!(engine.get_param(10, 1, 0), 127);
        engine.set_master_volume(64).unwrap();
        // The player's own volume is untouched; scaling is internal.
        assert_eq!(engine.get_param(10, 1, 0), 127);
        assert_eq!(engine.group_volume(0), 64);
    }

    #[test]
    fn commands_reject_inactive_sounds() {
        let mut engine = engine_with_sounds(&[10]);
        assert_eq!(engine.set_volume(10, 60), Err(EngineError::NotPlaying(10)));
        assert_eq!(engine.get_param(10, 1, 0), -1);
    }

    #[test]
    fn set_loop_validates_window() {
        let mut engine = engine_with_sounds(&[10]);
        engine.start_sound(10).unwrap();
        assert_eq!(
            engine.set_loop(10, 2, 5, 0, 6, 0),
            Err(EngineError::InvalidLoop)
        );
        engine.set_loop(10, 2, 2, 0, 10, 0).unwrap();
        assert_eq!(engine.get_param(10, 9, 0), 2);
    }
}
