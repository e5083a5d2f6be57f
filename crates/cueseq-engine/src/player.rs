//! Per-sequence playback state machine.
//!
//! A player owns one parser, a subset of the shared part pool, a loop
//! window, a hook-gate table and four fader slots. Decoded events are
//! dispatched to part operations; loop and fade logic run once per timer
//! tick independent of event delivery.
//!
//! All mutation happens on the caller's thread through `&mut self`; the
//! engine is driven from a single timer callback and never locks.

use std::mem;

use cueseq_ir::{
    beat_of_tick, beat_tick_to_ticks, detect_kind, tick_in_beat, ChannelMessage, DeviceClass,
    EngineConfig, ParserFactory, ParserKind, SequenceEvent, SequenceParser, SoundHeader,
    SysExData, TICKS_PER_BEAT,
};
use heapless::Deque;
use log::{debug, warn};

use crate::engine::NUM_VOL_GROUPS;
use crate::error::EngineError;
use crate::fader::{fade_param, ParameterFader, FADER_SLOTS, FADE_QUANTUM_US};
use crate::hooks::{gate, HookGate};
use crate::looper::LoopState;
use crate::part::{transpose_clamp, PartId, PartPool, MAX_PARTS};

/// Vendor byte of the engine's private control protocol.
const ENGINE_SYSEX_ID: u8 = 0x7D;
/// Vendor byte of hardware instrument definitions.
const ROLAND_SYSEX_ID: u8 = 0x41;

/// Velocity used when replaying notes still sounding after a scan.
const SCAN_REPLAY_VELOCITY: u8 = 80;

/// Shared engine state a player needs while handling a call.
///
/// Built fresh by the engine for every player entry point; the borrows
/// keep pool and sink access serialized with the timer tick.
pub struct PlayerContext<'a> {
    pub pool: &'a mut PartPool,
    pub sink: &'a mut dyn cueseq_ir::MidiSink,
    pub config: &'a EngineConfig,
    pub group_volumes: &'a [u8; NUM_VOL_GROUPS],
    pub factory: &'a ParserFactory,
}

impl PlayerContext<'_> {
    /// Volume of a group; out-of-range ids (including the master marker)
    /// fall back to group 0, the master group.
    pub fn group_volume(&self, group: u16) -> u8 {
        self.group_volumes
            .get(group as usize)
            .copied()
            .unwrap_or(self.group_volumes[0])
    }
}

/// One active (or reusable inactive) sequence player.
pub struct Player {
    pub(crate) index: usize,
    pub(crate) active: bool,
    scanning: bool,
    pub(crate) id: u32,
    pub(crate) priority: u8,
    pub(crate) volume: u8,
    pub(crate) vol_eff: u8,
    pub(crate) vol_group: u16,
    pub(crate) pan: i8,
    pub(crate) transpose: i8,
    pub(crate) detune: i16,
    note_offset: i16,
    pub(crate) speed: u8,
    pub(crate) track_index: u16,
    pub(crate) music_tick: u32,
    pub(crate) looper: LoopState,
    pub(crate) hooks: HookGate,
    pub(crate) faders: [ParameterFader; FADER_SLOTS],
    transition_timer: u32,
    /// Owned parts, front = most recently allocated.
    pub(crate) parts: Deque<PartId, MAX_PARTS>,
    parser: Option<Box<dyn SequenceParser>>,
    parser_kind: Option<ParserKind>,
    mt32_source: bool,
    native_midi: bool,
    supports_percussion: bool,
    /// Per-key bitmask of channels with the key down, tracked while scanning.
    active_notes: [u16; 128],
    event_buf: Vec<SequenceEvent>,
}

impl Player {
    pub fn new(index: usize, default_speed: u8) -> Self {
        Self {
            index,
            active: false,
            scanning: false,
            id: 0,
            priority: 0,
            volume: 0,
            vol_eff: 0,
            vol_group: 0,
            pan: 0,
            transpose: 0,
            detune: 0,
            note_offset: 0,
            speed: default_speed,
            track_index: 0,
            music_tick: 0,
            looper: LoopState::default(),
            hooks: HookGate::default(),
            faders: [ParameterFader::default(); FADER_SLOTS],
            transition_timer: 0,
            parts: Deque::new(),
            parser: None,
            parser_kind: None,
            mt32_source: false,
            native_midi: false,
            supports_percussion: false,
            active_notes: [0; 128],
            event_buf: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn sound_id(&self) -> u32 {
        self.id
    }

    /// Begin playback of a sound. `header_chunk` is the optional start
    /// parameter chunk associated with the resource.
    pub fn start(
        &mut self,
        id: u32,
        data: &[u8],
        header_chunk: Option<&[u8]>,
        ctx: &mut PlayerContext,
    ) -> Result<(), EngineError> {
        self.mt32_source = ctx.config.device == DeviceClass::Mt32;
        self.native_midi = detect_kind(data) != ParserKind::Ro;
        self.supports_percussion = ctx.config.device != DeviceClass::Amiga;

        while self.parts.pop_front().is_some() {}
        self.active = true;
        self.id = id;

        self.load_start_parameters(header_chunk, ctx);

        for fader in &mut self.faders {
            fader.clear();
        }
        self.transition_timer = 0;
        self.hooks.clear();

        if let Err(err) = self.start_track(data, header_chunk, true, ctx) {
            self.active = false;
            self.id = 0;
            return Err(err);
        }

        debug!("starting sound {id}");
        Ok(())
    }

    /// Reset playback parameters to engine defaults, then overlay the
    /// header chunk's values if it carries any.
    fn load_start_parameters(&mut self, header_chunk: Option<&[u8]>, ctx: &PlayerContext) {
        self.priority = ctx.config.default_priority();
        self.volume = 0x7F;
        self.vol_group = crate::engine::VOL_GROUP_MASTER;
        self.vol_eff = self.scaled_volume(0x7F, ctx);
        self.pan = 0;
        self.transpose = 0;
        self.detune = 0;

        if let Some(header) = header_chunk.and_then(SoundHeader::parse) {
            self.priority = header.priority;
            self.volume = header.volume;
            self.vol_eff = self.scaled_volume(header.volume, ctx);
            self.pan = header.pan;
            self.transpose = header.transpose;
            self.detune = header.detune as i16;
        }
    }

    fn scaled_volume(&self, volume: u8, ctx: &PlayerContext) -> u8 {
        ((ctx.group_volume(self.vol_group) as u16 * (volume as u16 + 1)) >> 7) as u8
    }

    /// Select (or recreate) the parser for the resource and start the
    /// current track. With `reset_vars` the loop window and track index
    /// are cleared and the speed comes from the header chunk; without it
    /// the current speed carries over (mid-stream track switch, reload).
    pub(crate) fn start_track(
        &mut self,
        data: &[u8],
        header_chunk: Option<&[u8]>,
        reset_vars: bool,
        ctx: &mut PlayerContext,
    ) -> Result<(), EngineError> {
        if reset_vars {
            self.looper = LoopState::default();
            self.track_index = 0;
        }

        let kind = detect_kind(data);
        if self.parser_kind != Some(kind) {
            self.parser = Some((ctx.factory)(kind));
            self.parser_kind = Some(kind);
        }
        let Some(parser) = self.parser.as_mut() else {
            return Err(EngineError::LoadFailed(self.id));
        };
        if !parser.load(data) {
            return Err(EngineError::LoadFailed(self.id));
        }
        parser.set_track(self.track_index);

        let speed = if reset_vars {
            header_chunk
                .and_then(SoundHeader::parse)
                .map(|h| h.speed)
                .filter(|&s| s != 0)
                .unwrap_or(ctx.config.default_speed())
        } else {
            self.speed
        };
        self.set_speed(speed, ctx);
        Ok(())
    }

    /// Stop playback and release every owned resource. The player object
    /// itself stays around for reuse.
    pub fn stop(&mut self, ctx: &mut PlayerContext) {
        if !self.active {
            return;
        }
        debug!("stopping sound {}", self.id);

        if let Some(parser) = self.parser.as_mut() {
            parser.unload();
        }
        self.uninit_parts(ctx);
        self.active = false;
        self.scanning = false;
        self.id = 0;
        self.note_offset = 0;
        self.speed = ctx.config.default_speed();
    }

    fn uninit_parts(&mut self, ctx: &mut PlayerContext) {
        while let Some(id) = self.parts.pop_front() {
            ctx.pool.release(id, ctx.sink);
        }
        // Another player may be waiting for a channel.
        ctx.pool.reallocate(ctx.sink);
    }

    /// Drop part ids the pool has reassigned to someone else.
    fn prune_parts(&mut self, pool: &PartPool) {
        let mut kept: Deque<PartId, MAX_PARTS> = Deque::new();
        while let Some(id) = self.parts.pop_front() {
            if pool.part(id).owner == Some(self.index) {
                let _ = kept.push_back(id);
            }
        }
        self.parts = kept;
    }

    /// The already-owned part for a sequence channel, if any.
    pub(crate) fn get_active_part(&self, chan: u8, pool: &PartPool) -> Option<PartId> {
        self.parts
            .iter()
            .copied()
            .find(|&id| pool.part(id).owner == Some(self.index) && pool.part(id).chan == chan)
    }

    /// The part for a sequence channel, allocating one from the pool on
    /// first demand. Pool exhaustion drops the request with a diagnostic.
    pub(crate) fn get_part(&mut self, chan: u8, ctx: &mut PlayerContext) -> Option<PartId> {
        self.prune_parts(ctx.pool);
        if let Some(id) = self.get_active_part(chan, ctx.pool) {
            return Some(id);
        }

        let Some(id) = ctx.pool.allocate(self.index, self.priority, ctx.sink) else {
            debug!("no parts available for sound {} chan {chan}", self.id);
            return None;
        };
        let _ = self.parts.push_front(id);

        let limit = ctx.config.transpose_limit();
        let part = ctx.pool.part_mut(id);
        part.chan = chan;
        part.percussion = self.supports_percussion && chan == crate::part::PERCUSSION_CHANNEL;
        part.set_volume(127, self.vol_eff, ctx.sink);
        part.set_pan(0, self.pan, ctx.sink);
        part.set_transpose(0, self.transpose, limit, ctx.sink);
        part.set_detune(0, self.detune, ctx.sink);
        ctx.pool.reallocate(ctx.sink);
        Some(id)
    }

    /// Interpret one decoded channel-voice message.
    pub(crate) fn dispatch(&mut self, msg: ChannelMessage, ctx: &mut PlayerContext) {
        let chan = msg.channel();
        match msg.kind() {
            0x8 => {
                if self.scanning {
                    self.active_notes[msg.data1 as usize & 0x7F] &= !(1u16 << chan);
                } else if let Some(id) = self.get_part(chan, ctx) {
                    ctx.pool.part_mut(id).note_off(msg.data1, ctx.sink);
                }
            }
            0x9 => {
                let key = ((msg.data1 as i32 + self.note_offset as i32) & 0x7F) as u8;
                if self.scanning {
                    self.active_notes[key as usize] |= 1u16 << chan;
                } else {
                    let velocity = if self.mt32_source && !ctx.config.native_mt32 {
                        (((msg.data2 as u16 * 3) >> 2) + 32) as u8 & 0x7F
                    } else {
                        msg.data2
                    };
                    if let Some(id) = self.get_part(chan, ctx) {
                        ctx.pool.part_mut(id).note_on(key, velocity, ctx.sink);
                    }
                }
            }
            0xB => self.control_change(chan, msg.data1, msg.data2, ctx),
            0xC => {
                if let Some(id) = self.get_part(chan, ctx) {
                    let part = ctx.pool.part_mut(id);
                    if self.native_midi {
                        if msg.data1 < 128 {
                            part.program_change(msg.data1, ctx.sink);
                        }
                    } else if msg.data1 < 32 {
                        part.load_internal_instrument(msg.data1, ctx.sink);
                    }
                }
            }
            0xE => {
                if let Some(id) = self.get_part(chan, ctx) {
                    ctx.pool.part_mut(id).pitch_bend(msg.pitch_bend_value(), ctx.sink);
                }
            }
            // Aftertouch, channel pressure, sequence controls.
            0xA | 0xD | 0xF => {}
            kind => {
                if !self.scanning {
                    warn!("sound {}: invalid command nibble {kind:#X}", self.id);
                    self.stop(ctx);
                }
            }
        }
    }

    fn control_change(&mut self, chan: u8, controller: u8, value: u8, ctx: &mut PlayerContext) {
        // All-notes-off must not allocate a part.
        let id = if controller == 123 {
            self.prune_parts(ctx.pool);
            self.get_active_part(chan, ctx.pool)
        } else {
            self.get_part(chan, ctx)
        };
        let Some(id) = id else { return };

        let vol_eff = self.vol_eff;
        let pan = self.pan;
        let priority = self.priority;
        let part = ctx.pool.part_mut(id);
        match controller {
            0 => {} // bank select, not supported
            1 => part.modulation_wheel(value, ctx.sink),
            7 => part.set_volume(value, vol_eff, ctx.sink),
            10 => part.set_pan(value.wrapping_sub(0x40) as i8, pan, ctx.sink),
            16 => part.pitch_bend_factor(value, ctx.sink),
            17 => {
                // GP slider 2: polyphony on the new scale, detune on the legacy one.
                if ctx.config.new_system {
                    part.set_polyphony(value);
                } else {
                    part.set_detune((value as i16 - 0x40) as i8, self.detune, ctx.sink);
                }
            }
            18 => {
                // GP slider 3: part priority.
                let pri = if ctx.config.new_system {
                    value as i8
                } else {
                    value.wrapping_sub(0x40) as i8
                };
                part.set_pri(pri, priority);
                ctx.pool.reallocate(ctx.sink);
            }
            64 => part.sustain(value != 0, ctx.sink),
            91 => part.effect_level(value, ctx.sink),
            93 => part.chorus_level(value, ctx.sink),
            116 | 117 => {} // XMIDI loop controls, not supported
            123 => part.all_notes_off(ctx.sink),
            _ => {
                if !self.scanning {
                    warn!("sound {}: invalid control change {controller}", self.id);
                    self.stop(ctx);
                }
            }
        }
    }

    /// Route a system-exclusive message by vendor byte.
    pub(crate) fn sysex(&mut self, data: &[u8], ctx: &mut PlayerContext) {
        let Some((&vendor, rest)) = data.split_first() else { return };
        let delay = self.sysex_delay_hint(data);

        match vendor {
            ENGINE_SYSEX_ID => {
                if !self.scanning && log::log_enabled!(log::Level::Debug) {
                    let dump: String = rest.iter().take(19).map(|b| format!(" {b:02X}")).collect();
                    let more = if rest.len() > 19 { " ..." } else { "" };
                    debug!("[{:02}] sysex:{dump}{more}", self.id);
                }
                self.engine_sysex(rest, delay, ctx);
            }
            ROLAND_SYSEX_ID => {
                // Hardware instrument definition, addressed by channel.
                let accepts = (self.native_midi && ctx.config.device != DeviceClass::Amiga)
                    || self.mt32_source;
                if accepts && !rest.is_empty() {
                    if let Some(id) = self.get_part(rest[0] & 0x0F, ctx) {
                        let mut instrument = SysExData::new();
                        let take = data.len().min(instrument.capacity());
                        let _ = instrument.try_extend_from_slice(&data[..take]);
                        let part = ctx.pool.part_mut(id);
                        part.instrument = Some(instrument);
                        if part.clear_to_transmit() {
                            ctx.sink.sysex(data, delay);
                        }
                    }
                }
            }
            0 => warn!(
                "unknown sysex manufacturer 0x00 {:#04X} {:#04X}",
                rest.first().copied().unwrap_or(0),
                rest.get(1).copied().unwrap_or(0)
            ),
            other => warn!("unknown sysex manufacturer {other:#04X}"),
        }
    }

    /// Extra settle time after a hardware sysex, for devices that choke on
    /// back-to-back exclusive traffic. Only the MT-32 class needs it, and
    /// never while scanning.
    fn sysex_delay_hint(&self, data: &[u8]) -> u16 {
        let hardware = data.first() == Some(&ROLAND_SYSEX_ID)
            || (data.first() == Some(&ENGINE_SYSEX_ID) && data.get(1) == Some(&0));
        if self.mt32_source && !self.scanning && hardware {
            if data.len() >= 25 {
                70
            } else {
                20
            }
        } else {
            0
        }
    }

    /// The engine's private control protocol. The first payload byte is
    /// the command; jump and loop payloads are nibble-packed.
    fn engine_sysex(&mut self, payload: &[u8], delay: u16, ctx: &mut PlayerContext) {
        let Some((&cmd, body)) = payload.split_first() else { return };
        match cmd {
            0x00 => {
                // Raw hardware passthrough.
                if ctx.config.device != DeviceClass::Amiga {
                    ctx.sink.sysex(body, delay);
                }
            }
            0x30 => {
                let d = decode_sysex_bytes(body);
                if d.len() >= 7 {
                    self.maybe_jump(
                        d[0],
                        u16::from_be_bytes([d[1], d[2]]) as u32,
                        u16::from_be_bytes([d[3], d[4]]) as u32,
                        u16::from_be_bytes([d[5], d[6]]) as u32,
                        ctx,
                    );
                }
            }
            0x31 => {
                if body.len() >= 3 {
                    self.maybe_set_transpose(body[0], body[1] != 0, body[2] as i8, ctx);
                }
            }
            0x32 => {
                if body.len() >= 3 {
                    self.maybe_part_onoff(body[0], body[1], body[2] != 0, ctx);
                }
            }
            0x33 => {
                if body.len() >= 3 {
                    self.maybe_set_volume(body[0], body[1], body[2], ctx);
                }
            }
            0x34 => {
                if body.len() >= 3 {
                    self.maybe_set_program(body[0], body[1], body[2], ctx);
                }
            }
            0x35 => {
                if body.len() >= 4 {
                    self.maybe_set_transpose_part(body[0], body[1], body[2] != 0, body[3] as i8, ctx);
                }
            }
            0x40 => {
                let d = decode_sysex_bytes(body);
                if d.len() >= 10 {
                    let field = |i: usize| u16::from_be_bytes([d[i], d[i + 1]]);
                    let _ = self.set_loop(field(0), field(2), field(4), field(6), field(8));
                }
            }
            0x41 => self.clear_loop(),
            other => warn!("sound {}: unknown engine sysex command {other:#04X}", self.id),
        }
    }

    fn maybe_jump(&mut self, cmd: u8, track: u32, beat: u32, tick: u32, ctx: &mut PlayerContext) {
        if !self.hooks.gate_jump(cmd) {
            return;
        }
        if let Err(err) = self.jump(track as u16, beat, tick, ctx) {
            debug!("sound {}: hooked jump failed: {err}", self.id);
        }
    }

    fn maybe_set_transpose(&mut self, cmd: u8, relative: bool, value: i8, ctx: &mut PlayerContext) {
        if !gate(&mut self.hooks.transpose, cmd) {
            return;
        }
        let _ = self.set_transpose(relative, value, ctx);
    }

    fn maybe_part_onoff(&mut self, chan: u8, cmd: u8, on: bool, ctx: &mut PlayerContext) {
        if chan >= 16 || !gate(&mut self.hooks.part_onoff[chan as usize], cmd) {
            return;
        }
        if let Some(id) = self.get_part(chan, ctx) {
            ctx.pool.part_mut(id).set_onoff(on, ctx.sink);
            ctx.pool.reallocate(ctx.sink);
        }
    }

    fn maybe_set_volume(&mut self, chan: u8, cmd: u8, volume: u8, ctx: &mut PlayerContext) {
        if chan >= 16 || !gate(&mut self.hooks.part_volume[chan as usize], cmd) {
            return;
        }
        let vol_eff = self.vol_eff;
        if let Some(id) = self.get_part(chan, ctx) {
            ctx.pool.part_mut(id).set_volume(volume, vol_eff, ctx.sink);
        }
    }

    fn maybe_set_program(&mut self, chan: u8, cmd: u8, program: u8, ctx: &mut PlayerContext) {
        if chan >= 16 || !gate(&mut self.hooks.part_program[chan as usize], cmd) {
            return;
        }
        if let Some(id) = self.get_part(chan, ctx) {
            ctx.pool.part_mut(id).program_change(program, ctx.sink);
        }
    }

    fn maybe_set_transpose_part(
        &mut self,
        chan: u8,
        cmd: u8,
        relative: bool,
        value: i8,
        ctx: &mut PlayerContext,
    ) {
        if chan >= 16 || !gate(&mut self.hooks.part_transpose[chan as usize], cmd) {
            return;
        }
        self.part_set_transpose(chan, relative, value, ctx);
    }

    /// Set the player transpose, absolute or relative. Relative values
    /// fold into a narrow window before the per-generation part clamp.
    pub fn set_transpose(
        &mut self,
        relative: bool,
        value: i8,
        ctx: &mut PlayerContext,
    ) -> Result<(), EngineError> {
        if !(-24..=24).contains(&value) {
            return Err(EngineError::OutOfRange);
        }
        self.transpose = if relative {
            transpose_clamp(self.transpose as i32 + value as i32, -7, 7) as i8
        } else {
            value
        };

        let limit = ctx.config.transpose_limit();
        self.prune_parts(ctx.pool);
        for &id in self.parts.iter() {
            let part = ctx.pool.part_mut(id);
            let own = part.transpose;
            part.set_transpose(own, self.transpose, limit, ctx.sink);
        }
        Ok(())
    }

    pub fn part_set_transpose(
        &mut self,
        chan: u8,
        relative: bool,
        value: i8,
        ctx: &mut PlayerContext,
    ) {
        if !(-24..=24).contains(&value) {
            return;
        }
        let Some(id) = self.get_part(chan, ctx) else { return };
        let limit = ctx.config.transpose_limit();
        let part = ctx.pool.part_mut(id);
        let value = if relative {
            transpose_clamp(value as i32 + part.transpose as i32, -7, 7) as i8
        } else {
            value
        };
        part.set_transpose(value, self.transpose, limit, ctx.sink);
    }

    /// Seek to (track, beat, tick). Held sustain pedals are released so no
    /// note survives the jump.
    pub fn jump(
        &mut self,
        track: u16,
        beat: u32,
        tick: u32,
        ctx: &mut PlayerContext,
    ) -> Result<(), EngineError> {
        let Some(parser) = self.parser.as_mut() else {
            return Err(EngineError::NotActive);
        };
        if parser.set_track(track) {
            self.track_index = track;
        }
        if !parser.jump_to_tick(beat_tick_to_ticks(beat, tick)) {
            return Err(EngineError::SeekRejected);
        }
        self.turn_off_pedals(ctx);
        Ok(())
    }

    pub fn set_loop(
        &mut self,
        count: u16,
        to_beat: u16,
        to_tick: u16,
        from_beat: u16,
        from_tick: u16,
    ) -> Result<(), EngineError> {
        self.looper.set(count, to_beat, to_tick, from_beat, from_tick)
    }

    pub fn clear_loop(&mut self) {
        self.looper.clear();
    }

    fn turn_off_pedals(&mut self, ctx: &mut PlayerContext) {
        self.prune_parts(ctx.pool);
        for &id in self.parts.iter() {
            if ctx.pool.part(id).pedal {
                ctx.pool.part_mut(id).sustain(false, ctx.sink);
            }
        }
    }

    /// Silent resynchronization: fast-forward to (track, beat, tick)
    /// without sounding anything, then replay the notes that should still
    /// be down at the destination.
    pub fn scan(
        &mut self,
        track: u16,
        beat: u32,
        tick: u32,
        ctx: &mut PlayerContext,
    ) -> Result<(), EngineError> {
        if !self.active || self.parser.is_none() {
            return Err(EngineError::NotActive);
        }
        let beat = beat.max(1);

        self.turn_off_parts(ctx);
        self.active_notes = [0; 128];
        self.scanning = true;

        let Some(mut parser) = self.parser.take() else {
            self.scanning = false;
            return Err(EngineError::NotActive);
        };
        let mut buf = mem::take(&mut self.event_buf);
        buf.clear();

        // A track switch first drains the current track so accumulated
        // controller state is fully applied before the new track starts.
        if track != self.track_index {
            parser.scan_to_end(&mut buf);
            for event in buf.drain(..) {
                self.handle_event(event, ctx);
            }
            parser.set_track(track);
        }
        let reached = parser.scan_to_tick(beat_tick_to_ticks(beat, tick), &mut buf);
        if reached {
            for event in buf.drain(..) {
                self.handle_event(event, ctx);
            }
        }

        self.parser = Some(parser);
        self.event_buf = buf;
        self.scanning = false;

        if !reached {
            return Err(EngineError::SeekRejected);
        }

        ctx.pool.reallocate(ctx.sink);
        self.play_active_notes(ctx);

        if self.track_index != track {
            self.track_index = track;
            self.looper.clear();
        }
        Ok(())
    }

    /// Release every owned part ahead of a scan; allocation is dynamic, so
    /// parts are rebuilt from the replayed events.
    fn turn_off_parts(&mut self, ctx: &mut PlayerContext) {
        while let Some(id) = self.parts.pop_front() {
            ctx.pool.release(id, ctx.sink);
        }
        ctx.pool.reallocate(ctx.sink);
    }

    /// Sound every note the scan bitmap still has down.
    fn play_active_notes(&mut self, ctx: &mut PlayerContext) {
        for chan in 0..16u8 {
            let mask = 1u16 << chan;
            if !self.active_notes.iter().any(|&bits| bits & mask != 0) {
                continue;
            }
            let Some(id) = self.get_part(chan, ctx) else { continue };
            for key in 0..128usize {
                if self.active_notes[key] & mask != 0 {
                    ctx.pool
                        .part_mut(id)
                        .note_on(key as u8, SCAN_REPLAY_VELOCITY, ctx.sink);
                }
            }
        }
    }

    pub fn set_volume(&mut self, volume: u8, ctx: &mut PlayerContext) -> Result<(), EngineError> {
        if volume > 127 {
            return Err(EngineError::OutOfRange);
        }
        self.volume = volume;
        self.vol_eff = self.scaled_volume(volume, ctx);

        self.prune_parts(ctx.pool);
        for &id in self.parts.iter() {
            let part = ctx.pool.part_mut(id);
            let own = part.vol;
            part.set_volume(own, self.vol_eff, ctx.sink);
        }
        Ok(())
    }

    /// Recompute effective volume after a group volume change.
    pub(crate) fn refresh_volume(&mut self, ctx: &mut PlayerContext) {
        let volume = self.volume;
        let _ = self.set_volume(volume, ctx);
    }

    pub fn set_vol_group(&mut self, group: u16, ctx: &mut PlayerContext) {
        self.vol_group = group;
        self.refresh_volume(ctx);
    }

    pub fn set_pan(&mut self, pan: i8, ctx: &mut PlayerContext) {
        self.pan = pan;
        self.prune_parts(ctx.pool);
        for &id in self.parts.iter() {
            let part = ctx.pool.part_mut(id);
            let own = part.pan;
            part.set_pan(own, self.pan, ctx.sink);
        }
    }

    pub fn set_detune(&mut self, detune: i16, ctx: &mut PlayerContext) {
        self.detune = detune;
        self.prune_parts(ctx.pool);
        for &id in self.parts.iter() {
            let part = ctx.pool.part_mut(id);
            let own = part.detune;
            part.set_detune(own, self.detune, ctx.sink);
        }
    }

    pub fn set_priority(&mut self, priority: u8, ctx: &mut PlayerContext) {
        self.priority = priority;
        self.prune_parts(ctx.pool);
        for &id in self.parts.iter() {
            let part = ctx.pool.part_mut(id);
            let own = part.pri;
            part.set_pri(own, priority);
        }
        ctx.pool.reallocate(ctx.sink);
    }

    pub fn set_note_offset(&mut self, offset: i16) {
        self.note_offset = offset;
    }

    /// Playback speed on the configured scale. The new scale rejects
    /// values above 127; the legacy one accepts anything.
    pub fn set_speed(&mut self, speed: u8, ctx: &mut PlayerContext) {
        if ctx.config.new_system && speed > 127 {
            return;
        }
        self.speed = speed;
        if let Some(parser) = self.parser.as_mut() {
            let rate = ((ctx.sink.base_tempo() * speed as u32) >> ctx.config.speed_shift())
                * ctx.config.tempo_factor
                / 100;
            parser.set_timer_rate(rate);
        }
    }

    /// One periodic advance: fades first (which may deactivate the
    /// player), then the loop check, then event delivery.
    pub fn on_timer(&mut self, ctx: &mut PlayerContext) {
        self.transition_parameters(ctx);
        if !self.active || self.parser.is_none() {
            return;
        }

        let Some(tick) = self.parser.as_ref().map(|p| p.tick()) else { return };
        if self.looper.crossed_from(beat_of_tick(tick), tick_in_beat(tick)) {
            let (to_beat, to_tick) = self.looper.take_jump();
            let track = self.track_index;
            let _ = self.jump(track, to_beat as u32, to_tick as u32, ctx);
        }

        let Some(mut parser) = self.parser.take() else { return };
        let mut buf = mem::take(&mut self.event_buf);
        buf.clear();
        parser.on_timer(&mut buf);
        self.music_tick = parser.tick();
        self.parser = Some(parser);

        for event in buf.drain(..) {
            if self.active {
                self.handle_event(event, ctx);
            }
        }
        self.event_buf = buf;
    }

    fn handle_event(&mut self, event: SequenceEvent, ctx: &mut PlayerContext) {
        match event {
            SequenceEvent::Channel(msg) => self.dispatch(msg, ctx),
            SequenceEvent::SysEx(data) => self.sysex(&data, ctx),
            SequenceEvent::EndOfTrack => self.stop(ctx),
        }
    }

    /// Begin a fade of one player parameter to `target` over `time` fade
    /// quanta. Zero time applies the target immediately. Unknown
    /// parameter ids are accepted and ignored so scripts written against
    /// other engine revisions keep working.
    pub fn add_parameter_fader(
        &mut self,
        param: i16,
        target: i16,
        time: u16,
        ctx: &mut PlayerContext,
    ) -> Result<(), EngineError> {
        let start = match param {
            fade_param::VOLUME => {
                if time == 0 {
                    return self.set_volume(target.clamp(0, 127) as u8, ctx);
                }
                self.volume as i16
            }
            fade_param::TRANSPOSE => {
                if time == 0 {
                    self.set_detune(target, ctx);
                    return Ok(());
                }
                self.detune
            }
            fade_param::SPEED => {
                if time == 0 {
                    self.set_speed(target.clamp(0, 255) as u8, ctx);
                    return Ok(());
                }
                self.speed as i16
            }
            fade_param::CLEAR_ALL => {
                for fader in &mut self.faders {
                    fader.clear();
                }
                return Ok(());
            }
            _ => {
                debug!("sound {}: unknown fade parameter {param}", self.id);
                return Ok(());
            }
        };

        // One slot per parameter: an active fade of the same parameter is
        // replaced, otherwise the first free slot is taken.
        let slot = self
            .faders
            .iter()
            .position(|f| f.param == param)
            .or_else(|| self.faders.iter().position(|f| f.is_free()));
        match slot {
            Some(i) => {
                self.faders[i].start(param, start, target, time);
                Ok(())
            }
            None => {
                warn!("sound {}: out of fader slots", self.id);
                Err(EngineError::NoFreeFader)
            }
        }
    }

    /// Advance fades by however many quanta of real time have elapsed.
    fn transition_parameters(&mut self, ctx: &mut PlayerContext) {
        self.transition_timer += ctx.sink.base_tempo();
        while self.transition_timer >= FADE_QUANTUM_US {
            self.transition_timer -= FADE_QUANTUM_US;

            for i in 0..FADER_SLOTS {
                if self.faders[i].is_free() {
                    continue;
                }
                let param = self.faders[i].param;
                let Some(state) = self.faders[i].step() else { continue };

                match param {
                    fade_param::VOLUME => {
                        if (0..=127).contains(&state) {
                            let _ = self.set_volume(state as u8, ctx);
                            if state == 0 {
                                self.stop(ctx);
                                return;
                            }
                        }
                    }
                    fade_param::TRANSPOSE => {
                        if (-9216..=9216).contains(&state) {
                            self.set_detune(state, ctx);
                        }
                    }
                    fade_param::SPEED => {
                        if (0..=127).contains(&state) {
                            self.set_speed(state as u8, ctx);
                        }
                    }
                    _ => self.faders[i].clear(),
                }
            }
        }
    }

    /// Will an active volume fade land on exactly zero?
    pub fn is_fading_out(&self) -> bool {
        self.faders.iter().any(|f| {
            f.param == fade_param::VOLUME
                && self.volume as i32
                    + f.cntdwn as i32 * f.incr as i32
                    + ((f.irem as i32 + f.cntdwn as i32 * f.ifrac as i32) / f.ttime.max(1) as i32)
                        * f.dir as i32
                    == 0
        })
    }

    /// Coarse progress counter used by external cue logic: half-beats
    /// elapsed since the start of the track.
    pub fn music_timer(&self) -> u32 {
        self.parser
            .as_ref()
            .map(|p| p.tick() * 2 / p.ppqn().max(1))
            .unwrap_or(0)
    }

    /// One-based beat index of the current position.
    pub fn beat_index(&self) -> u32 {
        self.parser.as_ref().map(|p| beat_of_tick(p.tick())).unwrap_or(0)
    }

    pub(crate) fn current_tick(&self) -> u32 {
        self.parser.as_ref().map(|p| p.tick()).unwrap_or(0)
    }

    /// Numeric query interface. Codes 0..=13 read player state, 14..=17
    /// per-channel part state (129 when the channel has no part), 18..=23
    /// hook arming. Unknown codes return -1.
    pub fn get_param(&self, param: i32, chan: u8, pool: &PartPool) -> i32 {
        match param {
            0 => self.priority as i32,
            1 => self.volume as i32,
            2 => self.pan as i32,
            3 => self.transpose as i32,
            4 => self.detune as i32,
            5 => self.speed as i32,
            6 => self.track_index as i32,
            7 => self.beat_index() as i32,
            8 => self
                .parser
                .as_ref()
                .map(|p| (p.tick() % TICKS_PER_BEAT) as i32)
                .unwrap_or(0),
            9 => self.looper.counter as i32,
            10 => self.looper.to_beat as i32,
            11 => self.looper.to_tick as i32,
            12 => self.looper.from_beat as i32,
            13 => self.looper.from_tick as i32,
            14..=17 => self.query_part_param(param, chan, pool),
            18..=23 => self.hooks.query_param(param, chan),
            _ => -1,
        }
    }

    fn query_part_param(&self, param: i32, chan: u8, pool: &PartPool) -> i32 {
        let Some(id) = self.get_active_part(chan, pool) else {
            return 129;
        };
        let part = pool.part(id);
        match param {
            14 => part.on as i32,
            15 => part.vol as i32,
            // The instrument representation is not exposed numerically.
            16 => -1,
            17 => part.transpose as i32,
            _ => -1,
        }
    }

    /// Rebuild runtime state after deserialization: reconstruct the
    /// parser, reselect the track without resetting variables, re-apply
    /// the speed and reposition at the saved tick.
    pub(crate) fn fix_after_load(
        &mut self,
        data: &[u8],
        ctx: &mut PlayerContext,
    ) -> Result<(), EngineError> {
        self.parser = None;
        self.parser_kind = None;
        self.start_track(data, None, false, ctx)?;

        let speed = self.speed;
        self.set_speed(speed, ctx);
        if let Some(parser) = self.parser.as_mut() {
            parser.jump_to_tick(self.music_tick);
        }
        self.mt32_source = ctx.config.device == DeviceClass::Mt32;
        self.native_midi = detect_kind(data) != ParserKind::Ro;
        self.supports_percussion = ctx.config.device != DeviceClass::Amiga;
        Ok(())
    }
}

/// Unpack a nibble-per-byte payload: each output byte combines the low
/// nibbles of two input bytes.
fn decode_sysex_bytes(src: &[u8]) -> SysExData {
    let mut out = SysExData::new();
    for pair in src.chunks_exact(2) {
        let _ = out.try_push((pair[0] << 4) | (pair[1] & 0x0F));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::VOL_GROUP_MASTER;
    use crate::testutil::stub_factory;
    use cueseq_ir::{MidiSink, NullSink};

    /// A sink whose timer period is exactly one fade quantum.
    struct QuantumSink;
    impl MidiSink for QuantumSink {
        fn send(&mut self, _msg: ChannelMessage) {}
        fn sysex(&mut self, _data: &[u8], _delay_hint_ms: u16) {}
        fn base_tempo(&self) -> u32 {
            FADE_QUANTUM_US
        }
    }

    struct Fixture {
        pool: PartPool,
        sink: NullSink,
        config: EngineConfig,
        groups: [u8; NUM_VOL_GROUPS],
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                pool: PartPool::new(),
                sink: NullSink,
                config: EngineConfig::default(),
                groups: [127; NUM_VOL_GROUPS],
            }
        }
    }

    macro_rules! ctx {
        ($fx:expr) => {
            PlayerContext {
                pool: &mut $fx.pool,
                sink: &mut $fx.sink,
                config: &$fx.config,
                group_volumes: &$fx.groups,
                factory: &stub_factory,
            }
        };
    }

    fn started_player(fx: &mut Fixture) -> Player {
        let mut player = Player::new(0, 128);
        player.start(7, b"MThd", None, &mut ctx!(fx)).unwrap();
        player
    }

    #[test]
    fn start_applies_defaults_without_header() {
        let mut fx = Fixture::new();
        let player = started_player(&mut fx);
        assert!(player.is_active());
        assert_eq!(player.volume, 0x7F);
        assert_eq!(player.vol_eff, 127);
        assert_eq!(player.priority, 0x80);
        assert_eq!(player.speed, 128);
        assert_eq!(player.vol_group, VOL_GROUP_MASTER);
    }

    #[test]
    fn start_applies_header_parameters() {
        let mut fx = Fixture::new();
        let mut chunk = b"MDhd".to_vec();
        chunk.extend_from_slice(&8u32.to_be_bytes());
        chunk.extend_from_slice(&[0, 0, 0x60, 100, 5, 0xFE, 3, 90]);

        let mut player = Player::new(0, 128);
        player.start(3, b"MThd", Some(&chunk), &mut ctx!(fx)).unwrap();
        assert_eq!(player.priority, 0x60);
        assert_eq!(player.volume, 100);
        assert_eq!(player.pan, 5);
        assert_eq!(player.transpose, -2);
        assert_eq!(player.detune, 3);
        assert_eq!(player.speed, 90);
    }

    #[test]
    fn time_zero_fade_applies_immediately() {
        let mut fx = Fixture::new();
        let mut player = started_player(&mut fx);
        player
            .add_parameter_fader(fade_param::VOLUME, 40, 0, &mut ctx!(fx))
            .unwrap();
        assert_eq!(player.volume, 40);
        assert!(player.faders.iter().all(|f| f.is_free()));
    }

    #[test]
    fn volume_fade_to_zero_deactivates_exactly_at_end() {
        let mut fx = Fixture::new();
        let mut sink = QuantumSink;
        let mut player = started_player(&mut fx);
        let _ = player.set_volume(100, &mut ctx!(fx));

        player
            .add_parameter_fader(fade_param::VOLUME, 0, 50, &mut ctx!(fx))
            .unwrap();
        assert!(player.is_fading_out());

        for step in 1..=50 {
            let mut ctx = PlayerContext {
                pool: &mut fx.pool,
                sink: &mut sink,
                config: &fx.config,
                group_volumes: &fx.groups,
                factory: &stub_factory,
            };
            player.on_timer(&mut ctx);
            if step < 50 {
                assert!(player.is_active(), "deactivated early at step {step}");
            }
        }
        assert!(!player.is_active());
    }

    #[test]
    fn relative_transpose_folds_into_window() {
        let mut fx = Fixture::new();
        let mut player = started_player(&mut fx);
        player.set_transpose(false, 5, &mut ctx!(fx)).unwrap();
        player.set_transpose(true, 5, &mut ctx!(fx)).unwrap();
        // 5 + 5 = 10 folds down an octave into [-7, 7].
        assert_eq!(player.transpose, -2);
        assert_eq!(
            player.set_transpose(false, 25, &mut ctx!(fx)),
            Err(EngineError::OutOfRange)
        );
    }

    #[test]
    fn get_part_is_idempotent_per_channel() {
        let mut fx = Fixture::new();
        let mut player = started_player(&mut fx);
        let a = player.get_part(3, &mut ctx!(fx)).unwrap();
        let b = player.get_part(3, &mut ctx!(fx)).unwrap();
        assert_eq!(a, b);
        let c = player.get_part(4, &mut ctx!(fx)).unwrap();
        assert_ne!(a, c);
        assert_eq!(player.parts.len(), 2);
    }

    #[test]
    fn query_codes_cover_player_and_part_state() {
        let mut fx = Fixture::new();
        let mut player = started_player(&mut fx);
        let _ = player.set_volume(90, &mut ctx!(fx));
        player.set_loop(2, 3, 10, 8, 0).unwrap();
        player.get_part(5, &mut ctx!(fx)).unwrap();

        assert_eq!(player.get_param(1, 0, &fx.pool), 90);
        assert_eq!(player.get_param(9, 0, &fx.pool), 2);
        assert_eq!(player.get_param(10, 0, &fx.pool), 3);
        assert_eq!(player.get_param(12, 0, &fx.pool), 8);
        assert_eq!(player.get_param(14, 5, &fx.pool), 1);
        assert_eq!(player.get_param(14, 6, &fx.pool), 129);
        assert_eq!(player.get_param(16, 5, &fx.pool), -1);
        assert_eq!(player.get_param(99, 0, &fx.pool), -1);
    }

    #[test]
    fn invalid_controller_stops_player_outside_scanning() {
        let mut fx = Fixture::new();
        let mut player = started_player(&mut fx);
        player.dispatch(ChannelMessage::control_change(0, 55, 1), &mut ctx!(fx));
        assert!(!player.is_active());
    }

    #[test]
    fn stop_releases_every_part() {
        let mut fx = Fixture::new();
        let mut player = started_player(&mut fx);
        player.get_part(0, &mut ctx!(fx)).unwrap();
        player.get_part(1, &mut ctx!(fx)).unwrap();
        assert_eq!(fx.pool.allocated_count(), 2);
        player.stop(&mut ctx!(fx));
        assert_eq!(fx.pool.allocated_count(), 0);
        assert!(player.parts.is_empty());
    }
}
