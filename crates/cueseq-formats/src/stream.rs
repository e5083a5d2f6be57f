//! Shared playback machinery for decoded event lists.
//!
//! A parser front-end turns its resource into per-track lists of
//! absolute-tick events; this module owns the clock. Real time advances
//! by the engine-supplied timer rate; an event is due when its tick,
//! converted through the tempo in force, falls behind the clock.
//! Backward seeks restart from the top of the track so controller state
//! can be reconstructed by the caller.

use cueseq_ir::SequenceEvent;

/// Microseconds per beat before any tempo event.
pub(crate) const DEFAULT_TEMPO: u32 = 500_000;

#[derive(Clone, Debug)]
pub(crate) enum StreamEvent {
    /// Delivered to the engine.
    Emit(SequenceEvent),
    /// Tempo change in microseconds per beat, consumed internally.
    Tempo(u32),
}

#[derive(Clone, Debug)]
pub(crate) struct TimedEvent {
    pub tick: u32,
    pub event: StreamEvent,
}

/// Decoded tracks plus the playback clock over them.
pub(crate) struct EventStream {
    tracks: Vec<Vec<TimedEvent>>,
    ppqn: u32,
    track: usize,
    /// Index of the next undelivered event on the current track.
    pos: usize,
    tempo: u32,
    /// Microseconds of musical time one `on_timer` call represents.
    timer_rate: u32,
    clock_us: u64,
    /// Real time and tick at the last tempo change (or seek).
    base_us: u64,
    base_tick: u32,
}

impl EventStream {
    /// Every track must end with an `EndOfTrack` timed event.
    pub fn new(tracks: Vec<Vec<TimedEvent>>, ppqn: u32) -> Self {
        Self {
            tracks,
            ppqn: ppqn.max(1),
            track: 0,
            pos: 0,
            tempo: DEFAULT_TEMPO,
            timer_rate: 10000,
            clock_us: 0,
            base_us: 0,
            base_tick: 0,
        }
    }

    fn rewind(&mut self) {
        self.pos = 0;
        self.tempo = DEFAULT_TEMPO;
        self.clock_us = 0;
        self.base_us = 0;
        self.base_tick = 0;
    }

    pub fn num_tracks(&self) -> u16 {
        self.tracks.len() as u16
    }

    /// Selecting a different track rewinds to its start; re-selecting the
    /// current one keeps the position.
    pub fn set_track(&mut self, track: u16) -> bool {
        if track as usize >= self.tracks.len() {
            return false;
        }
        if track as usize != self.track {
            self.track = track as usize;
            self.rewind();
        }
        true
    }

    fn end_tick(&self) -> u32 {
        self.tracks[self.track].last().map(|e| e.tick).unwrap_or(0)
    }

    pub fn ppqn(&self) -> u32 {
        self.ppqn
    }

    pub fn tick(&self) -> u32 {
        let elapsed = (self.clock_us - self.base_us) * self.ppqn as u64 / self.tempo as u64;
        (self.base_tick as u64 + elapsed).min(self.end_tick() as u64) as u32
    }

    pub fn set_timer_rate(&mut self, rate_us: u32) {
        self.timer_rate = rate_us;
    }

    pub fn jump_to_tick(&mut self, target: u32) -> bool {
        self.seek(target, None)
    }

    pub fn scan_to_tick(&mut self, target: u32, out: &mut Vec<SequenceEvent>) -> bool {
        self.seek(target, Some(out))
    }

    /// Reposition at `target`, optionally collecting the skipped events.
    /// Events exactly at `target` stay pending for the next timer call.
    fn seek(&mut self, target: u32, mut out: Option<&mut Vec<SequenceEvent>>) -> bool {
        if target > self.end_tick() {
            return false;
        }
        if target < self.tick() {
            self.rewind();
        }

        while self.pos < self.tracks[self.track].len() {
            let ev = &self.tracks[self.track][self.pos];
            if ev.tick >= target {
                break;
            }
            match &ev.event {
                StreamEvent::Tempo(tempo) => {
                    self.base_us +=
                        (ev.tick - self.base_tick) as u64 * self.tempo as u64 / self.ppqn as u64;
                    self.base_tick = ev.tick;
                    self.tempo = *tempo;
                }
                StreamEvent::Emit(SequenceEvent::EndOfTrack) => {}
                StreamEvent::Emit(event) => {
                    if let Some(out) = out.as_deref_mut() {
                        out.push(event.clone());
                    }
                }
            }
            self.pos += 1;
        }

        self.base_us += (target - self.base_tick) as u64 * self.tempo as u64 / self.ppqn as u64;
        self.base_tick = target;
        self.clock_us = self.base_us;
        true
    }

    /// Deliver everything left on the track (end-of-track excluded) and
    /// park the clock at the final tick.
    pub fn scan_to_end(&mut self, out: &mut Vec<SequenceEvent>) {
        let end = self.end_tick();
        let _ = self.seek(end, Some(out));
        while self.pos < self.tracks[self.track].len() {
            let ev = &self.tracks[self.track][self.pos];
            match &ev.event {
                StreamEvent::Tempo(_) | StreamEvent::Emit(SequenceEvent::EndOfTrack) => {}
                StreamEvent::Emit(event) => out.push(event.clone()),
            }
            self.pos += 1;
        }
    }

    /// Advance the clock one timer period and deliver everything now due.
    pub fn on_timer(&mut self, out: &mut Vec<SequenceEvent>) {
        self.clock_us += self.timer_rate as u64;
        while self.pos < self.tracks[self.track].len() {
            let ev = &self.tracks[self.track][self.pos];
            let due =
                self.base_us + (ev.tick - self.base_tick) as u64 * self.tempo as u64 / self.ppqn as u64;
            if due > self.clock_us {
                break;
            }
            self.pos += 1;
            match &self.tracks[self.track][self.pos - 1].event {
                StreamEvent::Tempo(tempo) => {
                    self.base_us = due;
                    self.base_tick = self.tracks[self.track][self.pos - 1].tick;
                    self.tempo = *tempo;
                }
                StreamEvent::Emit(event) => out.push(event.clone()),
            }
        }
    }
}

/// Implement `SequenceParser` for a front-end holding `stream:
/// Option<EventStream>`, loaded by the named decode function.
macro_rules! impl_stream_parser {
    ($parser:ident, $decode:path) => {
        impl cueseq_ir::SequenceParser for $parser {
            fn load(&mut self, data: &[u8]) -> bool {
                match $decode(data) {
                    Ok(stream) => {
                        self.stream = Some(stream);
                        true
                    }
                    Err(err) => {
                        log::warn!("{}: {err}", stringify!($parser));
                        self.stream = None;
                        false
                    }
                }
            }

            fn unload(&mut self) {
                self.stream = None;
            }

            fn set_track(&mut self, track: u16) -> bool {
                self.stream.as_mut().map(|s| s.set_track(track)).unwrap_or(false)
            }

            fn num_tracks(&self) -> u16 {
                self.stream.as_ref().map(|s| s.num_tracks()).unwrap_or(0)
            }

            fn jump_to_tick(&mut self, tick: u32) -> bool {
                self.stream.as_mut().map(|s| s.jump_to_tick(tick)).unwrap_or(false)
            }

            fn scan_to_tick(
                &mut self,
                tick: u32,
                out: &mut Vec<cueseq_ir::SequenceEvent>,
            ) -> bool {
                self.stream
                    .as_mut()
                    .map(|s| s.scan_to_tick(tick, out))
                    .unwrap_or(false)
            }

            fn scan_to_end(&mut self, out: &mut Vec<cueseq_ir::SequenceEvent>) {
                if let Some(stream) = self.stream.as_mut() {
                    stream.scan_to_end(out);
                }
            }

            fn tick(&self) -> u32 {
                self.stream.as_ref().map(|s| s.tick()).unwrap_or(0)
            }

            fn ppqn(&self) -> u32 {
                self.stream.as_ref().map(|s| s.ppqn()).unwrap_or(480)
            }

            fn set_timer_rate(&mut self, rate_us: u32) {
                if let Some(stream) = self.stream.as_mut() {
                    stream.set_timer_rate(rate_us);
                }
            }

            fn on_timer(&mut self, out: &mut Vec<cueseq_ir::SequenceEvent>) {
                if let Some(stream) = self.stream.as_mut() {
                    stream.on_timer(out);
                }
            }
        }
    };
}
pub(crate) use impl_stream_parser;
