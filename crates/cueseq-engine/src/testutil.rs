//! Shared fixtures for the crate's unit tests.

use std::collections::HashMap;

use cueseq_ir::{
    EngineConfig, NullSink, ParserKind, ResourceProvider, SequenceEvent, SequenceParser,
    TICKS_PER_BEAT,
};

use crate::engine::Engine;

/// A parser that loads anything and never delivers events. Seeks are
/// recorded so tests can assert on the resulting position.
#[derive(Default)]
pub(crate) struct StubParser {
    pub tick: u32,
    pub rate: u32,
}

impl SequenceParser for StubParser {
    fn load(&mut self, data: &[u8]) -> bool {
        !data.is_empty()
    }
    fn unload(&mut self) {}
    fn set_track(&mut self, _track: u16) -> bool {
        true
    }
    fn num_tracks(&self) -> u16 {
        1
    }
    fn jump_to_tick(&mut self, tick: u32) -> bool {
        self.tick = tick;
        true
    }
    fn scan_to_tick(&mut self, tick: u32, _out: &mut Vec<SequenceEvent>) -> bool {
        self.tick = tick;
        true
    }
    fn scan_to_end(&mut self, _out: &mut Vec<SequenceEvent>) {}
    fn tick(&self) -> u32 {
        self.tick
    }
    fn ppqn(&self) -> u32 {
        TICKS_PER_BEAT
    }
    fn set_timer_rate(&mut self, rate_us: u32) {
        self.rate = rate_us;
    }
    fn on_timer(&mut self, _out: &mut Vec<SequenceEvent>) {}
}

pub(crate) fn stub_factory(_kind: ParserKind) -> Box<dyn SequenceParser> {
    Box::new(StubParser::default())
}

pub(crate) struct MapProvider(pub HashMap<u32, Vec<u8>>);

impl ResourceProvider for MapProvider {
    fn sound_data(&self, id: u32) -> Option<&[u8]> {
        self.0.get(&id).map(|v| v.as_slice())
    }
}

/// An engine over stub parsers with one dummy resource per id.
pub(crate) fn engine_with_sounds(ids: &[u32]) -> Engine {
    let sounds = ids.iter().map(|&id| (id, b"MThd".to_vec())).collect();
    Engine::new(
        EngineConfig::default(),
        Box::new(NullSink),
        Box::new(stub_factory),
        Box::new(MapProvider(sounds)),
    )
}
