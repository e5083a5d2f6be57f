//! Sequence resource parsers for the cueseq engine.
//!
//! Three interchangeable parser kinds behind the `SequenceParser` trait:
//! standard MIDI files, "FORM"-tagged extended MIDI resources, and the
//! legacy "RO" single-track stream. Each parser decodes the whole
//! resource up front into an absolute-tick event list; playback, seeking
//! and scanning then run on the shared [`stream::EventStream`].

mod ro;
mod smf;
mod stream;
mod xmidi;

pub use ro::RoParser;
pub use smf::SmfParser;
pub use xmidi::XmidiParser;

use cueseq_ir::{ParserKind, SequenceParser};
use thiserror::Error;

/// Errors reported while decoding a sequence resource.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("invalid or missing header")]
    InvalidHeader,
    #[error("unexpected end of data")]
    UnexpectedEof,
    #[error("unsupported timing division")]
    UnsupportedTiming,
}

/// Build a parser of the requested kind. Pass this to the engine as its
/// parser factory.
pub fn create_parser(kind: ParserKind) -> Box<dyn SequenceParser> {
    match kind {
        ParserKind::Ro => Box::new(RoParser::default()),
        ParserKind::Xmidi => Box::new(XmidiParser::default()),
        ParserKind::Smf => Box::new(SmfParser::default()),
    }
}
