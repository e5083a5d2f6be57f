//! Legacy "RO" sequence resources.
//!
//! A bare single-track stream: the two-byte tag, then the same
//! delta-prefixed event encoding as a standard MIDI track. There is no
//! header chunk and no timing field, the division is fixed.

use crate::smf::read_varint;
use crate::stream::{impl_stream_parser, EventStream, StreamEvent, TimedEvent};
use crate::FormatError;
use cueseq_ir::{ChannelMessage, SequenceEvent};

const RO_PPQN: u32 = 480;

/// Parser for "RO"-tagged legacy sequence resources.
#[derive(Default)]
pub struct RoParser {
    stream: Option<EventStream>,
}

impl_stream_parser!(RoParser, parse_ro);

fn parse_ro(data: &[u8]) -> Result<EventStream, FormatError> {
    if data.len() < 2 || &data[0..2] != b"RO" {
        return Err(FormatError::InvalidHeader);
    }

    let body = &data[2..];
    let mut events = Vec::new();
    let mut pos = 0usize;
    let mut tick = 0u32;
    let mut running_status = 0u8;
    let mut end_tick = None;

    while pos < body.len() && end_tick.is_none() {
        tick += read_varint(body, &mut pos)?;

        let mut status = *body.get(pos).ok_or(FormatError::UnexpectedEof)?;
        if status & 0x80 != 0 {
            pos += 1;
        } else {
            if running_status & 0x80 == 0 {
                return Err(FormatError::InvalidHeader);
            }
            status = running_status;
        }

        match status {
            0xFF => {
                let meta = *body.get(pos).ok_or(FormatError::UnexpectedEof)?;
                pos += 1;
                if meta == 0x2F {
                    end_tick = Some(tick);
                } else {
                    let len = read_varint(body, &mut pos)? as usize;
                    if pos + len > body.len() {
                        return Err(FormatError::UnexpectedEof);
                    }
                    pos += len;
                }
            }
            0xF0 => {
                let len = read_varint(body, &mut pos)? as usize;
                let payload = body.get(pos..pos + len).ok_or(FormatError::UnexpectedEof)?;
                pos += len;
                let payload = payload.strip_suffix(&[0xF7]).unwrap_or(payload);
                events.push(TimedEvent {
                    tick,
                    event: StreamEvent::Emit(SequenceEvent::sysex(payload)),
                });
            }
            status if status & 0x80 != 0 && status < 0xF0 => {
                running_status = status;
                let data1 = *body.get(pos).ok_or(FormatError::UnexpectedEof)?;
                pos += 1;
                let data2 = if matches!(status & 0xF0, 0xC0 | 0xD0) {
                    0
                } else {
                    let b = *body.get(pos).ok_or(FormatError::UnexpectedEof)?;
                    pos += 1;
                    b
                };
                events.push(TimedEvent {
                    tick,
                    event: StreamEvent::Emit(SequenceEvent::Channel(ChannelMessage::new(
                        status, data1, data2,
                    ))),
                });
            }
            _ => return Err(FormatError::InvalidHeader),
        }
    }

    let end = end_tick.unwrap_or(tick);
    events.push(TimedEvent { tick: end, event: StreamEvent::Emit(SequenceEvent::EndOfTrack) });
    Ok(EventStream::new(vec![events], RO_PPQN))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cueseq_ir::SequenceParser;

    fn ro(body: &[u8]) -> Vec<u8> {
        let mut data = b"RO".to_vec();
        data.extend_from_slice(body);
        data
    }

    #[test]
    fn single_track_stream() {
        let data = ro(&[
            0x00, 0x90, 60, 100, // note on
            0x40, 0x80, 60, 64, // note off
            0x00, 0xFF, 0x2F, // end marker, no length byte follows
        ]);
        let mut parser = RoParser::default();
        assert!(parser.load(&data));
        assert_eq!(parser.num_tracks(), 1);
        assert_eq!(parser.ppqn(), 480);

        let mut out = Vec::new();
        parser.scan_to_end(&mut out);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn missing_end_marker_falls_back_to_last_tick() {
        let data = ro(&[0x10, 0x90, 60, 100]);
        let mut parser = RoParser::default();
        assert!(parser.load(&data));
        assert!(parser.jump_to_tick(0x10));
        assert!(!parser.jump_to_tick(0x11));
    }

    #[test]
    fn wrong_tag_is_rejected() {
        let mut parser = RoParser::default();
        assert!(!parser.load(b"MThd"));
        assert!(!parser.load(b"R"));
    }
}
