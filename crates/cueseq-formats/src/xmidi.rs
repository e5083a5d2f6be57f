//! Extended MIDI ("FORM"/"CAT ") sequence resources.
//!
//! An IFF container where every EVNT chunk is one track. Deltas are sums
//! of interval bytes rather than variable-length quantities, there is no
//! running status, and note-on events carry their duration inline; the
//! matching note-off is synthesized while decoding.

use crate::smf::read_varint;
use crate::stream::{impl_stream_parser, EventStream, StreamEvent, TimedEvent};
use crate::FormatError;
use cueseq_ir::{ChannelMessage, SequenceEvent};

const XMIDI_PPQN: u32 = 60;

/// Parser for "FORM"-tagged extended MIDI resources.
#[derive(Default)]
pub struct XmidiParser {
    stream: Option<EventStream>,
}

impl_stream_parser!(XmidiParser, parse_xmidi);

fn parse_xmidi(data: &[u8]) -> Result<EventStream, FormatError> {
    if data.len() < 8 || &data[0..4] != b"FORM" {
        return Err(FormatError::InvalidHeader);
    }
    let mut tracks = Vec::new();
    collect_events(data, &mut tracks)?;
    if tracks.is_empty() {
        return Err(FormatError::UnexpectedEof);
    }
    Ok(EventStream::new(tracks, XMIDI_PPQN))
}

/// Walk the IFF chunk tree, decoding every EVNT chunk found.
fn collect_events(data: &[u8], tracks: &mut Vec<Vec<TimedEvent>>) -> Result<(), FormatError> {
    let mut pos = 0usize;
    while pos + 8 <= data.len() {
        let tag = &data[pos..pos + 4];
        let len = u32::from_be_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]])
            as usize;
        pos += 8;
        if pos + len > data.len() {
            return Err(FormatError::UnexpectedEof);
        }
        let body = &data[pos..pos + len];
        match tag {
            // Containers carry a 4-byte type id before their children.
            b"FORM" | b"CAT " => {
                if len < 4 {
                    return Err(FormatError::UnexpectedEof);
                }
                collect_events(&body[4..], tracks)?;
            }
            b"EVNT" => tracks.push(parse_track(body)?),
            _ => {}
        }
        // Chunks are padded to even length.
        pos += len + (len & 1);
    }
    Ok(())
}

fn parse_track(data: &[u8]) -> Result<Vec<TimedEvent>, FormatError> {
    let mut events = Vec::new();
    let mut pos = 0usize;
    let mut tick = 0u32;
    let mut end_tick = None;

    while pos < data.len() && end_tick.is_none() {
        let byte = data[pos];
        if byte & 0x80 == 0 {
            // Interval byte: accumulate and continue.
            tick += byte as u32;
            pos += 1;
            continue;
        }
        let status = byte;
        pos += 1;

        match status {
            0xFF => {
                let meta = *data.get(pos).ok_or(FormatError::UnexpectedEof)?;
                pos += 1;
                let len = read_varint(data, &mut pos)? as usize;
                let body = data.get(pos..pos + len).ok_or(FormatError::UnexpectedEof)?;
                pos += len;
                match meta {
                    0x2F => end_tick = Some(tick),
                    0x51 if len >= 3 => {
                        let tempo = u32::from_be_bytes([0, body[0], body[1], body[2]]);
                        events.push(TimedEvent { tick, event: StreamEvent::Tempo(tempo) });
                    }
                    _ => {}
                }
            }
            0xF0 => {
                let len = read_varint(data, &mut pos)? as usize;
                let payload = data.get(pos..pos + len).ok_or(FormatError::UnexpectedEof)?;
                pos += len;
                let payload = payload.strip_suffix(&[0xF7]).unwrap_or(payload);
                events.push(TimedEvent {
                    tick,
                    event: StreamEvent::Emit(SequenceEvent::sysex(payload)),
                });
            }
            status if status & 0xF0 == 0x90 => {
                let key = *data.get(pos).ok_or(FormatError::UnexpectedEof)?;
                let velocity = *data.get(pos + 1).ok_or(FormatError::UnexpectedEof)?;
                pos += 2;
                let duration = read_varint(data, &mut pos)?;
                events.push(TimedEvent {
                    tick,
                    event: StreamEvent::Emit(SequenceEvent::Channel(ChannelMessage::new(
                        status, key, velocity,
                    ))),
                });
                events.push(TimedEvent {
                    tick: tick + duration,
                    event: StreamEvent::Emit(SequenceEvent::Channel(ChannelMessage::new(
                        0x80 | (status & 0x0F),
                        key,
                        64,
                    ))),
                });
            }
            status if status < 0xF0 => {
                let data1 = *data.get(pos).ok_or(FormatError::UnexpectedEof)?;
                pos += 1;
                let data2 = if matches!(status & 0xF0, 0xC0 | 0xD0) {
                    0
                } else {
                    let b = *data.get(pos).ok_or(FormatError::UnexpectedEof)?;
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

    // Synthesized note-offs land out of order; restore tick order while
    // keeping same-tick events in decode order.
    events.sort_by_key(|e| e.tick);
    let last = events.last().map_or(0, |e| e.tick);
    let end = end_tick.unwrap_or(last).max(last);
    events.push(TimedEvent { tick: end, event: StreamEvent::Emit(SequenceEvent::EndOfTrack) });
    Ok(events)
}
