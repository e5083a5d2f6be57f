//! Standard MIDI file parser.

use cueseq_ir::{ChannelMessage, SequenceEvent};

use crate::stream::{impl_stream_parser, EventStream, StreamEvent, TimedEvent};
use crate::FormatError;

/// Parser for "MThd"-tagged standard MIDI files.
#[derive(Default)]
pub struct SmfParser {
    stream: Option<EventStream>,
}

impl_stream_parser!(SmfParser, parse_smf);

fn parse_smf(data: &[u8]) -> Result<EventStream, FormatError> {
    if data.len() < 14 || &data[0..4] != b"MThd" {
        return Err(FormatError::InvalidHeader);
    }
    let header_len = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
    if header_len < 6 || 8 + header_len > data.len() {
        return Err(FormatError::UnexpectedEof);
    }
    let division = u16::from_be_bytes([data[12], data[13]]);
    if division & 0x8000 != 0 {
        // SMPTE time is not used by any sequence resource we play.
        return Err(FormatError::UnsupportedTiming);
    }

    let mut tracks = Vec::new();
    let mut pos = 8 + header_len;
    while pos + 8 <= data.len() {
        let tag = &data[pos..pos + 4];
        let len = u32::from_be_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]])
            as usize;
        pos += 8;
        if pos + len > data.len() {
            return Err(FormatError::UnexpectedEof);
        }
        if tag == b"MTrk" {
            tracks.push(parse_track(&data[pos..pos + len])?);
        }
        pos += len;
    }
    if tracks.is_empty() {
        return Err(FormatError::UnexpectedEof);
    }
    Ok(EventStream::new(tracks, division as u32))
}

fn parse_track(data: &[u8]) -> Result<Vec<TimedEvent>, FormatError> {
    let mut events = Vec::new();
    let mut pos = 0usize;
    let mut tick = 0u32;
    let mut running_status = 0u8;
    let mut end_tick = None;

    while pos < data.len() && end_tick.is_none() {
        tick += read_varint(data, &mut pos)?;

        let mut status = *data.get(pos).ok_or(FormatError::UnexpectedEof)?;
        if status & 0x80 != 0 {
            pos += 1;
        } else {
            // Running status: reuse the previous status byte.
            if running_status & 0x80 == 0 {
                return Err(FormatError::InvalidHeader);
            }
            status = running_status;
        }

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
            0xF0 | 0xF7 => {
                let len = read_varint(data, &mut pos)? as usize;
                let body = data.get(pos..pos + len).ok_or(FormatError::UnexpectedEof)?;
                pos += len;
                if status == 0xF0 {
                    // Strip the trailing end-of-exclusive byte.
                    let payload = body.strip_suffix(&[0xF7]).unwrap_or(body);
                    events.push(TimedEvent {
                        tick,
                        event: StreamEvent::Emit(SequenceEvent::sysex(payload)),
                    });
                }
            }
            status if status & 0x80 != 0 && status < 0xF0 => {
                running_status = status;
                let data1 = *data.get(pos).ok_or(FormatError::UnexpectedEof)?;
                pos += 1;
                let data2 = if has_two_data_bytes(status) {
                    let b = *data.get(pos).ok_or(FormatError::UnexpectedEof)?;
                    pos += 1;
                    b
                } else {
                    0
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
    Ok(events)
}

fn has_two_data_bytes(status: u8) -> bool {
    !matches!(status & 0xF0, 0xC0 | 0xD0)
}

/// Variable-length quantity, most significant septet first.
pub(crate) fn read_varint(data: &[u8], pos: &mut usize) -> Result<u32, FormatError> {
    let mut value = 0u32;
    for _ in 0..4 {
        let byte = *data.get(*pos).ok_or(FormatError::UnexpectedEof)?;
        *pos += 1;
        value = (value << 7) | (byte & 0x7F) as u32;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(FormatError::InvalidHeader)
}
