//! Resource access and the optional start-parameter header chunk.

/// Supplies raw sequence resources to the engine by sound id.
pub trait ResourceProvider {
    /// The sequence data itself.
    fn sound_data(&self, id: u32) -> Option<&[u8]>;

    /// Optional secondary header chunk ("MDhd") carrying initial playback
    /// parameters for the sound.
    fn sound_header(&self, id: u32) -> Option<&[u8]> {
        None
    }
}

/// Initial playback parameters from a sound's header chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SoundHeader {
    pub priority: u8,
    pub volume: u8,
    pub pan: i8,
    pub transpose: i8,
    pub detune: i8,
    pub speed: u8,
}

impl SoundHeader {
    /// Parse a header chunk: "MDhd" tag, big-endian u32 body size, then at
    /// least eight body bytes.
    ///
    /// Returns `None` for a missing tag, an empty body, or a body whose
    /// priority, volume and speed are all zero. One legacy resource
    /// generation ships all-zero chunks that must fall back to engine
    /// defaults.
    pub fn parse(chunk: &[u8]) -> Option<SoundHeader> {
        if chunk.len() < 16 || &chunk[0..4] != b"MDhd" {
            return None;
        }
        let size = u32::from_be_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
        let body = &chunk[8..];
        if size == 0 || body[2] | body[3] | body[7] == 0 {
            return None;
        }
        Some(SoundHeader {
            priority: body[2],
            volume: body[3],
            pan: body[4] as i8,
            transpose: body[5] as i8,
            detune: body[6] as i8,
            speed: body[7],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(body: [u8; 8]) -> Vec<u8> {
        let mut data = b"MDhd".to_vec();
        data.extend_from_slice(&8u32.to_be_bytes());
        data.extend_from_slice(&body);
        data
    }

    #[test]
    fn parses_populated_chunk() {
        let data = chunk([0, 0, 0x60, 0x70, 0x05, 0xFE, 0x02, 100]);
        let header = SoundHeader::parse(&data).unwrap();
        assert_eq!(header.priority, 0x60);
        assert_eq!(header.volume, 0x70);
        assert_eq!(header.pan, 5);
        assert_eq!(header.transpose, -2);
        assert_eq!(header.detune, 2);
        assert_eq!(header.speed, 100);
    }

    #[test]
    fn all_zero_chunk_means_defaults() {
        let data = chunk([0; 8]);
        assert_eq!(SoundHeader::parse(&data), None);
    }

    #[test]
    fn wrong_tag_rejected() {
        let mut data = chunk([0, 0, 1, 2, 3, 4, 5, 6]);
        data[0] = b'X';
        assert_eq!(SoundHeader::parse(&data), None);
    }

    #[test]
    fn truncated_chunk_rejected() {
        assert_eq!(SoundHeader::parse(b"MDhd\x00\x00"), None);
    }
}
