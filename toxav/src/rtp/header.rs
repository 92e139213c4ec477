//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The fixed 80-byte media header that precedes every chunk of a frame.
//!
//! Only the first 12 bytes follow RFC 3550. The rest carries the frame
//! position of the chunk twice: as 32-bit fields for large frames and as
//! 16-bit fields at the very end for peers that only know the old layout.

use byteorder::{ReadBytesExt, BE};
use toxav_common::{Writable, Writer, Zeroes};

pub const HEADER_LEN: usize = 80;
const VERSION: u8 = 2;
const PADDING_LEN: usize = 44;

/// The frame is positioned by the 32-bit offset and length fields.
pub const FLAG_LARGE_FRAME: u64 = 1 << 0;
pub const FLAG_KEY_FRAME: u64 = 1 << 1;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Header {
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    /// 7 bits on the wire.
    pub payload_type: u8,
    pub sequence_number: u16,
    /// Milliseconds since the sender created its session.
    pub timestamp: u32,
    pub ssrc: u32,
    pub flags: u64,
    pub offset_full: u32,
    pub data_length_full: u32,
    /// Informational only. Filled in on delivery with the bytes actually received.
    pub received_length_full: u32,
    pub offset_lower: u16,
    pub data_length_lower: u16,
}

/// Where a chunk sits within its frame, taken from whichever pair of fields the
/// header's flags select.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkPosition {
    pub offset: u32,
    pub frame_len: u32,
}

impl Header {
    /// Returns `None` if `packet` is shorter than a header. Bytes after the
    /// header are ignored.
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < HEADER_LEN {
            return None;
        }
        Self::read(packet).ok()
    }

    fn read(mut reader: &[u8]) -> std::io::Result<Self> {
        let first = reader.read_u8()?;
        let second = reader.read_u8()?;
        let sequence_number = reader.read_u16::<BE>()?;
        let timestamp = reader.read_u32::<BE>()?;
        let ssrc = reader.read_u32::<BE>()?;
        let flags = reader.read_u64::<BE>()?;
        let offset_full = reader.read_u32::<BE>()?;
        let data_length_full = reader.read_u32::<BE>()?;
        let received_length_full = reader.read_u32::<BE>()?;
        let mut reader = reader
            .get(PADDING_LEN..)
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;
        let offset_lower = reader.read_u16::<BE>()?;
        let data_length_lower = reader.read_u16::<BE>()?;
        Ok(Self {
            padding: (first >> 5) & 1 == 1,
            extension: (first >> 4) & 1 == 1,
            csrc_count: first & 0b1111,
            marker: (second >> 7) == 1,
            payload_type: second & 0b0111_1111,
            sequence_number,
            timestamp,
            ssrc,
            flags,
            offset_full,
            data_length_full,
            received_length_full,
            offset_lower,
            data_length_lower,
        })
    }

    pub fn is_large_frame(&self) -> bool {
        self.flags & FLAG_LARGE_FRAME != 0
    }

    pub fn is_key_frame(&self) -> bool {
        self.flags & FLAG_KEY_FRAME != 0
    }

    pub fn chunk_position(&self) -> ChunkPosition {
        if self.is_large_frame() {
            ChunkPosition {
                offset: self.offset_full,
                frame_len: self.data_length_full,
            }
        } else {
            ChunkPosition {
                offset: self.offset_lower as u32,
                frame_len: self.data_length_lower as u32,
            }
        }
    }

    /// Fills both the 32-bit and the 16-bit position fields. The 16-bit ones
    /// saturate for frames that don't fit them.
    pub fn set_chunk_position(&mut self, offset: u32, frame_len: u32) {
        self.offset_full = offset;
        self.data_length_full = frame_len;
        self.offset_lower = saturate_u16(offset);
        self.data_length_lower = saturate_u16(frame_len);
    }
}

fn saturate_u16(value: u32) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}

impl Writer for Header {
    fn written_len(&self) -> usize {
        HEADER_LEN
    }

    fn write(&self, out: &mut dyn Writable) {
        let first = (VERSION << 6)
            | ((self.padding as u8) << 5)
            | ((self.extension as u8) << 4)
            | (self.csrc_count & 0b1111);
        let second = ((self.marker as u8) << 7) | (self.payload_type & 0b0111_1111);
        (
            [first, second],
            self.sequence_number,
            self.timestamp,
            self.ssrc,
            self.flags,
            (
                self.offset_full,
                self.data_length_full,
                self.received_length_full,
                Zeroes(PADDING_LEN),
                self.offset_lower,
                self.data_length_lower,
            ),
        )
            .write(out)
    }
}

#[cfg(test)]
mod test {
    use std::ops::Range;

    use hex_literal::hex;

    use super::*;

    const LOWER_FIELDS_RANGE: Range<usize> = 76..80;

    fn example_header() -> Header {
        Header {
            padding: false,
            extension: true,
            csrc_count: 3,
            marker: true,
            payload_type: 65,
            sequence_number: 0x0102,
            timestamp: 0x03040506,
            ssrc: 0x0708090a,
            flags: FLAG_LARGE_FRAME | FLAG_KEY_FRAME,
            offset_full: 0x00010000,
            data_length_full: 0x00020000,
            received_length_full: 0,
            offset_lower: 0xffff,
            data_length_lower: 0xffff,
        }
    }

    #[test]
    fn test_serialize_layout() {
        let serialized = example_header().to_vec();
        assert_eq!(HEADER_LEN, serialized.len());
        assert_eq!(
            hex!(
                "93 c1 0102 03040506 0708090a 0000000000000003"
                "00010000 00020000 00000000"
            ),
            serialized[..32]
        );
        assert!(serialized[32..76].iter().all(|byte| *byte == 0));
        assert_eq!(hex!("ffff ffff"), serialized[LOWER_FIELDS_RANGE]);
    }

    #[test]
    fn test_parse() {
        let header = example_header();
        let mut packet = header.to_vec();
        assert_eq!(Some(header.clone()), Header::parse(&packet));

        // Trailing payload is ignored.
        packet.extend_from_slice(b"payload");
        assert_eq!(Some(header), Header::parse(&packet));

        assert_eq!(None, Header::parse(&packet[..HEADER_LEN - 1]));
        assert_eq!(None, Header::parse(&[]));
    }

    #[test]
    fn test_parse_ignores_padding_contents() {
        let mut packet = example_header().to_vec();
        packet[40] = 0xff;
        assert_eq!(Some(example_header()), Header::parse(&packet));
    }

    #[test]
    fn test_chunk_position() {
        let mut header = Header::default();
        header.set_chunk_position(1292, 50_000);
        assert_eq!(1292, header.offset_lower);
        assert_eq!(50_000, header.data_length_lower);
        assert_eq!(
            ChunkPosition {
                offset: 1292,
                frame_len: 50_000
            },
            header.chunk_position()
        );

        header.set_chunk_position(70_000, 100_000);
        assert_eq!(u16::MAX, header.offset_lower);
        assert_eq!(u16::MAX, header.data_length_lower);
        // Without the large frame flag, only the 16-bit fields count.
        assert_eq!(
            ChunkPosition {
                offset: u16::MAX as u32,
                frame_len: u16::MAX as u32
            },
            header.chunk_position()
        );

        header.flags |= FLAG_LARGE_FRAME;
        assert!(header.is_large_frame());
        assert!(!header.is_key_frame());
        assert_eq!(
            ChunkPosition {
                offset: 70_000,
                frame_len: 100_000
            },
            header.chunk_position()
        );
    }
}
