//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Reassembly of chunks into frames.
//!
//! Large frames (always video) go through a small set of slots that tolerates
//! interleaved and reordered frames. Everything else goes through a single
//! in-flight message, which is all the old protocol ever needed for audio.
//!
//! Chunks handed to this module have already been bounds-checked against the
//! frame length in their header.

use std::collections::{BTreeMap, VecDeque};

use log::*;
use toxav_common::{Duration, Instant};

use super::{
    header::{ChunkPosition, Header},
    PacketError, RtpMessage, MAX_CHUNK_LEN,
};

pub const SLOT_COUNT: usize = 3;
/// How many delivered frames are remembered so their late duplicates can be dropped.
pub const DELIVERED_HISTORY_LEN: usize = 16;
/// An incomplete key frame in the oldest slot can't be pushed out by a
/// non-key frame sent less than this many milliseconds after it.
pub const KEY_FRAME_GRACE_MILLIS: i32 = 15;

/// A frame under reassembly.
#[derive(Debug)]
pub struct PartialFrame {
    header: Header,
    data: Vec<u8>,
    // Bytes written so far, start to end. Ranges never overlap or touch.
    covered: BTreeMap<u32, u32>,
    received: u32,
    first_arrival: Instant,
}

impl PartialFrame {
    fn new(now: Instant, header: &Header, frame_len: u32) -> Self {
        Self {
            header: header.clone(),
            data: vec![0; frame_len as usize],
            covered: BTreeMap::new(),
            received: 0,
            first_arrival: now,
        }
    }

    fn matches(&self, header: &Header) -> bool {
        self.header.sequence_number == header.sequence_number
            && self.header.timestamp == header.timestamp
    }

    /// Copies a chunk into the frame. Only bytes not written before count as
    /// received, so duplicates and overlapping chunks never inflate the total.
    fn write_chunk(&mut self, offset: u32, payload: &[u8]) -> Result<(), PacketError> {
        let start = offset;
        let end = offset.saturating_add(payload.len() as u32);
        if end > self.frame_len() {
            return Err(PacketError::ChunkOutOfBounds {
                offset,
                chunk_len: payload.len(),
                frame_len: self.frame_len(),
            });
        }

        let touching: Vec<(u32, u32)> = self
            .covered
            .range(..=end)
            .rev()
            .take_while(|&(_, &range_end)| range_end >= start)
            .map(|(&range_start, &range_end)| (range_start, range_end))
            .collect();
        // The sender never splits a frame into more chunks than this.
        if touching.is_empty() && self.covered.len() >= self.max_ranges() {
            return Err(PacketError::TooFragmented {
                sequence_number: self.header.sequence_number,
            });
        }
        let already_covered: u32 = touching
            .iter()
            .map(|&(range_start, range_end)| {
                range_end.min(end).saturating_sub(range_start.max(start))
            })
            .sum();
        if already_covered == end - start {
            trace!(
                "duplicate chunk seqnum={} offset={}",
                self.header.sequence_number,
                offset
            );
            return Ok(());
        }

        self.data[start as usize..end as usize].copy_from_slice(payload);
        let mut merged = (start, end);
        for (range_start, range_end) in touching {
            self.covered.remove(&range_start);
            merged = (merged.0.min(range_start), merged.1.max(range_end));
        }
        self.covered.insert(merged.0, merged.1);
        self.received += (end - start) - already_covered;
        Ok(())
    }

    fn max_ranges(&self) -> usize {
        self.frame_len().div_ceil(MAX_CHUNK_LEN as u32) as usize
    }

    pub fn frame_len(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn received_len(&self) -> u32 {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        self.received >= self.frame_len()
    }

    pub fn is_key_frame(&self) -> bool {
        self.header.is_key_frame()
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.first_arrival)
    }

    pub fn into_message(self) -> RtpMessage {
        let mut header = self.header;
        header.received_length_full = self.received;
        RtpMessage {
            header,
            data: self.data,
        }
    }
}

/// Reassembly slots for the large frame path, oldest first.
#[derive(Debug, Default)]
pub struct FrameSlots {
    slots: Vec<PartialFrame>,
}

impl FrameSlots {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Writes a chunk into the slot of its frame, taking a free slot or evicting
    /// the oldest one if needed. Frames that leave the slots, complete or not,
    /// are appended to `leaving` in the order they should be delivered.
    pub fn insert(
        &mut self,
        now: Instant,
        header: &Header,
        position: ChunkPosition,
        payload: &[u8],
        leaving: &mut Vec<PartialFrame>,
    ) -> Result<(), PacketError> {
        let index = match self.slots.iter().position(|slot| slot.matches(header)) {
            Some(index) => {
                let expected = self.slots[index].frame_len();
                if expected != position.frame_len {
                    return Err(PacketError::FrameLengthMismatch {
                        expected,
                        actual: position.frame_len,
                    });
                }
                index
            }
            None => {
                if self.slots.len() >= SLOT_COUNT {
                    self.evict_oldest(now, header, leaving)?;
                }
                self.slots
                    .push(PartialFrame::new(now, header, position.frame_len));
                self.slots.len() - 1
            }
        };

        self.slots[index].write_chunk(position.offset, payload)?;
        self.release_completed(leaving);
        Ok(())
    }

    fn evict_oldest(
        &mut self,
        now: Instant,
        incoming: &Header,
        leaving: &mut Vec<PartialFrame>,
    ) -> Result<(), PacketError> {
        let oldest = &self.slots[0];
        if oldest.is_key_frame() && !incoming.is_key_frame() {
            let sent_after = incoming.timestamp.wrapping_sub(oldest.header.timestamp) as i32;
            if sent_after < KEY_FRAME_GRACE_MILLIS {
                return Err(PacketError::KeyFrameProtected {
                    sequence_number: oldest.header.sequence_number,
                });
            }
        }

        let evicted = self.slots.remove(0);
        debug!(
            "evicting frame seqnum={} received={}/{} after {:?}",
            evicted.header.sequence_number,
            evicted.received,
            evicted.frame_len(),
            evicted.age(now)
        );
        leaving.push(evicted);
        self.release_completed(leaving);
        Ok(())
    }

    // A completed frame is held back only while the oldest slot holds an
    // incomplete key frame.
    fn release_completed(&mut self, leaving: &mut Vec<PartialFrame>) {
        while let Some(front) = self.slots.first() {
            if front.is_complete() {
                leaving.push(self.slots.remove(0));
                continue;
            }
            if front.is_key_frame() {
                return;
            }
            let mut index = 1;
            while index < self.slots.len() {
                if self.slots[index].is_complete() {
                    leaving.push(self.slots.remove(index));
                } else {
                    index += 1;
                }
            }
            return;
        }
    }
}

/// The single in-flight message of the legacy path.
#[derive(Debug, Default)]
pub struct Multipart {
    in_flight: Option<PartialFrame>,
}

impl Multipart {
    pub fn is_empty(&self) -> bool {
        self.in_flight.is_none()
    }

    /// Like [`FrameSlots::insert`], but a part of a newer message pushes out the
    /// one in flight, and a part of an older message is refused.
    pub fn insert(
        &mut self,
        now: Instant,
        header: &Header,
        position: ChunkPosition,
        payload: &[u8],
        leaving: &mut Vec<PartialFrame>,
    ) -> Result<(), PacketError> {
        if payload.len() as u32 == position.frame_len {
            if let Some(flushed) = self.in_flight.take() {
                leaving.push(flushed);
            }
            let mut frame = PartialFrame::new(now, header, position.frame_len);
            frame.write_chunk(position.offset, payload)?;
            leaving.push(frame);
            return Ok(());
        }

        match self.in_flight.as_mut() {
            Some(frame) if frame.matches(header) => {
                let expected = frame.frame_len();
                if expected != position.frame_len {
                    return Err(PacketError::FrameLengthMismatch {
                        expected,
                        actual: position.frame_len,
                    });
                }
                frame.write_chunk(position.offset, payload)?;
                if frame.is_complete() {
                    if let Some(complete) = self.in_flight.take() {
                        leaving.push(complete);
                    }
                }
            }
            Some(frame) if frame.header.timestamp > header.timestamp => {
                return Err(PacketError::OutdatedMessage {
                    timestamp: header.timestamp,
                    in_flight_timestamp: frame.header.timestamp,
                });
            }
            _ => {
                if let Some(flushed) = self.in_flight.take() {
                    leaving.push(flushed);
                }
                let mut frame = PartialFrame::new(now, header, position.frame_len);
                frame.write_chunk(position.offset, payload)?;
                self.in_flight = Some(frame);
            }
        }
        Ok(())
    }
}

/// Frames that already left reassembly, oldest first.
#[derive(Debug, Default)]
pub struct DeliveredFrames {
    recent: VecDeque<(u16, u32)>,
}

impl DeliveredFrames {
    pub fn contains(&self, header: &Header) -> bool {
        self.recent
            .contains(&(header.sequence_number, header.timestamp))
    }

    pub fn remember(&mut self, frame: &PartialFrame) {
        if self.recent.len() >= DELIVERED_HISTORY_LEN {
            self.recent.pop_front();
        }
        self.recent
            .push_back((frame.header.sequence_number, frame.header.timestamp));
    }
}
