//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Media transport over the lossy channel.
//!
//! A frame is split into chunks that each fit in one lossy packet:
//!
//! ```text
//! +-----------+------------------+---------------+
//! | packet id | header (80 bytes)| chunk payload |
//! +-----------+------------------+---------------+
//! ```
//!
//! The receiving side puts the chunks back together (see [`reassembly`]) and
//! hands whole frames, or what arrived of them, to the frame handler.

mod header;
mod reassembly;

use std::sync::Arc;

use log::*;
use parking_lot::Mutex;
use strum_macros::{Display, EnumIter};
use thiserror::Error;
use toxav_common::{Instant, Writer};

pub use self::{
    header::{ChunkPosition, Header, FLAG_KEY_FRAME, FLAG_LARGE_FRAME, HEADER_LEN},
    reassembly::{DELIVERED_HISTORY_LEN, KEY_FRAME_GRACE_MILLIS, SLOT_COUNT},
};
use self::reassembly::{DeliveredFrames, FrameSlots, Multipart, PartialFrame};
use crate::{
    bwc::BandwidthController,
    transport::{FriendNumber, LossyPacketSender, MAX_LOSSY_PACKET_SIZE},
};

pub const AUDIO_PAYLOAD_TYPE: u8 = 192;
pub const VIDEO_PAYLOAD_TYPE: u8 = 193;
/// Payload bytes in every chunk but the last.
pub const MAX_CHUNK_LEN: usize = MAX_LOSSY_PACKET_SIZE - 1 - HEADER_LEN;
/// Frames larger than this use the 32-bit position fields even for audio.
const MAX_LEGACY_FRAME_LEN: usize = u16::MAX as usize;
/// We won't allocate more than this for one incoming frame.
pub const MAX_RECEIVE_FRAME_LEN: u32 = 32 * 1024 * 1024;
/// The first few video frames of a session are left out of loss accounting.
const DISMISSED_FRAME_COUNT: u32 = 10;
const LOGGED_PACKET_PREFIX_LEN: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum MediaType {
    Audio,
    Video,
}

impl MediaType {
    /// Also the packet id of the media's packets.
    pub const fn payload_type(self) -> u8 {
        match self {
            Self::Audio => AUDIO_PAYLOAD_TYPE,
            Self::Video => VIDEO_PAYLOAD_TYPE,
        }
    }

    pub fn from_packet_id(packet_id: u8) -> Option<Self> {
        match packet_id {
            AUDIO_PAYLOAD_TYPE => Some(Self::Audio),
            VIDEO_PAYLOAD_TYPE => Some(Self::Video),
            _ => None,
        }
    }
}

/// A frame handed to the frame handler.
///
/// `data` always has the length the sender declared. If chunks went missing,
/// the missing ranges are zeroed and `header.received_length_full` is smaller
/// than `data.len()`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RtpMessage {
    pub header: Header,
    pub data: Vec<u8>,
}

impl RtpMessage {
    pub fn received_len(&self) -> usize {
        self.header.received_length_full as usize
    }

    pub fn is_complete(&self) -> bool {
        self.received_len() >= self.data.len()
    }

    pub fn is_key_frame(&self) -> bool {
        self.header.is_key_frame()
    }
}

pub type FrameHandler = dyn FnMut(RtpMessage) + Send;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RtpError {
    #[error("frame is empty")]
    EmptyFrame,
    #[error("frame of {0} bytes doesn't fit the 32-bit length field")]
    FrameTooLarge(usize),
    #[error("{failed} of {total} packets failed to send")]
    SendFailed { failed: usize, total: usize },
}

/// Reasons an incoming packet is dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("unexpected packet id {0}")]
    InvalidPacketId(u8),
    #[error("packet of {0} bytes has no payload")]
    TooShort(usize),
    #[error("unexpected payload type {0} in header")]
    PayloadTypeMismatch(u8),
    #[error("frame length is zero")]
    EmptyFrame,
    #[error("frame length {0} is too large")]
    FrameTooLarge(u32),
    #[error("offset {offset} is outside of frame of length {frame_len}")]
    InvalidOffset { offset: u32, frame_len: u32 },
    #[error("chunk of {chunk_len} bytes at offset {offset} overruns frame of length {frame_len}")]
    ChunkOutOfBounds {
        offset: u32,
        chunk_len: usize,
        frame_len: u32,
    },
    #[error("frame length {actual} differs from earlier chunks ({expected})")]
    FrameLengthMismatch { expected: u32, actual: u32 },
    #[error("frame {sequence_number} arrives in more pieces than it can have been sent in")]
    TooFragmented { sequence_number: u16 },
    #[error("all slots are taken and the oldest holds key frame {sequence_number}")]
    KeyFrameProtected { sequence_number: u16 },
    #[error("message with timestamp {timestamp} is older than the one in flight ({in_flight_timestamp})")]
    OutdatedMessage {
        timestamp: u32,
        in_flight_timestamp: u32,
    },
    #[error("frame {sequence_number} was already delivered")]
    AlreadyDelivered { sequence_number: u16 },
    #[error("receiving is disabled")]
    NotReceiving,
}

impl PacketError {
    /// The packet itself is broken, as opposed to arriving at a bad time.
    fn is_malformed(&self) -> bool {
        !matches!(
            self,
            Self::KeyFrameProtected { .. }
                | Self::OutdatedMessage { .. }
                | Self::AlreadyDelivered { .. }
                | Self::NotReceiving
        )
    }
}

/// One direction-pair of one media type of a call.
pub struct RtpSession {
    media_type: MediaType,
    friend_number: FriendNumber,
    created_at: Instant,
    sequence_number: u16,
    ssrc: u32,
    receiving: bool,
    slots: FrameSlots,
    multipart: Multipart,
    delivered: DeliveredFrames,
    dismissed_frames: u32,
    send_packet: Box<LossyPacketSender>,
    bwc: Option<Arc<Mutex<BandwidthController>>>,
    on_frame: Box<FrameHandler>,
}

impl RtpSession {
    pub fn new(
        media_type: MediaType,
        friend_number: FriendNumber,
        now: Instant,
        send_packet: Box<LossyPacketSender>,
        bwc: Option<Arc<Mutex<BandwidthController>>>,
        on_frame: Box<FrameHandler>,
    ) -> Self {
        let ssrc = rand::random();
        info!(
            "rtp({} {}): new session with ssrc {:#010x}",
            friend_number, media_type, ssrc
        );
        Self {
            media_type,
            friend_number,
            created_at: now,
            sequence_number: 0,
            ssrc,
            receiving: true,
            slots: FrameSlots::default(),
            multipart: Multipart::default(),
            delivered: DeliveredFrames::default(),
            dismissed_frames: 0,
            send_packet,
            bwc,
            on_frame,
        }
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn friend_number(&self) -> FriendNumber {
        self.friend_number
    }

    /// The sequence number the next frame will be sent with.
    pub fn sequence_number(&self) -> u16 {
        self.sequence_number
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn set_ssrc(&mut self, ssrc: u32) {
        self.ssrc = ssrc;
    }

    /// Frames with chunks received but not yet delivered.
    pub fn pending_frames(&self) -> usize {
        self.slots.len() + usize::from(!self.multipart.is_empty())
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving
    }

    pub fn allow_receiving(&mut self) {
        if !self.receiving {
            debug!("rtp({} {}): receiving enabled", self.friend_number, self.media_type);
            self.receiving = true;
        }
    }

    pub fn stop_receiving(&mut self) {
        if self.receiving {
            debug!("rtp({} {}): receiving disabled", self.friend_number, self.media_type);
            self.receiving = false;
        }
    }

    /// Splits `frame` into packets and sends them all, even if some fail.
    pub fn send_frame(
        &mut self,
        now: Instant,
        frame: &[u8],
        is_key_frame: bool,
    ) -> Result<(), RtpError> {
        if frame.is_empty() {
            return Err(RtpError::EmptyFrame);
        }
        let frame_len =
            u32::try_from(frame.len()).map_err(|_| RtpError::FrameTooLarge(frame.len()))?;

        let packet_id = self.media_type.payload_type();
        let mut flags = 0;
        if self.media_type == MediaType::Video || frame.len() > MAX_LEGACY_FRAME_LEN {
            flags |= FLAG_LARGE_FRAME;
        }
        if is_key_frame {
            flags |= FLAG_KEY_FRAME;
        }
        let mut header = Header {
            payload_type: packet_id % 128,
            sequence_number: self.sequence_number,
            timestamp: now.millis_since_truncated(self.created_at),
            ssrc: self.ssrc,
            flags,
            ..Default::default()
        };

        let mut total = 0;
        let mut failed = 0;
        for (index, chunk) in frame.chunks(MAX_CHUNK_LEN).enumerate() {
            header.set_chunk_position((index * MAX_CHUNK_LEN) as u32, frame_len);
            let packet = ([packet_id], &header, chunk).to_vec();
            total += 1;
            if let Err(err) = (self.send_packet)(&packet) {
                warn!(
                    "rtp({} {}): failed to send chunk {} of frame {}: {}",
                    self.friend_number, self.media_type, index, self.sequence_number, err
                );
                failed += 1;
            }
        }
        self.sequence_number = self.sequence_number.wrapping_add(1);

        if failed > 0 {
            return Err(RtpError::SendFailed { failed, total });
        }
        Ok(())
    }

    /// Handles one packet from the lossy channel, including its packet id.
    ///
    /// Dropped packets are logged and reported as an error; they never affect
    /// frames already under reassembly.
    pub fn handle_packet(&mut self, now: Instant, packet: &[u8]) -> Result<(), PacketError> {
        let result = self.receive_packet(now, packet);
        if let Err(err) = &result {
            debug!(
                "rtp({} {}): dropping packet: {}",
                self.friend_number, self.media_type, err
            );
            if err.is_malformed() {
                debug!(
                    "{}",
                    hex::encode(&packet[..packet.len().min(LOGGED_PACKET_PREFIX_LEN)])
                );
            }
        }
        result
    }

    fn receive_packet(&mut self, now: Instant, packet: &[u8]) -> Result<(), PacketError> {
        let payload_type = self.media_type.payload_type();
        match packet.first() {
            Some(packet_id) if *packet_id == payload_type => {}
            Some(packet_id) => return Err(PacketError::InvalidPacketId(*packet_id)),
            None => return Err(PacketError::TooShort(0)),
        }
        if packet.len() <= 1 + HEADER_LEN {
            return Err(PacketError::TooShort(packet.len()));
        }
        let header =
            Header::parse(&packet[1..]).ok_or(PacketError::TooShort(packet.len()))?;
        if header.payload_type != payload_type % 128 {
            return Err(PacketError::PayloadTypeMismatch(header.payload_type));
        }
        let payload = &packet[1 + HEADER_LEN..];
        let position = header.chunk_position();
        check_chunk_bounds(position, payload.len())?;

        if !self.receiving {
            return Err(PacketError::NotReceiving);
        }
        if self.delivered.contains(&header) {
            return Err(PacketError::AlreadyDelivered {
                sequence_number: header.sequence_number,
            });
        }

        let mut leaving = Vec::new();
        if header.is_large_frame() {
            self.slots
                .insert(now, &header, position, payload, &mut leaving)?;
            for frame in leaving {
                self.update_bwc_values(now, &frame);
                self.deliver(frame);
            }
        } else {
            self.multipart
                .insert(now, &header, position, payload, &mut leaving)?;
            if let Some(bwc) = &self.bwc {
                bwc.lock().record_received(now, packet.len() as u32);
            }
            for frame in leaving {
                if !frame.is_complete() {
                    if let Some(bwc) = &self.bwc {
                        bwc.lock()
                            .record_loss(now, frame.frame_len() - frame.received_len());
                    }
                }
                self.deliver(frame);
            }
        }
        Ok(())
    }

    fn update_bwc_values(&mut self, now: Instant, frame: &PartialFrame) {
        if self.dismissed_frames < DISMISSED_FRAME_COUNT {
            self.dismissed_frames += 1;
            return;
        }
        if let Some(bwc) = &self.bwc {
            let mut bwc = bwc.lock();
            bwc.record_received(now, frame.frame_len());
            if !frame.is_complete() {
                bwc.record_loss(now, frame.frame_len() - frame.received_len());
            }
        }
    }

    fn deliver(&mut self, frame: PartialFrame) {
        self.delivered.remember(&frame);
        let message = frame.into_message();
        trace!(
            "rtp({} {}): delivering frame {} ({}/{} bytes)",
            self.friend_number,
            self.media_type,
            message.header.sequence_number,
            message.received_len(),
            message.data.len()
        );
        (self.on_frame)(message);
    }
}

fn check_chunk_bounds(position: ChunkPosition, chunk_len: usize) -> Result<(), PacketError> {
    let ChunkPosition { offset, frame_len } = position;
    if frame_len == 0 {
        return Err(PacketError::EmptyFrame);
    }
    if frame_len > MAX_RECEIVE_FRAME_LEN {
        return Err(PacketError::FrameTooLarge(frame_len));
    }
    if offset >= frame_len {
        return Err(PacketError::InvalidOffset { offset, frame_len });
    }
    if offset as u64 + chunk_len as u64 > frame_len as u64 {
        return Err(PacketError::ChunkOutOfBounds {
            offset,
            chunk_len,
            frame_len,
        });
    }
    Ok(())
}
