//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The media of one active call: an audio and a video session that share a
//! bandwidth controller, and the dispatch of lossy packets between them.

use std::sync::Arc;

use log::*;
use parking_lot::Mutex;
use thiserror::Error;
use toxav_common::Instant;

use crate::{
    bwc::{BandwidthController, BandwidthCycle, FeedbackError, LossReportHandler, BWC_PACKET_ID},
    msi::Capabilities,
    rtp::{FrameHandler, MediaType, PacketError, RtpError, RtpSession},
    transport::{lossy_sender_for, FriendNumber, LossyTransport},
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AvError {
    #[error("the peer doesn't receive {0}")]
    PayloadTypeDisabled(MediaType),
    #[error("empty packet")]
    EmptyPacket,
    #[error("unknown packet id {0}")]
    UnknownPacketId(u8),
    #[error(transparent)]
    Rtp(#[from] RtpError),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error(transparent)]
    Feedback(#[from] FeedbackError),
}

pub struct CallMedia {
    friend_number: FriendNumber,
    peer_capabilities: Capabilities,
    audio: RtpSession,
    video: RtpSession,
    bwc: Arc<Mutex<BandwidthController>>,
}

impl CallMedia {
    pub fn new(
        friend_number: FriendNumber,
        now: Instant,
        peer_capabilities: Capabilities,
        transport: Arc<LossyTransport>,
        on_audio_frame: Box<FrameHandler>,
        on_video_frame: Box<FrameHandler>,
        on_loss_report: Option<Box<LossReportHandler>>,
    ) -> Self {
        let bwc = Arc::new(Mutex::new(BandwidthController::new(
            friend_number,
            now,
            Some(lossy_sender_for(transport.clone(), friend_number)),
            on_loss_report,
        )));
        let audio = RtpSession::new(
            MediaType::Audio,
            friend_number,
            now,
            lossy_sender_for(transport.clone(), friend_number),
            Some(bwc.clone()),
            on_audio_frame,
        );
        let video = RtpSession::new(
            MediaType::Video,
            friend_number,
            now,
            lossy_sender_for(transport, friend_number),
            Some(bwc.clone()),
            on_video_frame,
        );
        let mut media = Self {
            friend_number,
            peer_capabilities,
            audio,
            video,
            bwc,
        };
        media.set_peer_capabilities(peer_capabilities);
        media
    }

    pub fn friend_number(&self) -> FriendNumber {
        self.friend_number
    }

    pub fn peer_capabilities(&self) -> Capabilities {
        self.peer_capabilities
    }

    /// We only receive what the peer sends.
    pub fn set_peer_capabilities(&mut self, capabilities: Capabilities) {
        debug!(
            "av({}): peer capabilities {:?}",
            self.friend_number, capabilities
        );
        self.peer_capabilities = capabilities;
        for (session, sends) in [
            (&mut self.audio, Capabilities::SEND_AUDIO),
            (&mut self.video, Capabilities::SEND_VIDEO),
        ] {
            if capabilities.contains(sends) {
                session.allow_receiving();
            } else {
                session.stop_receiving();
            }
        }
    }

    pub fn session(&self, media_type: MediaType) -> &RtpSession {
        match media_type {
            MediaType::Audio => &self.audio,
            MediaType::Video => &self.video,
        }
    }

    fn session_mut(&mut self, media_type: MediaType) -> &mut RtpSession {
        match media_type {
            MediaType::Audio => &mut self.audio,
            MediaType::Video => &mut self.video,
        }
    }

    pub fn bandwidth_cycle(&self) -> BandwidthCycle {
        self.bwc.lock().cycle().clone()
    }

    pub fn send_audio_frame(&mut self, now: Instant, frame: &[u8]) -> Result<(), AvError> {
        self.send_frame(now, MediaType::Audio, frame, false)
    }

    pub fn send_video_frame(
        &mut self,
        now: Instant,
        frame: &[u8],
        is_key_frame: bool,
    ) -> Result<(), AvError> {
        self.send_frame(now, MediaType::Video, frame, is_key_frame)
    }

    fn send_frame(
        &mut self,
        now: Instant,
        media_type: MediaType,
        frame: &[u8],
        is_key_frame: bool,
    ) -> Result<(), AvError> {
        let receives = match media_type {
            MediaType::Audio => Capabilities::RECEIVE_AUDIO,
            MediaType::Video => Capabilities::RECEIVE_VIDEO,
        };
        if !self.peer_capabilities.contains(receives) {
            return Err(AvError::PayloadTypeDisabled(media_type));
        }
        self.session_mut(media_type)
            .send_frame(now, frame, is_key_frame)?;
        Ok(())
    }

    /// Handles a packet from the lossy channel. Packets that can't be used are
    /// logged and dropped.
    pub fn handle_lossy_packet(&mut self, now: Instant, packet: &[u8]) {
        if let Err(err) = self.dispatch_lossy_packet(now, packet) {
            debug!("av({}): dropped lossy packet: {}", self.friend_number, err);
        }
    }

    fn dispatch_lossy_packet(&mut self, now: Instant, packet: &[u8]) -> Result<(), AvError> {
        let packet_id = *packet.first().ok_or(AvError::EmptyPacket)?;
        if packet_id == BWC_PACKET_ID {
            self.bwc.lock().handle_feedback_packet(now, packet)?;
            return Ok(());
        }
        let media_type =
            MediaType::from_packet_id(packet_id).ok_or(AvError::UnknownPacketId(packet_id))?;
        self.session_mut(media_type).handle_packet(now, packet)?;
        Ok(())
    }
}

impl Drop for CallMedia {
    fn drop(&mut self) {
        let pending = self.audio.pending_frames() + self.video.pending_frames();
        info!(
            "av({}): media ended with {} frames incomplete",
            self.friend_number, pending
        );
    }
}
