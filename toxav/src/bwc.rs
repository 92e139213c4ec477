//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Bandwidth controller: measures loss on our side of a call and reports it to
//! the peer, and turns the peer's reports into a loss fraction for bitrate adaptation.
//!
//! Each side accumulates the bytes it received and the bytes it believes were lost
//! over a cycle. A cycle ends once enough updates have been recorded *and* enough
//! time has passed; if any loss was seen, a 9-byte feedback packet is sent:
//!
//! ```text
//!  0      1                  5                  9
//! +------+------------------+------------------+
//! | 196  | lost bytes (u32) | recv bytes (u32) |
//! +------+------------------+------------------+
//! ```

use log::*;
use thiserror::Error;
use toxav_common::{BytesReader, Duration, Instant, Writable, Writer};

use crate::transport::{FriendNumber, LossyPacketSender};

pub const BWC_PACKET_ID: u8 = 196;
const FEEDBACK_PACKET_LEN: usize = 9;
/// Minimum time between two feedback packets, in both directions.
const SEND_INTERVAL: Duration = Duration::from_millis(950);
/// A cycle needs more than this many received-byte updates before it may end.
const AVG_LOSS_OVER_CYCLES_COUNT: u32 = 30;

/// Called with the friend number and the fraction of bytes the peer reported lost.
pub type LossReportHandler = dyn FnMut(FriendNumber, f32) + Send;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackError {
    #[error("feedback packet has invalid length {0}")]
    InvalidLength(usize),
    #[error("feedback packet has invalid packet id {0}")]
    InvalidPacketId(u8),
    #[error("feedback arrived {0:?} after the previous one")]
    TooSoon(Duration),
}

/// The contents of a feedback packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Feedback {
    pub lost: u32,
    pub received: u32,
}

impl Feedback {
    pub fn parse(packet: &[u8]) -> Result<Self, FeedbackError> {
        if packet.len() != FEEDBACK_PACKET_LEN {
            return Err(FeedbackError::InvalidLength(packet.len()));
        }
        let mut reader = BytesReader::from_slice(packet);
        let packet_id = reader
            .read_u8()
            .map_err(|_| FeedbackError::InvalidLength(packet.len()))?;
        if packet_id != BWC_PACKET_ID {
            return Err(FeedbackError::InvalidPacketId(packet_id));
        }
        let lost = reader
            .read_u32_be()
            .map_err(|_| FeedbackError::InvalidLength(packet.len()))?;
        let received = reader
            .read_u32_be()
            .map_err(|_| FeedbackError::InvalidLength(packet.len()))?;
        Ok(Self { lost, received })
    }

    /// `None` if nothing was lost.
    pub fn loss_fraction(&self) -> Option<f32> {
        if self.lost == 0 {
            return None;
        }
        let lost = self.lost as f64;
        let received = self.received as f64;
        Some((lost / (lost + received)) as f32)
    }
}

impl Writer for Feedback {
    fn written_len(&self) -> usize {
        FEEDBACK_PACKET_LEN
    }

    fn write(&self, out: &mut dyn Writable) {
        ([BWC_PACKET_ID], self.lost, self.received).write(out)
    }
}

/// Per call leg counters. Reset after each feedback transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandwidthCycle {
    /// Wraps on overflow.
    pub lost_bytes: u32,
    /// Wraps on overflow.
    pub received_bytes: u32,
    pub cycles_since_send: u32,
    pub last_sent_time: Instant,
    /// When the peer's last accepted feedback arrived.
    pub last_recv_time: Option<Instant>,
}

pub struct BandwidthController {
    friend_number: FriendNumber,
    cycle: BandwidthCycle,
    send_packet: Option<Box<LossyPacketSender>>,
    loss_report_handler: Option<Box<LossReportHandler>>,
}

impl BandwidthController {
    pub fn new(
        friend_number: FriendNumber,
        now: Instant,
        send_packet: Option<Box<LossyPacketSender>>,
        loss_report_handler: Option<Box<LossReportHandler>>,
    ) -> Self {
        Self {
            friend_number,
            cycle: BandwidthCycle {
                lost_bytes: 0,
                received_bytes: 0,
                cycles_since_send: 0,
                last_sent_time: now,
                last_recv_time: None,
            },
            send_packet,
            loss_report_handler,
        }
    }

    pub fn friend_number(&self) -> FriendNumber {
        self.friend_number
    }

    pub fn cycle(&self) -> &BandwidthCycle {
        &self.cycle
    }

    pub fn record_loss(&mut self, now: Instant, bytes_lost: u32) {
        if bytes_lost == 0 {
            return;
        }
        debug!(
            "bwc({}): lost {} bytes",
            self.friend_number, bytes_lost
        );
        self.cycle.lost_bytes = self.cycle.lost_bytes.wrapping_add(bytes_lost);
        self.send_update_if_due(now);
    }

    pub fn record_received(&mut self, now: Instant, bytes: u32) {
        if bytes == 0 {
            return;
        }
        self.cycle.cycles_since_send += 1;
        self.cycle.received_bytes = self.cycle.received_bytes.wrapping_add(bytes);
        self.send_update_if_due(now);
    }

    fn send_update_if_due(&mut self, now: Instant) {
        if self.cycle.cycles_since_send <= AVG_LOSS_OVER_CYCLES_COUNT
            || now.saturating_duration_since(self.cycle.last_sent_time) < SEND_INTERVAL
        {
            return;
        }

        if self.cycle.lost_bytes != 0 {
            let feedback = Feedback {
                lost: self.cycle.lost_bytes,
                received: self.cycle.received_bytes,
            };
            debug!(
                "bwc({}): sending feedback lost={} received={}",
                self.friend_number, feedback.lost, feedback.received
            );
            if let Some(send_packet) = self.send_packet.as_mut() {
                if let Err(err) = send_packet(&feedback.to_vec()) {
                    warn!("bwc({}): feedback send failed: {}", self.friend_number, err);
                }
            }
        }

        self.cycle.cycles_since_send = 0;
        self.cycle.lost_bytes = 0;
        self.cycle.received_bytes = 0;
        self.cycle.last_sent_time = now;
    }

    /// Handles a feedback packet from the peer (including the packet id byte).
    ///
    /// Returns the reported loss fraction, if any loss was reported.
    pub fn handle_feedback_packet(
        &mut self,
        now: Instant,
        packet: &[u8],
    ) -> Result<Option<f32>, FeedbackError> {
        let feedback = Feedback::parse(packet).map_err(|err| {
            warn!("bwc({}): dropping feedback: {}", self.friend_number, err);
            err
        })?;

        if let Some(last_recv_time) = self.cycle.last_recv_time {
            let since_last = now.saturating_duration_since(last_recv_time);
            if since_last < SEND_INTERVAL {
                info!("bwc({}): rejecting extra update", self.friend_number);
                return Err(FeedbackError::TooSoon(since_last));
            }
        }
        self.cycle.last_recv_time = Some(now);

        let loss_fraction = feedback.loss_fraction();
        if let Some(loss_fraction) = loss_fraction {
            debug!(
                "bwc({}): peer reported loss {:.3} (lost={} received={})",
                self.friend_number, loss_fraction, feedback.lost, feedback.received
            );
            if let Some(handler) = self.loss_report_handler.as_mut() {
                handler(self.friend_number, loss_fraction);
            }
        }
        Ok(loss_fraction)
    }
}
