//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The seams to the messenger transport that carries our packets.
//!
//! Connection establishment, encryption and routing all happen on the other
//! side of these types; we only hand over complete packets addressed to a friend.

use std::sync::Arc;

use thiserror::Error;

/// Identifies the remote peer of a call. Assigned by the messenger.
pub type FriendNumber = u32;

/// Largest packet the lossy transport accepts, including the packet id byte.
pub const MAX_LOSSY_PACKET_SIZE: usize = 1373;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to send packet to friend {friend_number}: {reason}")]
pub struct SendError {
    pub friend_number: FriendNumber,
    pub reason: String,
}

impl SendError {
    pub fn new(friend_number: FriendNumber, reason: impl Into<String>) -> Self {
        Self {
            friend_number,
            reason: reason.into(),
        }
    }
}

/// Sends one complete packet over the unreliable channel to the friend the
/// sender was created for. The first byte of the packet is its packet id.
pub type LossyPacketSender = dyn FnMut(&[u8]) -> Result<(), SendError> + Send;

/// Sends one complete packet over the reliable, ordered channel.
pub type LosslessPacketSender = dyn Fn(FriendNumber, &[u8]) -> Result<(), SendError> + Send + Sync;

/// The unreliable channel as a whole, able to reach any friend.
pub type LossyTransport = dyn Fn(FriendNumber, &[u8]) -> Result<(), SendError> + Send + Sync;

/// Binds `transport` to a single friend.
pub fn lossy_sender_for(
    transport: Arc<LossyTransport>,
    friend_number: FriendNumber,
) -> Box<LossyPacketSender> {
    Box::new(move |packet: &[u8]| transport(friend_number, packet))
}
