//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

#![no_main]

use std::sync::Arc;

use arbitrary::Unstructured;
use libfuzzer_sys::fuzz_target;
use parking_lot::Mutex;
use toxav::{
    bwc::BandwidthController,
    rtp::{MediaType, RtpMessage, RtpSession},
    transport::SendError,
};
use toxav_common::{Duration, Instant};

fuzz_target!(|data: &[u8]| {
    let mut gen = Unstructured::new(data);
    let Ok(is_video) = gen.arbitrary::<bool>() else {
        return;
    };
    let media_type = if is_video {
        MediaType::Video
    } else {
        MediaType::Audio
    };
    let mut now = Instant::now();

    let bwc = Arc::new(Mutex::new(BandwidthController::new(
        0,
        now,
        Some(Box::new(|_packet: &[u8]| -> Result<(), SendError> { Ok(()) })),
        None,
    )));
    let mut session = RtpSession::new(
        media_type,
        0,
        now,
        Box::new(|_packet: &[u8]| -> Result<(), SendError> { Ok(()) }),
        Some(bwc),
        Box::new(|message: RtpMessage| {
            assert!(message.received_len() <= message.data.len());
        }),
    );

    // Consume all available entropy, one packet at a time.
    while let Ok(len) = gen.int_in_range(0..=1400usize) {
        let Ok(mut packet) = gen.bytes(len).map(|bytes| bytes.to_vec()) else {
            break;
        };
        // Mostly keep the packet id valid so the header gets looked at.
        if gen.ratio(7, 8).unwrap_or(false) && !packet.is_empty() {
            packet[0] = media_type.payload_type();
        }
        let _ = session.handle_packet(now, &packet);
        now += Duration::from_millis(gen.int_in_range(0..=40).unwrap_or(0));
    }
});
