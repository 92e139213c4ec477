//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

#![no_main]

use arbitrary::Unstructured;
use libfuzzer_sys::fuzz_target;
use toxav::{
    bwc::{BandwidthController, BWC_PACKET_ID},
    transport::{FriendNumber, SendError},
};
use toxav_common::{Duration, Instant};

fuzz_target!(|data: &[u8]| {
    let mut gen = Unstructured::new(data);
    let mut now = Instant::now();
    let mut bwc = BandwidthController::new(
        0,
        now,
        Some(Box::new(|packet: &[u8]| -> Result<(), SendError> {
            assert_eq!(BWC_PACKET_ID, packet[0]);
            Ok(())
        })),
        Some(Box::new(|_friend_number: FriendNumber, loss: f32| {
            assert!((0.0..=1.0).contains(&loss));
        })),
    );

    while let Ok(op) = gen.int_in_range(0..=2u8) {
        match op {
            0 => bwc.record_loss(now, gen.arbitrary().unwrap_or(0)),
            1 => bwc.record_received(now, gen.arbitrary().unwrap_or(0)),
            _ => {
                let Ok(len) = gen.int_in_range(0..=12usize) else {
                    break;
                };
                let Ok(bytes) = gen.bytes(len) else {
                    break;
                };
                let _ = bwc.handle_feedback_packet(now, bytes);
            }
        }
        now += Duration::from_millis(gen.int_in_range(0..=500).unwrap_or(0));
    }
});
