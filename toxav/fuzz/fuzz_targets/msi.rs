//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

#![no_main]

use arbitrary::Unstructured;
use libfuzzer_sys::fuzz_target;
use strum::IntoEnumIterator;
use toxav::{
    msi::{Call, CallEvent, Capabilities, Msi, MSI_PACKET_ID},
    transport::{FriendNumber, SendError},
};

fuzz_target!(|data: &[u8]| {
    let mut gen = Unstructured::new(data);
    let msi = Msi::new(Box::new(
        |_friend_number: FriendNumber, _packet: &[u8]| -> Result<(), SendError> { Ok(()) },
    ));
    // Every other handler fails.
    for (i, event) in CallEvent::iter().enumerate() {
        msi.set_handler(event, move |_msi: &Msi, _call: &Call| {
            if i % 2 == 0 {
                Ok(())
            } else {
                Err(anyhow::anyhow!("handler failed"))
            }
        });
    }

    while let Ok(op) = gen.int_in_range(0..=9u8) {
        let Ok(friend_number) = gen.int_in_range(0..=3u32) else {
            break;
        };
        let capabilities = Capabilities::from_bits(gen.arbitrary().unwrap_or(0));
        match op {
            0 => {
                let _ = msi.invite(friend_number, capabilities);
            }
            1 => {
                let _ = msi.answer(friend_number, capabilities);
            }
            2 => {
                let _ = msi.change_capabilities(friend_number, capabilities);
            }
            3 => {
                let _ = msi.hangup(friend_number);
            }
            4 => msi.handle_peer_status(friend_number, gen.arbitrary().unwrap_or(false)),
            _ => {
                let Ok(len) = gen.int_in_range(0..=300usize) else {
                    break;
                };
                let Ok(bytes) = gen.bytes(len) else {
                    break;
                };
                let mut packet = bytes.to_vec();
                if let Some(packet_id) = packet.first_mut() {
                    *packet_id = MSI_PACKET_ID;
                }
                msi.handle_packet(friend_number, &packet);
            }
        }
    }
    msi.kill();
    assert!(msi.calls().is_empty());
});
