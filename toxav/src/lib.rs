//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Media transport for one-to-one audio/video calls: RTP framing and
//! reassembly, loss feedback, and call signaling.

pub mod av;
pub mod bwc;
pub mod config;
pub mod loopback;
pub mod msi;
pub mod rtp;
pub mod transport;
