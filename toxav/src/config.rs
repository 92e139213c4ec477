//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Configuration options for the loopback simulator.

use clap;

/// Simulation options, set by command line arguments or falling back to
/// defaults.
#[derive(Default, clap::Parser, Debug, Clone)]
#[clap(name = "toxav-loopback")]
pub struct Config {
    /// Number of audio and video frames A sends to B.
    #[clap(long, default_value = "200")]
    pub frames: u32,

    /// Size of each audio frame in bytes.
    #[clap(long, default_value = "160")]
    pub audio_frame_size: usize,

    /// Size of each video frame in bytes. Frames larger than one packet are
    /// split into chunks.
    #[clap(long, default_value = "12000")]
    pub video_frame_size: usize,

    /// Every nth video frame is a key frame.
    #[clap(long, default_value = "30")]
    pub keyframe_interval: u32,

    /// Simulated time between two frames (ms).
    #[clap(long, default_value = "20")]
    pub frame_interval_ms: u64,

    /// Chance that the lossy link drops a packet, in percent.
    #[clap(long, default_value = "5")]
    pub loss_percent: u8,

    /// How many packets the lossy link may hold back and shuffle before
    /// delivery. 0 keeps packets in order.
    #[clap(long, default_value = "0")]
    pub reorder_window: usize,

    /// Seed for the link's random number generator. Random if not given.
    #[clap(long)]
    pub seed: Option<u64>,
}

#[cfg(test)]
pub(crate) fn default_test_config() -> Config {
    Config {
        frames: 60,
        audio_frame_size: 160,
        video_frame_size: 12000,
        keyframe_interval: 30,
        frame_interval_ms: 20,
        loss_percent: 0,
        reorder_window: 0,
        seed: Some(1),
    }
}
