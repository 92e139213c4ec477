//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

#[macro_use]
extern crate log;

use anyhow::Result;
use clap::Parser;
use env_logger::Env;
use once_cell::sync::Lazy;
use toxav::{config, loopback};

// Load the config and treat it as a read-only static value.
static CONFIG: Lazy<config::Config> = Lazy::new(config::Config::parse);

#[rustfmt::skip]
fn print_config(config: &'static config::Config) {
    info!("config:");
    info!("  {:24}{}", "frames:", config.frames);
    info!("  {:24}{}", "audio_frame_size:", config.audio_frame_size);
    info!("  {:24}{}", "video_frame_size:", config.video_frame_size);
    info!("  {:24}{}", "keyframe_interval:", config.keyframe_interval);
    info!("  {:24}{}", "frame_interval_ms:", config.frame_interval_ms);
    info!("  {:24}{}", "loss_percent:", config.loss_percent);
    info!("  {:24}{}", "reorder_window:", config.reorder_window);
    info!("  {:24}{:?}", "seed:", config.seed);
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        Env::default()
            .default_filter_or("toxav=info")
            .default_write_style_or("never"),
    )
    .format(toxav_common::format_log_line)
    .init();

    info!(
        "toxav-loopback: v{}",
        option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
    );

    let config = &CONFIG;
    print_config(config);

    let summary = loopback::run(config)?;

    info!("summary:");
    info!("  seed:                  {}", summary.seed);
    info!("  frames sent:           {} ({} send failures)", summary.frames_sent, summary.send_failures);
    info!("  audio frames received: {}", summary.audio_frames_received);
    info!(
        "  video frames received: {} ({} key, {} incomplete)",
        summary.video_frames_received,
        summary.key_frames_received,
        summary.incomplete_frames_received
    );
    info!(
        "  lossy packets a->b:    {} sent, {} dropped",
        summary.a_to_b.lossy_packets, summary.a_to_b.lossy_dropped
    );
    info!(
        "  lossy packets b->a:    {} sent, {} dropped",
        summary.b_to_a.lossy_packets, summary.b_to_a.lossy_dropped
    );
    match summary.loss_reports.last() {
        Some(loss) => info!(
            "  loss reports:          {} (last {:.1}%)",
            summary.loss_reports.len(),
            loss * 100.0
        ),
        None => info!("  loss reports:          none"),
    }

    Ok(())
}
