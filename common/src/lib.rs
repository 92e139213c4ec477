//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Helpers shared by the RTP, bandwidth and MSI layers.

mod bytes_reader;
mod serialize;
mod time;

use std::io::Write;

pub use bytes_reader::*;
pub use serialize::*;
pub use time::*;

/// Log line format used by every binary in the workspace:
/// `<timestamp> <level> <target>: <message>`.
pub fn format_log_line(
    buf: &mut env_logger::fmt::Formatter,
    record: &log::Record,
) -> std::io::Result<()> {
    writeln!(
        buf,
        "{} {:<5} {}: {}",
        buf.timestamp_millis(),
        record.level(),
        record.target(),
        record.args()
    )
}
