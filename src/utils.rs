// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

/// Computes the distance from `from` to `to` on the circular 16-bit
/// sequence number line.
///
/// Returns `to - from` while the two are less than half the range apart;
/// a larger difference means one of them wrapped and `from - to` is
/// returned instead. The result is negative when `to` sorts before `from`.
///
/// See <http://en.wikipedia.org/wiki/Serial_number_arithmetic>.
pub fn seqnum_distance(from: u16, to: u16) -> i32 {
    let (from, to) = (i32::from(from), i32::from(to));

    // a difference of more than half the range means the pair wrapped
    if (to - from).abs() > (1 << 15) {
        from - to
    } else {
        to - from
    }
}

/// Extends 32-bit RTP timestamps to a monotonic 64-bit timeline.
///
/// The first timestamp becomes the base of the extension; each following
/// timestamp moves the extended time by its signed 32-bit distance from
/// the previous one. Inputs whose successive deltas stay below 2^31 yield
/// a strictly monotonic extension across 32-bit wraps.
#[derive(Debug, Default)]
pub struct ExtendedTimestamp {
    ext: Option<u64>,
}

impl ExtendedTimestamp {
    /// Feeds the next RTP timestamp and returns its extended form.
    pub fn next(&mut self, rtp_ts: u32) -> u64 {
        let ext = match self.ext {
            None => u64::from(rtp_ts),
            Some(ext) => {
                let diff = rtp_ts.wrapping_sub(ext as u32) as i32;
                ext.wrapping_add_signed(i64::from(diff))
            }
        };

        self.ext = Some(ext);
        ext
    }
}
