// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

/// Position format of a [`Segment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Positions are nanoseconds.
    Time,
    /// Any other format; the jitterbuffer only operates on TIME segments.
    Undefined,
}

/// The part of a playback segment needed to map stream positions to
/// running time.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub format: Format,
    /// Playback rate, non-zero.
    pub rate: f64,
    /// Start position of the segment, nanoseconds.
    pub start: u64,
    /// Stop position; `None` for an open-ended segment.
    pub stop: Option<u64>,
    /// Stream time of `start`.
    pub time: u64,
    /// Running time accumulated by previous segments.
    pub base: u64,
}

impl Default for Segment {
    /// An open TIME segment starting at 0.
    fn default() -> Segment {
        Segment {
            format: Format::Time,
            rate: 1.0,
            start: 0,
            stop: None,
            time: 0,
            base: 0,
        }
    }
}

impl Segment {
    pub fn new_time(rate: f64, start: u64, stop: Option<u64>, time: u64) -> Segment {
        Segment {
            format: Format::Time,
            rate,
            start,
            stop,
            time,
            base: 0,
        }
    }

    /// Maps a stream position to running time.
    ///
    /// Returns `None` when the position lies outside the segment, the
    /// segment is not a TIME segment or the rate is 0.
    pub fn to_running_time(&self, position: u64) -> Option<u64> {
        if self.format != Format::Time {
            return None;
        }

        if position < self.start {
            return None;
        }
        if let Some(stop) = self.stop {
            if position > stop {
                return None;
            }
        }

        let abs_rate = self.rate.abs();
        if abs_rate == 0.0 {
            return None;
        }

        let offset = position - self.start;
        let running = if abs_rate == 1.0 {
            offset
        } else {
            (offset as f64 / abs_rate) as u64
        };

        Some(running + self.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_identity() {
        let segment = Segment::default();
        assert_eq!(segment.to_running_time(0), Some(0));
        assert_eq!(segment.to_running_time(1_000_000_000), Some(1_000_000_000));
    }

    #[test]
    fn start_offsets_running_time() {
        let segment = Segment::new_time(1.0, 1_000_000, None, 0);
        assert_eq!(segment.to_running_time(1_000_000), Some(0));
        assert_eq!(segment.to_running_time(3_000_000), Some(2_000_000));
        // before the segment
        assert_eq!(segment.to_running_time(500_000), None);
    }

    #[test]
    fn stop_clips() {
        let segment = Segment::new_time(1.0, 0, Some(1_000_000), 0);
        assert_eq!(segment.to_running_time(1_000_000), Some(1_000_000));
        assert_eq!(segment.to_running_time(1_000_001), None);
    }

    #[test]
    fn rate_scales() {
        let segment = Segment::new_time(2.0, 0, None, 0);
        assert_eq!(segment.to_running_time(1_000_000), Some(500_000));
    }

    #[test]
    fn base_accumulates() {
        let mut segment = Segment::new_time(1.0, 0, None, 0);
        segment.base = 5_000;
        assert_eq!(segment.to_running_time(1_000), Some(6_000));
    }

    #[test]
    fn non_time_has_no_running_time() {
        let segment = Segment {
            format: Format::Undefined,
            ..Segment::default()
        };
        assert_eq!(segment.to_running_time(0), None);
    }
}
