// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use crate::segment::Segment;

/// The RTP caps fields the jitterbuffer consumes from the sink side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caps {
    /// RTP clock rate in Hz. Required, must be at least 1.
    pub clock_rate: Option<u32>,
    /// RTP timestamp that corresponds to running time 0. Without it the
    /// first timestamp seen on the source side is used as the base.
    pub clock_base: Option<u32>,
    /// First sequence number expected from upstream.
    pub seqnum_base: Option<u32>,
}

impl Caps {
    pub fn new(clock_rate: u32) -> Caps {
        Caps {
            clock_rate: Some(clock_rate),
            ..Caps::default()
        }
    }
}

/// Serialized events forwarded to the downstream peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Caps(Caps),
    Segment(Segment),
    FlushStart,
    FlushStop,
    Eos,
}

/// Result of a latency query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Latency {
    /// Whether the stream is live.
    pub live: bool,
    /// Minimum latency in nanoseconds.
    pub min: u64,
    /// Maximum latency in nanoseconds; `None` means no upper limit.
    pub max: Option<u64>,
}

/// Best-effort notifications for the hosting application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// The configured latency changed; the pipeline latency should be
    /// reconfigured.
    LatencyChanged,
    /// A fatal stream error, e.g. undecodable RTP input.
    Error(String),
}
