// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::VecDeque;

use crate::packet::Packet;
use crate::utils::seqnum_distance;

/// Packet store ordered by RTP sequence number.
///
/// Packets are kept sorted under circular 16-bit comparison with the
/// lowest sequence number at the head. Insertion scans from the tail
/// since arrivals are mostly in order already; the queue length is
/// bounded by latency × packet rate in practice.
#[derive(Debug, Default)]
pub struct PacketQueue {
    packets: VecDeque<Packet>,
}

impl PacketQueue {
    pub fn new() -> PacketQueue {
        PacketQueue::default()
    }

    /// Inserts `packet` in sequence number order.
    ///
    /// Returns the packet back when one with the same sequence number is
    /// already queued.
    pub fn insert(&mut self, packet: Packet) -> Result<(), Packet> {
        let seqnum = packet.seqnum();

        let mut idx = 0;
        for (i, queued) in self.packets.iter().enumerate().rev() {
            let distance = seqnum_distance(queued.seqnum(), seqnum);
            if distance == 0 {
                return Err(packet);
            }
            if distance > 0 {
                // the new packet sorts after this one
                idx = i + 1;
                break;
            }
        }

        self.packets.insert(idx, packet);
        Ok(())
    }

    /// Removes and returns the packet with the lowest sequence number.
    pub fn pop(&mut self) -> Option<Packet> {
        self.packets.pop_front()
    }

    /// The packet with the lowest sequence number, without removing it.
    pub fn peek(&self) -> Option<&Packet> {
        self.packets.front()
    }

    pub fn num_packets(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// RTP timestamp distance between the newest and the oldest queued
    /// packet, modulo 2^32. 0 unless at least two packets are queued.
    pub fn ts_span(&self) -> u32 {
        match (self.packets.front(), self.packets.back()) {
            (Some(head), Some(tail)) if self.packets.len() >= 2 => {
                tail.rtp_ts().wrapping_sub(head.rtp_ts())
            }
            _ => 0,
        }
    }

    /// Drops all queued packets.
    pub fn flush(&mut self) {
        self.packets.clear();
    }
}
