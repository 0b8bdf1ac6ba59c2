// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use rtp_types::{RtpPacket, RtpParseError};

/// A validated RTP packet travelling through the jitterbuffer.
///
/// Owns the wire bytes and carries the parsed header fields the buffer
/// needs for reordering, together with the discontinuity marker that is
/// handed to the downstream peer.
#[derive(Debug)]
pub struct Packet {
    data: Vec<u8>,
    seqnum: u16,
    rtp_ts: u32,
    pt: u8,
    discont: bool,
}

impl Packet {
    /// Validates `data` as an RTP packet and takes ownership of it.
    pub fn parse(data: Vec<u8>) -> Result<Packet, RtpParseError> {
        let rtp = RtpPacket::parse(&data)?;
        let seqnum = rtp.sequence_number();
        let rtp_ts = rtp.timestamp();
        let pt = rtp.payload_type();

        Ok(Packet {
            data,
            seqnum,
            rtp_ts,
            pt,
            discont: false,
        })
    }

    /// The RTP sequence number.
    pub fn seqnum(&self) -> u16 {
        self.seqnum
    }

    /// The RTP timestamp, in clock-rate ticks.
    pub fn rtp_ts(&self) -> u32 {
        self.rtp_ts
    }

    /// The RTP payload type.
    pub fn payload_type(&self) -> u8 {
        self.pt
    }

    /// Whether this packet is not continuous with the previous one
    /// delivered downstream.
    pub fn is_discont(&self) -> bool {
        self.discont
    }

    pub(crate) fn set_discont(&mut self) {
        self.discont = true;
    }

    /// Shifts the RTP timestamp by `off_rtp` ticks, modulo 2^32.
    ///
    /// The timestamp field of the wire bytes is rewritten as well.
    pub(crate) fn apply_ts_offset(&mut self, off_rtp: i32) {
        self.rtp_ts = self.rtp_ts.wrapping_add_signed(off_rtp);
        // the timestamp sits at bytes 4..8 of the fixed RTP header
        self.data[4..8].copy_from_slice(&self.rtp_ts.to_be_bytes());
    }

    /// The full packet as received, including the header.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the packet and returns the wire bytes.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtp_types::RtpPacketBuilder;

    fn generate_rtp_packet(seq_no: u16, rtp_ts: u32) -> Vec<u8> {
        let mut rtp_data = [0; 128];
        let payload = vec![1; 16];
        let len = RtpPacketBuilder::new()
            .payload_type(96)
            .ssrc(0x12345678)
            .sequence_number(seq_no)
            .timestamp(rtp_ts)
            .payload(payload.as_slice())
            .write_into(&mut rtp_data)
            .unwrap();
        rtp_data[..len].to_vec()
    }

    #[test]
    fn parse_valid() {
        let data = generate_rtp_packet(533, 98765);
        let packet = Packet::parse(data).unwrap();

        assert_eq!(packet.seqnum(), 533);
        assert_eq!(packet.rtp_ts(), 98765);
        assert_eq!(packet.payload_type(), 96);
        assert!(!packet.is_discont());
    }

    #[test]
    fn parse_invalid() {
        // too short to be an RTP packet
        assert!(Packet::parse(vec![0x80, 0x60, 0x00]).is_err());
        // wrong version
        assert!(Packet::parse(vec![0x00; 16]).is_err());
    }

    #[test]
    fn ts_offset_updates_wire_bytes() {
        let data = generate_rtp_packet(1, 1000);
        let mut packet = Packet::parse(data).unwrap();

        packet.apply_ts_offset(160);
        assert_eq!(packet.rtp_ts(), 1160);

        let reparsed = RtpPacket::parse(packet.data()).unwrap();
        assert_eq!(reparsed.timestamp(), 1160);
    }

    #[test]
    fn ts_offset_negative_wraps() {
        let data = generate_rtp_packet(1, 100);
        let mut packet = Packet::parse(data).unwrap();

        packet.apply_ts_offset(-200);
        assert_eq!(packet.rtp_ts(), u32::MAX - 99);

        let reparsed = RtpPacket::parse(packet.data()).unwrap();
        assert_eq!(reparsed.timestamp(), u32::MAX - 99);
    }
}
