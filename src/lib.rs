// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Reordering and pacing buffer for live RTP streams.
//!
//! [`RtpJitterBuffer`] sits between a network RTP source and a downstream
//! consumer. It reorders packets that arrive out of sequence, drops
//! duplicates and waits for missing packets up to the configured latency
//! before continuing without them. Packets are released on a schedule
//! derived from their RTP timestamps and the provided [`Clock`], which is
//! what makes the buffer absorb network jitter: it acts as a live stage
//! that adds `latency` to the pipeline.
//!
//! The clock rate of the payload must be known in order to time packet
//! release. It is taken from the caps on the sink side or, when no caps
//! were provided, requested through the `request-pt-map` callback the
//! first time a packet with an unmapped payload type arrives.
//!
//! ```no_run
//! use std::sync::{mpsc, Arc, Mutex};
//! use std::time::Duration;
//!
//! use rtp_jitterbuffer::{
//!     Caps, Downstream, Event, FlowError, FlowSuccess, Packet, RtpJitterBuffer, SystemClock,
//! };
//!
//! struct Sink(Mutex<mpsc::Sender<Packet>>);
//!
//! impl Downstream for Sink {
//!     fn push(&self, packet: Packet) -> Result<FlowSuccess, FlowError> {
//!         let sender = self.0.lock().unwrap();
//!         sender.send(packet).map_err(|_| FlowError::Error)?;
//!         Ok(FlowSuccess::Ok)
//!     }
//!
//!     fn event(&self, _event: Event) -> bool {
//!         true
//!     }
//! }
//!
//! let (sender, receiver) = mpsc::channel();
//!
//! let jb = RtpJitterBuffer::new();
//! jb.set_latency_ms(20);
//! jb.set_downstream(Some(Arc::new(Sink(Mutex::new(sender)))));
//! jb.set_clock(Some(Arc::new(SystemClock::new())), Duration::ZERO);
//!
//! jb.start();
//! assert!(jb.set_caps(&Caps::new(8000)));
//! jb.play();
//!
//! // rtp_data: one RTP packet received from the network
//! # let rtp_data = vec![0x80, 96, 0, 100, 0, 0, 0, 0, 0, 0, 0, 1];
//! jb.push(rtp_data).unwrap();
//! let packet = receiver.recv_timeout(Duration::from_secs(2)).unwrap();
//! assert_eq!(packet.seqnum(), 100);
//!
//! jb.stop();
//! ```

mod clock;
mod event;
mod flow;
mod jitterbuffer;
mod packet;
mod queue;
mod segment;
mod utils;

pub use clock::{Clock, ClockId, ClockReturn, SystemClock, TestClock};
pub use event::{Caps, Event, Latency, Message};
pub use flow::{FlowError, FlowReturn, FlowSuccess};
pub use jitterbuffer::{Downstream, RtpJitterBuffer, Stats, Upstream};
pub use packet::Packet;
pub use queue::PacketQueue;
pub use segment::{Format, Segment};
pub use utils::{seqnum_distance, ExtendedTimestamp};
