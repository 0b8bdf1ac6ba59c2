// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, trace, warn};
use muldiv::MulDiv;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::clock::{Clock, ClockId, ClockReturn};
use crate::event::{Caps, Event, Latency, Message};
use crate::flow::{FlowError, FlowSuccess};
use crate::packet::Packet;
use crate::queue::PacketQueue;
use crate::segment::{Format, Segment};
use crate::utils::{seqnum_distance, ExtendedTimestamp};

const DEFAULT_LATENCY_MS: u32 = 200;
const DEFAULT_DROP_ON_LATENCY: bool = false;
const DEFAULT_TS_OFFSET: i64 = 0;

const SECOND: u64 = 1_000_000_000;
const MSECOND: u64 = 1_000_000;

/// Downstream peer of the jitterbuffer, the consumer side.
///
/// Packets leave the buffer in sequence number order through [`push`],
/// serialized events through [`event`].
///
/// [`push`]: Downstream::push
/// [`event`]: Downstream::event
pub trait Downstream: Send + Sync {
    /// Hands over the next outgoing packet.
    ///
    /// An error pauses the pacing task; the error is returned to the
    /// producer on its next [`RtpJitterBuffer::push`].
    fn push(&self, packet: Packet) -> Result<FlowSuccess, FlowError>;

    /// Delivers a serialized event.
    fn event(&self, event: Event) -> bool;
}

/// Upstream peer, queried for its latency contract.
pub trait Upstream: Send + Sync {
    fn query_latency(&self) -> Option<Latency>;
}

/// Counter snapshot of the jitterbuffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Packets that arrived after their position was already passed, plus
    /// packets given up on after a gap.
    pub num_late: u64,
    /// Packets dropped because their seqnum was already queued.
    pub num_duplicates: u64,
}

#[derive(Debug, Clone)]
struct ClockConfig {
    clock: Arc<dyn Clock>,
    base_time: Duration,
}

#[derive(Debug)]
struct State {
    /// The ordered packet store.
    queue: PacketQueue,

    /// See [`RtpJitterBuffer::set_latency_ms`].
    latency_ms: u32,
    /// See [`RtpJitterBuffer::set_drop_on_latency`].
    drop_on_latency: bool,
    /// See [`RtpJitterBuffer::set_ts_offset`].
    ts_offset: i64,
    /// Offset applied to the previously pushed packet.
    prev_ts_offset: i64,

    /// The last seqnum pushed downstream.
    last_popped_seqnum: Option<u16>,
    /// The seqnum expected by the next pop.
    next_seqnum: Option<u16>,

    /// EOS was queued on the sink side.
    eos: bool,
    /// The consumer must wait regardless of queue contents (paused).
    blocked: bool,
    /// Flow state of the consumer task.
    srcresult: Result<FlowSuccess, FlowError>,

    /// Negotiated RTP clock rate.
    clock_rate: Option<u32>,
    /// Extended RTP timestamp corresponding to running time 0.
    clock_base: Option<u64>,
    /// Rolling 32 to 64-bit RTP timestamp extension.
    ext_timestamp: ExtendedTimestamp,

    /// Segment mapping stream time to running time.
    segment: Segment,

    /// Pending clock wait of the consumer and the seqnum it is timing.
    clock_wait: Option<(ClockId, u16)>,

    /// Minimum latency reported by upstream, nanoseconds. Taken into
    /// account when synchronizing.
    peer_latency: u64,

    num_late: u64,
    num_duplicates: u64,
}

impl Default for State {
    fn default() -> State {
        State {
            queue: PacketQueue::new(),
            latency_ms: DEFAULT_LATENCY_MS,
            drop_on_latency: DEFAULT_DROP_ON_LATENCY,
            ts_offset: DEFAULT_TS_OFFSET,
            prev_ts_offset: DEFAULT_TS_OFFSET,
            last_popped_seqnum: None,
            next_seqnum: None,
            eos: false,
            blocked: true,
            srcresult: Err(FlowError::Flushing),
            clock_rate: None,
            clock_base: None,
            ext_timestamp: ExtendedTimestamp::default(),
            segment: Segment::default(),
            clock_wait: None,
            peer_latency: 0,
            num_late: 0,
            num_duplicates: 0,
        }
    }
}

#[derive(Debug, Default)]
struct TaskState {
    /// The task thread exists and was not told to shut down.
    running: bool,
    /// The loop is parked until restarted.
    paused: bool,
}

type PtMapCallback = Arc<dyn Fn(u8) -> Option<Caps> + Send + Sync>;
type MessageCallback = Arc<dyn Fn(Message) + Send + Sync>;

struct Inner {
    /// The pacing state, guarded by the one coordination mutex.
    state: Mutex<State>,
    /// Wakes the consumer when packets, EOS or unblocking arrive.
    cond: Condvar,

    /// Clock provisioning. Kept apart from `state` like the original
    /// object lock; taken after `state` when both are needed.
    clock: Mutex<Option<ClockConfig>>,

    downstream: Mutex<Option<Arc<dyn Downstream>>>,
    upstream: Mutex<Option<Arc<dyn Upstream>>>,
    request_pt_map: Mutex<Option<PtMapCallback>>,
    message_handler: Mutex<Option<MessageCallback>>,

    task: Mutex<TaskState>,
    task_cond: Condvar,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

/// Buffers, reorders and removes duplicate RTP packets while compensating
/// for network jitter.
///
/// Packets come in through [`push`] on the producer side and leave through
/// the [`Downstream`] peer from a dedicated pacing task, which waits for
/// missing packets up to the configured latency and synchronizes packet
/// release against the provided [`Clock`].
///
/// The lifecycle follows the hosting pipeline: [`start`] arms the buffer
/// (packets are accepted but held), [`play`] releases the pacing task,
/// [`pause`] blocks it again and [`stop`] shuts it down. [`flush_start`] /
/// [`flush_stop`] cancel and restart the stream without tearing the
/// element down.
///
/// [`push`]: RtpJitterBuffer::push
/// [`start`]: RtpJitterBuffer::start
/// [`play`]: RtpJitterBuffer::play
/// [`pause`]: RtpJitterBuffer::pause
/// [`stop`]: RtpJitterBuffer::stop
/// [`flush_start`]: RtpJitterBuffer::flush_start
/// [`flush_stop`]: RtpJitterBuffer::flush_stop
pub struct RtpJitterBuffer {
    inner: Arc<Inner>,
}

impl Default for RtpJitterBuffer {
    fn default() -> Self {
        RtpJitterBuffer::new()
    }
}

impl RtpJitterBuffer {
    pub fn new() -> RtpJitterBuffer {
        RtpJitterBuffer {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                cond: Condvar::new(),
                clock: Mutex::new(None),
                downstream: Mutex::new(None),
                upstream: Mutex::new(None),
                request_pt_map: Mutex::new(None),
                message_handler: Mutex::new(None),
                task: Mutex::new(TaskState::default()),
                task_cond: Condvar::new(),
                thread: Mutex::new(None),
            }),
        }
    }

    /// The amount of buffering in milliseconds.
    ///
    /// Packets are kept for at most this long while waiting for missing
    /// ones; it is also this element's contribution to the pipeline
    /// latency. A change posts [`Message::LatencyChanged`] so the host can
    /// reconfigure the pipeline.
    pub fn set_latency_ms(&self, latency_ms: u32) {
        let changed = {
            let mut state = self.inner.state.lock();
            let old = state.latency_ms;
            state.latency_ms = latency_ms;
            old != latency_ms
        };

        if changed {
            debug!("latency changed to {latency_ms} ms");
            self.inner.post_message(Message::LatencyChanged);
        }
    }

    pub fn latency_ms(&self) -> u32 {
        self.inner.state.lock().latency_ms
    }

    /// Whether to evict the oldest packets instead of exceeding the
    /// configured latency in queued data.
    pub fn set_drop_on_latency(&self, drop_on_latency: bool) {
        self.inner.state.lock().drop_on_latency = drop_on_latency;
    }

    pub fn drop_on_latency(&self) -> bool {
        self.inner.state.lock().drop_on_latency
    }

    /// Offset in nanoseconds applied to outgoing RTP timestamps.
    ///
    /// A change marks the next outgoing packet as discontinuous.
    pub fn set_ts_offset(&self, ts_offset: i64) {
        self.inner.state.lock().ts_offset = ts_offset;
    }

    pub fn ts_offset(&self) -> i64 {
        self.inner.state.lock().ts_offset
    }

    pub fn stats(&self) -> Stats {
        let state = self.inner.state.lock();
        Stats {
            num_late: state.num_late,
            num_duplicates: state.num_duplicates,
        }
    }

    /// Provides the clock packet release synchronizes against, together
    /// with the pipeline base time. Without a clock packets are pushed as
    /// fast as the downstream peer accepts them.
    pub fn set_clock(&self, clock: Option<Arc<dyn Clock>>, base_time: Duration) {
        *self.inner.clock.lock() = clock.map(|clock| ClockConfig { clock, base_time });
    }

    pub fn set_downstream(&self, downstream: Option<Arc<dyn Downstream>>) {
        *self.inner.downstream.lock() = downstream;
    }

    pub fn set_upstream(&self, upstream: Option<Arc<dyn Upstream>>) {
        *self.inner.upstream.lock() = upstream;
    }

    /// Installs the callback resolving a payload type to caps when a
    /// packet arrives while no clock rate is known.
    pub fn connect_request_pt_map<F>(&self, callback: F)
    where
        F: Fn(u8) -> Option<Caps> + Send + Sync + 'static,
    {
        *self.inner.request_pt_map.lock() = Some(Arc::new(callback));
    }

    /// Invalidates the clock rate, forcing a new pt-map request on the
    /// next packet.
    pub fn clear_pt_map(&self) {
        self.inner.state.lock().clock_rate = None;
    }

    /// Installs the handler for best-effort host notifications.
    pub fn connect_message<F>(&self, callback: F)
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        *self.inner.message_handler.lock() = Some(Arc::new(callback));
    }

    /// Configures the stream from its caps.
    ///
    /// `clock-rate` is required and must be at least 1; `clock-base` and
    /// `seqnum-base` are picked up when present. The caps are mirrored to
    /// the downstream peer on success.
    pub fn set_caps(&self, caps: &Caps) -> bool {
        if !self.parse_caps(caps) {
            return false;
        }

        self.inner.push_event(Event::Caps(caps.clone()));
        true
    }

    fn parse_caps(&self, caps: &Caps) -> bool {
        let Some(clock_rate) = caps.clock_rate else {
            debug!("no clock-rate in caps");
            return false;
        };
        if clock_rate < 1 {
            debug!("invalid clock-rate {clock_rate}");
            return false;
        }

        let mut state = self.inner.state.lock();
        state.clock_rate = Some(clock_rate);
        // without a clock-base the first timestamp on the source side
        // becomes the base
        state.clock_base = caps.clock_base.map(u64::from);
        // first expected seqnum
        state.next_seqnum = caps.seqnum_base.map(|seqnum| seqnum as u16);

        debug!(
            "got clock-rate {clock_rate}, clock-base {:?}, seqnum-base {:?}",
            state.clock_base, state.next_seqnum
        );

        true
    }

    fn request_clock_rate(&self, pt: u8) {
        let callback = self.inner.request_pt_map.lock().clone();
        let Some(callback) = callback else {
            debug!("no pt-map callback to resolve pt {pt}");
            return;
        };

        match callback(pt) {
            Some(caps) => {
                self.parse_caps(&caps);
            }
            None => debug!("could not get caps for pt {pt}"),
        }
    }

    /// Installs the segment used to bring RTP-derived timestamps to
    /// running time. Only TIME segments are accepted; the segment is
    /// forwarded downstream.
    pub fn new_segment(&self, segment: Segment) -> bool {
        if segment.format != Format::Time {
            debug!("received non-TIME segment, rejecting");
            return false;
        }

        debug!("segment: {segment:?}");
        self.inner.state.lock().segment = segment.clone();

        self.inner.push_event(Event::Segment(segment))
    }

    /// Queues EOS: the consumer drains the queue, delivers EOS downstream
    /// and pauses. Returns `false` when the event is discarded because the
    /// element is flushing. A second EOS is ignored.
    pub fn eos(&self) -> bool {
        let mut state = self.inner.state.lock();

        let ret = state.srcresult.is_ok();
        if ret && !state.eos {
            debug!("queuing EOS");
            state.eos = true;
            self.inner.cond.notify_all();
        } else if state.eos {
            debug!("dropping EOS, we are already EOS");
        } else {
            debug!("dropping EOS, reason {:?}", state.srcresult);
        }

        ret
    }

    /// Cancels all waits and empties the queue; pushes fail with
    /// [`FlowError::Flushing`] until [`flush_stop`].
    ///
    /// [`flush_stop`]: RtpJitterBuffer::flush_stop
    pub fn flush_start(&self) {
        self.inner.flush_start();
        self.inner.push_event(Event::FlushStart);
    }

    /// Ends a flush: resets the stream state and restarts the pacing
    /// task.
    pub fn flush_stop(&self) {
        self.inner.push_event(Event::FlushStop);

        {
            let mut state = self.inner.state.lock();
            debug!("enabling pop on queue");
            state.srcresult = Ok(FlowSuccess::Ok);
            state.segment = Segment::default();
            state.last_popped_seqnum = None;
            state.next_seqnum = None;
            state.clock_rate = None;
            state.eos = false;
            state.ext_timestamp = ExtendedTimestamp::default();
        }

        self.start_task();
    }

    /// Arms the buffer: resets the stream state and starts the pacing
    /// task in blocked posture. Corresponds to going from READY to
    /// PAUSED in the hosting pipeline.
    pub fn start(&self) {
        {
            let mut state = self.inner.state.lock();
            state.queue.flush();
            state.last_popped_seqnum = None;
            state.next_seqnum = None;
            state.eos = false;
            // block until play()
            state.blocked = true;
            state.srcresult = Ok(FlowSuccess::Ok);
            state.clock_rate = None;
            state.clock_base = None;
            state.ext_timestamp = ExtendedTimestamp::default();
            state.segment = Segment::default();
            state.peer_latency = 0;
        }

        self.start_task();
    }

    /// Unblocks the pacing task. Corresponds to going from PAUSED to
    /// PLAYING.
    pub fn play(&self) {
        let mut state = self.inner.state.lock();
        state.blocked = false;
        self.inner.cond.notify_all();
    }

    /// Blocks the pacing task again. Corresponds to going from PLAYING to
    /// PAUSED.
    pub fn pause(&self) {
        let mut state = self.inner.state.lock();
        state.blocked = true;
    }

    /// Shuts the pacing task down and drops all queued packets. Also run
    /// on drop.
    pub fn stop(&self) {
        self.inner.flush_start();

        {
            let mut task = self.inner.task.lock();
            task.running = false;
            task.paused = false;
            self.inner.task_cond.notify_all();
        }

        let handle = self.inner.thread.lock().take();
        if let Some(handle) = handle {
            // joining from the task itself would deadlock
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Accepts one RTP packet from the producer.
    ///
    /// The packet is validated, inserted into the queue in sequence
    /// number order and picked up by the pacing task. Late packets and
    /// duplicates are counted and dropped silently; see [`FlowError`] for
    /// the failure modes.
    pub fn push(&self, data: Vec<u8>) -> Result<FlowSuccess, FlowError> {
        let packet = match Packet::parse(data) {
            Ok(packet) => packet,
            Err(err) => {
                // fatal, this should have been filtered out earlier
                error!("received invalid RTP packet: {err:?}");
                self.inner
                    .post_message(Message::Error(format!("invalid RTP packet: {err:?}")));
                return Err(FlowError::Error);
            }
        };

        // no clock rate from the caps, try to get one with the pt-map
        // callback
        if self.inner.state.lock().clock_rate.is_none() {
            self.request_clock_rate(packet.payload_type());
        }

        let seqnum = packet.seqnum();
        debug!("received packet #{seqnum}");

        let mut state = self.inner.state.lock();
        state.srcresult?;

        let Some(clock_rate) = state.clock_rate else {
            warn!("no clock-rate for pt {}", packet.payload_type());
            return Err(FlowError::NotNegotiated);
        };

        // don't accept more data on EOS
        if state.eos {
            warn!("refusing packet #{seqnum}, we are EOS");
            return Err(FlowError::Eos);
        }

        // a seqnum at or before the last one pushed out comes too late
        if let Some(last_popped) = state.last_popped_seqnum {
            if seqnum_distance(last_popped, seqnum) <= 0 {
                warn!("packet #{seqnum} too late, #{last_popped} was already pushed");
                state.num_late += 1;
                return Ok(FlowSuccess::Ok);
            }
        }

        // with drop-on-latency, the oldest packets make room once the
        // queue spans more than the configured latency. Without it the
        // queue is unbounded and the consumer paces it down.
        if state.latency_ms > 0 && state.drop_on_latency {
            let latency_ts = u64::from(state.latency_ms)
                .mul_div_floor(u64::from(clock_rate), 1000)
                .unwrap_or(u64::MAX);

            while state.queue.num_packets() >= 2 && u64::from(state.queue.ts_span()) >= latency_ts
            {
                if let Some(old) = state.queue.pop() {
                    warn!("queue full, dropping old packet #{}", old.seqnum());
                }
            }
        }

        // insert in sorted order; a packet with the same seqnum already
        // queued means we have a duplicate
        if state.queue.insert(packet).is_err() {
            warn!("duplicate packet #{seqnum} detected, dropping");
            state.num_duplicates += 1;
            return Ok(FlowSuccess::Ok);
        }

        // signal the new packet
        self.inner.cond.notify_all();

        // unblock a consumer timing a later packet; it will retry with
        // the new head, which may be this packet
        if let Some((id, waiting_seqnum)) = &state.clock_wait {
            if seqnum_distance(seqnum, *waiting_seqnum) > 0 {
                debug!("unscheduling wait for #{waiting_seqnum}");
                id.unschedule();
            }
        }

        trace!("queued #{seqnum}, now {} packets", state.queue.num_packets());
        Ok(FlowSuccess::Ok)
    }

    fn start_task(&self) {
        let mut task = self.inner.task.lock();
        task.paused = false;

        if !task.running {
            task.running = true;

            let inner = self.inner.clone();
            let thread = thread::Builder::new()
                .name("rtpjitterbuffer-src".into())
                .spawn(move || inner.task_loop());

            match thread {
                Ok(handle) => *self.inner.thread.lock() = Some(handle),
                Err(err) => {
                    error!("failed to start pacing task: {err}");
                    task.running = false;
                    self.inner.state.lock().srcresult = Err(FlowError::Error);
                }
            }
        }

        self.inner.task_cond.notify_all();
    }

    /// Answers a latency query by aggregating the upstream peer's
    /// contract with our own latency. The peer's minimum is remembered
    /// and taken into account when synchronizing packet release.
    pub fn query_latency(&self) -> Option<Latency> {
        let upstream = self.inner.upstream.lock().clone()?;
        let peer = upstream.query_latency()?;

        debug!("peer latency: min {}, max {:?}", peer.min, peer.max);

        let our_latency = {
            let mut state = self.inner.state.lock();
            // store this so that we can safely sync on the peer buffers
            state.peer_latency = peer.min;
            u64::from(state.latency_ms) * MSECOND
        };

        let min = peer.min + our_latency;
        let max = peer.max.map(|max| max + our_latency);

        debug!("calculated total latency: min {min}, max {max:?}");

        Some(Latency {
            live: true,
            min,
            max,
        })
    }
}

impl Drop for RtpJitterBuffer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn post_message(&self, message: Message) {
        let handler = self.message_handler.lock().clone();
        if let Some(handler) = handler {
            handler(message);
        }
    }

    fn push_event(&self, event: Event) -> bool {
        let downstream = self.downstream.lock().clone();
        match downstream {
            Some(downstream) => downstream.event(event),
            None => {
                debug!("no downstream peer, dropping {event:?}");
                false
            }
        }
    }

    fn flush_start(&self) {
        let mut state = self.state.lock();
        // mark ourselves as flushing
        state.srcresult = Err(FlowError::Flushing);
        debug!("disabling pop on queue");
        // this unblocks any waiting pop
        self.cond.notify_all();
        state.queue.flush();
        // only unschedule the clock, the entry is dropped by the pacing
        // task when its wait returns
        if let Some((id, _)) = &state.clock_wait {
            id.unschedule();
        }
    }

    fn pause_task(&self) {
        let mut task = self.task.lock();
        task.paused = true;
    }

    fn task_loop(self: Arc<Inner>) {
        loop {
            {
                let mut task = self.task.lock();
                while task.running && task.paused {
                    self.task_cond.wait(&mut task);
                }
                if !task.running {
                    break;
                }
            }

            self.src_loop();
        }

        debug!("pacing task stopping");
    }

    fn src_loop(&self) {
        let Err(err) = self.src_loop_inner() else {
            return;
        };

        match err {
            FlowError::Flushing => debug!("we are flushing"),
            FlowError::Eos => debug!("we are EOS"),
            err => {
                // store the error; we don't post anything because
                // upstream observes it through the next push
                let mut state = self.state.lock();
                state.srcresult = Err(err);
                debug!("pausing task, reason {err}");
            }
        }

        self.pause_task();
    }

    /// One iteration of the pacing task.
    ///
    /// Pops the packet with the lowest seqnum and waits for the missing
    /// packets before it up to its own deadline, then pushes it
    /// downstream.
    fn src_loop_inner(&self) -> Result<(), FlowError> {
        let mut state = self.state.lock();
        state.srcresult?;

        'again: loop {
            // wait for a packet, EOS or getting unblocked
            loop {
                if !state.blocked {
                    if !state.queue.is_empty() {
                        break;
                    }
                    if state.eos {
                        // queue drained, time to let downstream know
                        debug!("we are EOS, pushing EOS downstream");
                        state.srcresult = Err(FlowError::Eos);
                        drop(state);
                        self.push_event(Event::Eos);
                        return Err(FlowError::Eos);
                    }
                }
                self.cond.wait(&mut state);
                // re-check shutdown on every wakeup
                state.srcresult?;
            }

            // the queue was checked non-empty above
            let mut outbuf = state.queue.pop().unwrap();
            let seqnum = outbuf.seqnum();
            let rtp_time = outbuf.rtp_ts();
            let ext_time = state.ext_timestamp.next(rtp_time);

            trace!(
                "popped #{seqnum}, rtptime {rtp_time}, exttime {ext_time}, {} left",
                state.queue.num_packets()
            );

            // When this is not the expected seqnum, an earlier packet may
            // still arrive and would have to go first: wait for it until
            // this packet's own deadline expires. The same applies when
            // the expected seqnum is not known yet.
            if state.next_seqnum != Some(seqnum) {
                match state.next_seqnum {
                    Some(next) => warn!("gap detected, expected #{next} but popped #{seqnum}"),
                    None => debug!("first packet #{seqnum}, do sync"),
                }

                // if no clock-base was given, take the first timestamp
                // as base
                let clock_base = *state.clock_base.get_or_insert(ext_time);
                // the timestamp offset can wrap around
                let adjusted = ext_time.wrapping_sub(clock_base);

                let running_time = state
                    .clock_rate
                    .and_then(|rate| adjusted.mul_div_floor(SECOND, u64::from(rate)))
                    .and_then(|ns| state.segment.to_running_time(ns));

                let clock_cfg = self.clock.lock().clone();

                // without a clock, or with a position the segment cannot
                // bring to running time, just push immediately
                if let (Some(ClockConfig { clock, base_time }), Some(running_time)) =
                    (clock_cfg, running_time)
                {
                    // our own latency and the peer latency delay the
                    // deadline
                    let deadline =
                        running_time + u64::from(state.latency_ms) * MSECOND + state.peer_latency;
                    let target = base_time + Duration::from_nanos(deadline);

                    trace!("sync #{seqnum} to running time {deadline}");

                    let id = clock.new_single_shot_id(target);
                    state.clock_wait = Some((id.clone(), seqnum));

                    // release the lock so that the producer can insert
                    // packets or unschedule us
                    let ret = MutexGuard::unlocked(&mut state, || clock.wait(&id));

                    state.clock_wait = None;

                    // the wait ended on the timeout, on an unschedule
                    // from the push path or on shutdown; check shutdown
                    // first
                    state.srcresult?;

                    if ret == ClockReturn::Unscheduled {
                        // a better candidate arrived, put this packet
                        // back and pick the new head
                        debug!("wait for #{seqnum} got unscheduled, retrying");
                        if state.queue.insert(outbuf).is_err() {
                            debug!("duplicate packet #{seqnum} on reinsert, dropping");
                            state.num_duplicates += 1;
                        }
                        continue 'again;
                    }
                }
            }

            // check whether we are pushing something unexpected
            if let Some(next) = state.next_seqnum {
                if next != seqnum {
                    // number of packets we gave up on, careful with
                    // wraparounds
                    let dropped = seqnum_distance(next, seqnum);
                    warn!("pushing discont, dropped {dropped} (#{next} to #{seqnum})");

                    if dropped > 0 {
                        state.num_late += dropped as u64;
                    }
                    outbuf.set_discont();
                }
            }

            // apply the timestamp offset
            let off_rtp = match state.clock_rate {
                Some(clock_rate) => ts_offset_rtp(state.ts_offset, clock_rate),
                None => 0,
            };

            if off_rtp != 0 {
                // a changed offset breaks continuity for downstream
                if state.ts_offset != state.prev_ts_offset {
                    debug!("changing ts offset to {off_rtp} ticks");
                    outbuf.set_discont();
                    state.prev_ts_offset = state.ts_offset;
                }

                outbuf.apply_ts_offset(off_rtp);
            }

            // save the seqnum and release the lock so the other end can
            // push into the queue again
            state.last_popped_seqnum = Some(seqnum);
            state.next_seqnum = Some(seqnum.wrapping_add(1));
            drop(state);

            debug!("pushing packet #{seqnum}");
            let downstream = self.downstream.lock().clone();
            let Some(downstream) = downstream else {
                return Err(FlowError::NotLinked);
            };
            downstream.push(outbuf)?;

            return Ok(());
        }
    }
}

/// Converts a nanosecond timestamp offset to RTP clock-rate ticks.
fn ts_offset_rtp(offset_ns: i64, clock_rate: u32) -> i32 {
    let ticks = offset_ns
        .unsigned_abs()
        .mul_div_floor(u64::from(clock_rate), SECOND)
        .unwrap_or(0);
    let ticks = i64::try_from(ticks).unwrap_or(i64::MAX);

    (if offset_ns < 0 { -ticks } else { ticks }) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtp_types::RtpPacketBuilder;
    use std::sync::mpsc;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

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

    struct NullSink;

    impl Downstream for NullSink {
        fn push(&self, _packet: Packet) -> Result<FlowSuccess, FlowError> {
            Ok(FlowSuccess::Ok)
        }

        fn event(&self, _event: Event) -> bool {
            true
        }
    }

    struct StubUpstream(Latency);

    impl Upstream for StubUpstream {
        fn query_latency(&self) -> Option<Latency> {
            Some(self.0)
        }
    }

    #[test]
    fn push_before_start_is_flushing() {
        init();
        let jb = RtpJitterBuffer::new();

        assert_eq!(
            jb.push(generate_rtp_packet(0, 0)),
            Err(FlowError::Flushing)
        );
    }

    #[test]
    fn push_invalid_rtp_is_fatal() {
        init();
        let jb = RtpJitterBuffer::new();
        jb.set_downstream(Some(Arc::new(NullSink)));
        jb.start();
        assert!(jb.set_caps(&Caps::new(8000)));

        let messages = Arc::new(Mutex::new(Vec::new()));
        let collected = messages.clone();
        jb.connect_message(move |message| collected.lock().push(message));

        assert_eq!(jb.push(vec![0x00; 4]), Err(FlowError::Error));
        assert!(matches!(messages.lock().as_slice(), [Message::Error(_)]));

        jb.stop();
    }

    #[test]
    fn push_without_clock_rate_is_not_negotiated() {
        init();
        let jb = RtpJitterBuffer::new();
        jb.set_downstream(Some(Arc::new(NullSink)));
        jb.start();

        assert_eq!(
            jb.push(generate_rtp_packet(0, 0)),
            Err(FlowError::NotNegotiated)
        );

        jb.stop();
    }

    #[test]
    fn pt_map_resolves_clock_rate() {
        init();
        let jb = RtpJitterBuffer::new();
        jb.set_downstream(Some(Arc::new(NullSink)));
        jb.start();

        let (sender, receiver) = mpsc::channel();
        jb.connect_request_pt_map(move |pt| {
            sender.send(pt).unwrap();
            Some(Caps::new(8000))
        });

        assert_eq!(jb.push(generate_rtp_packet(0, 0)), Ok(FlowSuccess::Ok));
        assert_eq!(receiver.try_recv(), Ok(96));

        // the resolved rate sticks, no further request
        assert_eq!(jb.push(generate_rtp_packet(1, 160)), Ok(FlowSuccess::Ok));
        assert!(receiver.try_recv().is_err());

        jb.stop();
    }

    #[test]
    fn clear_pt_map_forces_new_request() {
        init();
        let jb = RtpJitterBuffer::new();
        jb.set_downstream(Some(Arc::new(NullSink)));
        jb.start();
        assert!(jb.set_caps(&Caps::new(8000)));

        assert_eq!(jb.push(generate_rtp_packet(0, 0)), Ok(FlowSuccess::Ok));

        jb.clear_pt_map();
        assert_eq!(
            jb.push(generate_rtp_packet(1, 160)),
            Err(FlowError::NotNegotiated)
        );

        jb.stop();
    }

    #[test]
    fn eos_refuses_further_pushes() {
        init();
        let jb = RtpJitterBuffer::new();
        jb.set_downstream(Some(Arc::new(NullSink)));
        jb.start();
        assert!(jb.set_caps(&Caps::new(8000)));

        assert_eq!(jb.push(generate_rtp_packet(0, 0)), Ok(FlowSuccess::Ok));
        assert!(jb.eos());
        // second EOS is ignored but reported as handled
        assert!(jb.eos());

        assert_eq!(jb.push(generate_rtp_packet(1, 160)), Err(FlowError::Eos));

        jb.stop();
    }

    #[test]
    fn eos_while_flushing_is_discarded() {
        init();
        let jb = RtpJitterBuffer::new();
        // never started, so we are flushing
        assert!(!jb.eos());
    }

    #[test]
    fn caps_require_valid_clock_rate() {
        init();
        let jb = RtpJitterBuffer::new();

        assert!(!jb.set_caps(&Caps::default()));
        assert!(!jb.set_caps(&Caps::new(0)));
        assert!(jb.set_caps(&Caps::new(90000)));
    }

    #[test]
    fn non_time_segment_is_rejected() {
        init();
        let jb = RtpJitterBuffer::new();

        let segment = Segment {
            format: Format::Undefined,
            ..Segment::default()
        };
        assert!(!jb.new_segment(segment));
    }

    #[test]
    fn latency_change_posts_message() {
        init();
        let jb = RtpJitterBuffer::new();

        let messages = Arc::new(Mutex::new(Vec::new()));
        let collected = messages.clone();
        jb.connect_message(move |message| collected.lock().push(message));

        assert_eq!(jb.latency_ms(), DEFAULT_LATENCY_MS);
        jb.set_latency_ms(DEFAULT_LATENCY_MS);
        assert!(messages.lock().is_empty());

        jb.set_latency_ms(100);
        assert_eq!(jb.latency_ms(), 100);
        assert_eq!(*messages.lock(), vec![Message::LatencyChanged]);
    }

    #[test]
    fn latency_query_aggregates_peer() {
        init();
        let jb = RtpJitterBuffer::new();
        jb.set_latency_ms(200);

        assert_eq!(jb.query_latency(), None);

        jb.set_upstream(Some(Arc::new(StubUpstream(Latency {
            live: true,
            min: 10 * MSECOND,
            max: Some(50 * MSECOND),
        }))));

        let latency = jb.query_latency().unwrap();
        assert!(latency.live);
        assert_eq!(latency.min, 210 * MSECOND);
        assert_eq!(latency.max, Some(250 * MSECOND));

        // unbounded peers stay unbounded
        jb.set_upstream(Some(Arc::new(StubUpstream(Latency {
            live: true,
            min: 0,
            max: None,
        }))));
        assert_eq!(jb.query_latency().unwrap().max, None);
    }

    #[test]
    fn ts_offset_rtp_conversion() {
        // 1 second at 8kHz
        assert_eq!(ts_offset_rtp(1_000_000_000, 8000), 8000);
        assert_eq!(ts_offset_rtp(-1_000_000_000, 8000), -8000);
        // one tick is 125us
        assert_eq!(ts_offset_rtp(125_000, 8000), 1);
        assert_eq!(ts_offset_rtp(0, 8000), 0);
        // sub-tick offsets round down
        assert_eq!(ts_offset_rtp(124_999, 8000), 0);
    }
}
