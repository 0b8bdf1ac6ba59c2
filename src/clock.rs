// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Result of waiting on a [`ClockId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockReturn {
    /// The target time was reached.
    Ok,
    /// The target time had already passed when the wait started.
    Early,
    /// The wait was cancelled with [`ClockId::unschedule`].
    Unscheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Pending,
    Fired,
    Unscheduled,
}

#[derive(Debug)]
struct ClockEntry {
    target: Duration,
    state: Mutex<EntryState>,
    cond: Condvar,
}

/// Handle for a pending single-shot clock wait.
///
/// Cloning yields another handle to the same wait, so one thread can
/// block in [`Clock::wait`] while another unschedules it.
#[derive(Debug, Clone)]
pub struct ClockId(Arc<ClockEntry>);

impl ClockId {
    fn new(target: Duration) -> ClockId {
        ClockId(Arc::new(ClockEntry {
            target,
            state: Mutex::new(EntryState::Pending),
            cond: Condvar::new(),
        }))
    }

    /// The absolute clock time this id fires at.
    pub fn target(&self) -> Duration {
        self.0.target
    }

    /// Cancels the wait without blocking.
    ///
    /// A concurrent or later [`Clock::wait`] on this id returns
    /// [`ClockReturn::Unscheduled`].
    pub fn unschedule(&self) {
        let mut state = self.0.state.lock();
        *state = EntryState::Unscheduled;
        self.0.cond.notify_all();
    }

    fn is_unscheduled(&self) -> bool {
        *self.0.state.lock() == EntryState::Unscheduled
    }

    fn fire(&self) {
        let mut state = self.0.state.lock();
        if *state == EntryState::Pending {
            *state = EntryState::Fired;
        }
        self.0.cond.notify_all();
    }
}

/// The wait primitive the pacing engine synchronizes packet release
/// against.
///
/// Targets are absolute clock times, normally `base_time + running_time`
/// of the packet to release.
pub trait Clock: Send + Sync + fmt::Debug {
    /// The current time of the clock.
    fn time(&self) -> Duration;

    /// Creates an id that fires once at `target`.
    fn new_single_shot_id(&self, target: Duration) -> ClockId;

    /// Blocks until the target of `id` is reached or the id is
    /// unscheduled.
    fn wait(&self, id: &ClockId) -> ClockReturn;
}

/// Monotonic system clock, anchored at its creation time.
#[derive(Debug)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> SystemClock {
        SystemClock {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        SystemClock::new()
    }
}

impl Clock for SystemClock {
    fn time(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn new_single_shot_id(&self, target: Duration) -> ClockId {
        ClockId::new(target)
    }

    fn wait(&self, id: &ClockId) -> ClockReturn {
        let deadline = self.epoch + id.target();

        let mut state = id.0.state.lock();
        if *state == EntryState::Unscheduled {
            return ClockReturn::Unscheduled;
        }
        if Instant::now() >= deadline {
            return ClockReturn::Early;
        }

        loop {
            if id.0.cond.wait_until(&mut state, deadline).timed_out() {
                return ClockReturn::Ok;
            }
            if *state == EntryState::Unscheduled {
                return ClockReturn::Unscheduled;
            }
            // spurious wakeup, keep waiting
        }
    }
}

/// Manually driven clock for tests.
///
/// Waits block until the clock is advanced past their target with
/// [`TestClock::set_time`] or unscheduled. The helpers let a test
/// synchronize with a thread that is about to wait.
#[derive(Debug, Default)]
pub struct TestClock {
    inner: Mutex<TestClockInner>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct TestClockInner {
    time: Duration,
    pending: Vec<ClockId>,
}

impl TestClock {
    pub fn new() -> TestClock {
        TestClock::default()
    }

    /// Moves the clock to `time`, waking every wait whose target is
    /// reached. The clock never moves backwards.
    pub fn set_time(&self, time: Duration) {
        let mut inner = self.inner.lock();
        assert!(time >= inner.time, "test clock cannot go backwards");
        inner.time = time;

        let mut fired = vec![];
        inner.pending.retain(|id| {
            if id.target() <= time {
                fired.push(id.clone());
                false
            } else {
                true
            }
        });
        for id in fired {
            id.fire();
        }

        self.cond.notify_all();
    }

    /// Advances the clock by `delta`.
    pub fn advance(&self, delta: Duration) {
        let time = self.inner.lock().time + delta;
        self.set_time(time);
    }

    /// Target of the earliest pending wait, if any.
    pub fn next_pending_target(&self) -> Option<Duration> {
        self.inner.lock().pending.iter().map(ClockId::target).min()
    }

    /// Blocks the calling thread until some other thread has a wait
    /// pending, and returns its id.
    pub fn wait_for_pending_id(&self) -> ClockId {
        let mut inner = self.inner.lock();
        loop {
            if let Some(id) = inner.pending.first() {
                return id.clone();
            }
            self.cond.wait(&mut inner);
        }
    }

    fn remove_pending(&self, id: &ClockId) {
        self.inner
            .lock()
            .pending
            .retain(|pending| !Arc::ptr_eq(&pending.0, &id.0));
    }
}

impl Clock for TestClock {
    fn time(&self) -> Duration {
        self.inner.lock().time
    }

    fn new_single_shot_id(&self, target: Duration) -> ClockId {
        ClockId::new(target)
    }

    fn wait(&self, id: &ClockId) -> ClockReturn {
        {
            let mut inner = self.inner.lock();
            if id.is_unscheduled() {
                return ClockReturn::Unscheduled;
            }
            if inner.time >= id.target() {
                return ClockReturn::Early;
            }
            inner.pending.push(id.clone());
            self.cond.notify_all();
        }

        let ret = {
            let mut state = id.0.state.lock();
            loop {
                match *state {
                    EntryState::Unscheduled => break ClockReturn::Unscheduled,
                    EntryState::Fired => break ClockReturn::Ok,
                    EntryState::Pending => id.0.cond.wait(&mut state),
                }
            }
        };

        self.remove_pending(id);
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn system_clock_reaches_target() {
        let clock = SystemClock::new();
        let id = clock.new_single_shot_id(clock.time() + Duration::from_millis(20));

        assert_eq!(clock.wait(&id), ClockReturn::Ok);
        assert!(clock.time() >= id.target());
    }

    #[test]
    fn system_clock_early() {
        let clock = SystemClock::new();
        let id = clock.new_single_shot_id(Duration::ZERO);

        assert_eq!(clock.wait(&id), ClockReturn::Early);
    }

    #[test]
    fn system_clock_unschedule() {
        let clock = Arc::new(SystemClock::new());
        let id = clock.new_single_shot_id(clock.time() + Duration::from_secs(60));

        let unscheduler = {
            let id = id.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                id.unschedule();
            })
        };

        assert_eq!(clock.wait(&id), ClockReturn::Unscheduled);
        unscheduler.join().unwrap();
    }

    #[test]
    fn test_clock_fires_on_set_time() {
        let clock = Arc::new(TestClock::new());
        let id = clock.new_single_shot_id(Duration::from_millis(100));

        let waiter = {
            let clock = clock.clone();
            let id = id.clone();
            thread::spawn(move || clock.wait(&id))
        };

        let pending = clock.wait_for_pending_id();
        assert_eq!(pending.target(), Duration::from_millis(100));
        assert_eq!(clock.next_pending_target(), Some(Duration::from_millis(100)));

        clock.set_time(Duration::from_millis(100));
        assert_eq!(waiter.join().unwrap(), ClockReturn::Ok);
    }

    #[test]
    fn test_clock_early_when_past() {
        let clock = TestClock::new();
        clock.set_time(Duration::from_millis(200));

        let id = clock.new_single_shot_id(Duration::from_millis(100));
        assert_eq!(clock.wait(&id), ClockReturn::Early);
    }

    #[test]
    fn test_clock_unschedule() {
        let clock = Arc::new(TestClock::new());
        let id = clock.new_single_shot_id(Duration::from_secs(10));

        let waiter = {
            let clock = clock.clone();
            let id = id.clone();
            thread::spawn(move || clock.wait(&id))
        };

        let pending = clock.wait_for_pending_id();
        pending.unschedule();

        assert_eq!(waiter.join().unwrap(), ClockReturn::Unscheduled);
        assert_eq!(clock.next_pending_target(), None);
    }
}
