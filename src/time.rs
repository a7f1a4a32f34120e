use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::scheduler::{Scheduler, TaskQueue};
use crate::units::{TimeDelta, Timestamp};

/// Offset between the unix and NTP epochs, in milliseconds.
const NTP_EPOCH_OFFSET_MS: i64 = 2_208_988_800_000;

/// Granularity used by [`TimeController::wait_until`] when polling a
/// predicate.
const WAIT_POLL_STEP: TimeDelta = TimeDelta::from_micros(5_000);

/// Source of monotonic time. Implementations are interchangeable between
/// real and simulated time so the whole core can run under a virtual clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;

    fn now_ntp_ms(&self) -> i64 {
        self.now().millis() + NTP_EPOCH_OFFSET_MS
    }
}

/// A clock that only moves when told to.
///
/// Shared freely between queues; reads and writes go through an atomic so a
/// reader on another queue never observes a torn value.
#[derive(Debug)]
pub struct SimulatedClock {
    now_us: AtomicI64,
}

impl SimulatedClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now_us: AtomicI64::new(start.micros()),
        }
    }

    pub fn advance(&self, delta: TimeDelta) {
        debug_assert!(delta >= TimeDelta::zero());
        self.now_us.fetch_add(delta.micros(), Ordering::Release);
    }

    /// Jumps directly to `deadline`. Going backwards is a logic error.
    pub fn advance_to(&self, deadline: Timestamp) {
        let target = deadline.micros();
        let prev = self.now_us.swap(target, Ordering::Release);
        debug_assert!(prev <= target, "simulated clock moved backwards");
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_micros(self.now_us.load(Ordering::Acquire))
    }
}

/// Wall-clock backed implementation used outside of tests.
#[derive(Debug)]
pub struct RealTimeClock {
    epoch: Instant,
}

impl RealTimeClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for RealTimeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for RealTimeClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_micros(self.epoch.elapsed().as_micros() as i64)
    }
}

/// Drives a [`SimulatedClock`] and the task queues hanging off it.
///
/// `sleep` is the only place where simulated time passes during a test: it
/// advances the clock from one task deadline to the next, executing each due
/// task, until the requested amount of time has been consumed.
pub struct TimeController {
    clock: Arc<SimulatedClock>,
    scheduler: Scheduler,
}

impl TimeController {
    pub fn new(start: Timestamp) -> Self {
        Self {
            clock: Arc::new(SimulatedClock::new(start)),
            scheduler: Scheduler::new(),
        }
    }

    pub fn clock(&self) -> Arc<SimulatedClock> {
        Arc::clone(&self.clock)
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Creates a serial task queue executing in this controller's time domain.
    pub fn task_queue(&self, name: &str) -> TaskQueue {
        self.scheduler.queue(name)
    }

    /// Moves the clock without executing anything. Meant for tests that need
    /// a time gap with no side effects.
    pub fn advance(&self, delta: TimeDelta) {
        self.clock.advance(delta);
    }

    /// Lets `delta` of simulated time pass, executing every task that comes
    /// due along the way in deadline order.
    pub fn sleep(&self, delta: TimeDelta) {
        let target = self.clock.now() + delta;
        loop {
            match self.scheduler.next_deadline() {
                Some(deadline) if deadline <= target => {
                    if deadline > self.clock.now() {
                        self.clock.advance_to(deadline);
                    }
                    self.scheduler.run_one_due(self.clock.now());
                }
                _ => break,
            }
        }
        if target > self.clock.now() {
            self.clock.advance_to(target);
        }
    }

    /// Sleeps in fixed 5 ms steps until `predicate` returns true or `max`
    /// simulated time has passed. Returns whether the predicate was met.
    pub fn wait_until(&self, max: TimeDelta, mut predicate: impl FnMut() -> bool) -> bool {
        let deadline = self.clock.now() + max;
        while !predicate() {
            if self.clock.now() >= deadline {
                return false;
            }
            self.sleep(WAIT_POLL_STEP.min(deadline - self.clock.now()));
        }
        true
    }
}
