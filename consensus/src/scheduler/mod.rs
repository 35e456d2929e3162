// Cycle scheduler
//
// Arms one timer per `schedule` call against an absolute deadline. Fired
// timers are delivered as `TimerEvent`s on the engine's timer channel.
// Every call gets its own `TimerHandle`; rescheduling the same phase never
// replaces an earlier timer, only `cancel` does.

pub mod clock;

pub use clock::Clock;

use crate::cycle::Quarter;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tracing::{debug, trace};

/// Identifies one scheduled timer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

impl fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Delivered when a timer fires
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerEvent {
    pub handle: TimerHandle,
    pub phase: Quarter,
    /// Cycle the phase belongs to
    pub cycle: u64,
}

/// How late a deadline may be and still run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lateness {
    Unlimited,
    Within(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// Deadline already passed within tolerance; event sent now
    Immediate(TimerHandle),
    /// Timer armed
    Armed(TimerHandle),
    /// Deadline passed beyond tolerance, or scheduler shut down
    Skipped,
}

pub struct Scheduler {
    clock: Clock,
    events: mpsc::UnboundedSender<TimerEvent>,
    timers: HashMap<TimerHandle, JoinHandle<()>>,
    next_handle: u64,
    shut_down: bool,
}

impl Scheduler {
    pub fn new(clock: Clock, events: mpsc::UnboundedSender<TimerEvent>) -> Self {
        Self {
            clock,
            events,
            timers: HashMap::new(),
            next_handle: 0,
            shut_down: false,
        }
    }

    fn allocate(&mut self) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    /// Run `phase` of `cycle` at `deadline_ms`
    pub fn schedule(&mut self, phase: Quarter, cycle: u64, deadline_ms: u64, lateness: Lateness) -> ScheduleOutcome {
        if self.shut_down {
            return ScheduleOutcome::Skipped;
        }

        let now = self.clock.now_ms();
        if deadline_ms <= now {
            let late_by = now - deadline_ms;
            let tolerated = match lateness {
                Lateness::Unlimited => true,
                Lateness::Within(limit) => late_by <= limit,
            };
            if !tolerated {
                debug!(%phase, cycle, late_by, "deadline missed, skipping");
                return ScheduleOutcome::Skipped;
            }

            let handle = self.allocate();
            trace!(%phase, cycle, late_by, %handle, "running immediately");
            if self.events.send(TimerEvent { handle, phase, cycle }).is_err() {
                return ScheduleOutcome::Skipped;
            }
            return ScheduleOutcome::Immediate(handle);
        }

        let handle = self.allocate();
        let at = self.clock.instant_at(deadline_ms);
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            sleep_until(at).await;
            let _ = events.send(TimerEvent { handle, phase, cycle });
        });
        trace!(%phase, cycle, deadline_ms, %handle, "timer armed");
        self.timers.insert(handle, task);
        ScheduleOutcome::Armed(handle)
    }

    /// Forget a timer whose event has been handled
    pub fn fired(&mut self, handle: TimerHandle) {
        self.timers.remove(&handle);
    }

    /// Cancel one pending timer; false if it already fired or never existed
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.timers.remove(&handle) {
            Some(task) => {
                let finished = task.is_finished();
                task.abort();
                !finished
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, task) in self.timers.drain() {
            task.abort();
        }
    }

    /// Cancel everything and refuse further scheduling
    pub fn shutdown(&mut self) {
        self.cancel_all();
        self.shut_down = true;
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn pending(&self) -> usize {
        self.timers.values().filter(|t| !t.is_finished()).count()
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
