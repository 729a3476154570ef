//! Serialized callback scheduling
//!
//! All settlement callbacks in this crate run on one logical execution
//! context: a FIFO queue of jobs drained by a single caller of [`Scheduler::run`]
//! or [`Scheduler::tick`]. The scheduler never spawns threads; it only
//! sequences callbacks. Delayed jobs are kept in a deadline-ordered heap and
//! can be unscheduled by [`TimerId`] before they fire.
//!
//! Two clocks are supported: `Scheduler::new()` measures wall time and parks
//! the driving thread until the next deadline, while `Scheduler::simulated()`
//! advances a virtual clock straight to the next deadline whenever the ready
//! queue drains, which makes timing-dependent tests deterministic.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send>;

/// Identifies a delayed job so it can be cancelled before it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// A cloneable handle to a serialized job queue
pub struct Scheduler {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    ready: VecDeque<Job>,
    timers: BinaryHeap<TimerEntry>,
    // A heap entry fires only while its id is in here; cancellation removes
    // the id, so bookkeeping is bounded by the timers still in the heap.
    live: HashSet<TimerId>,
    clock: Clock,
    next_timer: u64,
}

enum Clock {
    Wall(Instant),
    Simulated(Duration),
}

struct TimerEntry {
    deadline: Duration,
    id: TimerId,
    job: Job,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Inverted so the earliest deadline sits on top of the max-heap;
        // identifiers break ties in scheduling order.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.0.cmp(&self.id.0))
    }
}

impl Inner {
    fn elapsed(&self) -> Duration {
        match self.clock {
            Clock::Wall(start) => start.elapsed(),
            Clock::Simulated(now) => now,
        }
    }
}

impl Scheduler {
    /// Create a scheduler that measures wall time
    pub fn new() -> Self {
        Self::with_clock(Clock::Wall(Instant::now()))
    }

    /// Create a scheduler with a virtual clock for deterministic tests
    pub fn simulated() -> Self {
        Self::with_clock(Clock::Simulated(Duration::ZERO))
    }

    fn with_clock(clock: Clock) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                ready: VecDeque::new(),
                timers: BinaryHeap::new(),
                live: HashSet::new(),
                clock,
                next_timer: 1,
            })),
        }
    }

    /// Elapsed time since the scheduler was created
    pub fn now(&self) -> Duration {
        self.inner.lock().unwrap().elapsed()
    }

    /// Enqueue a job to run on the next turn
    pub fn schedule(&self, job: impl FnOnce() + Send + 'static) {
        tracing::trace!("job scheduled");
        self.inner.lock().unwrap().ready.push_back(Box::new(job));
    }

    /// Enqueue a job to run once `delay` has elapsed
    ///
    /// Returns a [`TimerId`] that can be used to cancel the job before it
    /// fires.
    pub fn schedule_after(&self, delay: Duration, job: impl FnOnce() + Send + 'static) -> TimerId {
        let mut inner = self.inner.lock().unwrap();
        let id = TimerId(inner.next_timer);
        inner.next_timer += 1;
        let deadline = inner.elapsed() + delay;
        tracing::trace!(?id, ?deadline, "timer scheduled");
        inner.live.insert(id);
        inner.timers.push(TimerEntry {
            deadline,
            id,
            job: Box::new(job),
        });
        id
    }

    /// Unschedule a delayed job; a no-op if it has already fired
    pub fn cancel_timer(&self, id: TimerId) {
        tracing::trace!(?id, "timer cancelled");
        self.inner.lock().unwrap().live.remove(&id);
    }

    /// Run every job that is currently due
    ///
    /// Jobs enqueued while ticking run in the same call. Returns whether any
    /// job ran.
    pub fn tick(&self) -> bool {
        let mut progress = false;
        loop {
            let job = {
                let mut inner = self.inner.lock().unwrap();
                let now = inner.elapsed();
                while inner.timers.peek().map_or(false, |entry| entry.deadline <= now) {
                    if let Some(entry) = inner.timers.pop() {
                        if inner.live.remove(&entry.id) {
                            inner.ready.push_back(entry.job);
                        }
                    }
                }
                inner.ready.pop_front()
            };
            match job {
                Some(job) => {
                    job();
                    progress = true;
                }
                None => break,
            }
        }
        progress
    }

    /// Drive ticks until no jobs and no timers remain
    ///
    /// Between ticks the clock advances to the next deadline: a wall-clock
    /// scheduler parks the thread until then, a simulated one jumps straight
    /// to it.
    pub fn run(&self) {
        enum Idle {
            Done,
            Advanced,
            Wait(Duration),
        }

        loop {
            self.tick();
            let idle = {
                let mut inner = self.inner.lock().unwrap();
                if !inner.ready.is_empty() {
                    continue;
                }
                // Discard cancelled timers parked at the front so they do
                // not keep the loop alive.
                loop {
                    let stale = match inner.timers.peek() {
                        Some(entry) => !inner.live.contains(&entry.id),
                        None => break,
                    };
                    if !stale {
                        break;
                    }
                    inner.timers.pop();
                }
                match inner.timers.peek() {
                    None => Idle::Done,
                    Some(entry) => {
                        let deadline = entry.deadline;
                        match &mut inner.clock {
                            Clock::Simulated(now) => {
                                *now = deadline.max(*now);
                                Idle::Advanced
                            }
                            Clock::Wall(start) => {
                                let elapsed = start.elapsed();
                                if deadline <= elapsed {
                                    Idle::Advanced
                                } else {
                                    Idle::Wait(deadline - elapsed)
                                }
                            }
                        }
                    }
                }
            };
            match idle {
                Idle::Done => break,
                Idle::Advanced => {}
                Idle::Wait(remaining) => std::thread::park_timeout(remaining),
            }
        }
    }

    #[cfg(test)]
    fn tracked_timers(&self) -> usize {
        self.inner.lock().unwrap().live.len()
    }
}

impl Clone for Scheduler {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn jobs_run_in_fifo_order() {
        let scheduler = Scheduler::simulated();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            scheduler.schedule(move || order.lock().unwrap().push(i));
        }

        assert!(scheduler.tick());
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn jobs_scheduled_while_ticking_run_in_the_same_tick() {
        let scheduler = Scheduler::simulated();
        let count = Arc::new(AtomicUsize::new(0));

        let inner_count = count.clone();
        let inner_scheduler = scheduler.clone();
        scheduler.schedule(move || {
            inner_scheduler.schedule(move || {
                inner_count.fetch_add(1, Ordering::SeqCst);
            });
        });

        scheduler.tick();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tick_without_work_reports_no_progress() {
        let scheduler = Scheduler::simulated();
        assert!(!scheduler.tick());
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let scheduler = Scheduler::simulated();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, ms) in [("late", 30u64), ("early", 10), ("middle", 20)] {
            let order = order.clone();
            scheduler.schedule_after(Duration::from_millis(ms), move || {
                order.lock().unwrap().push(label);
            });
        }

        scheduler.run();
        assert_eq!(*order.lock().unwrap(), vec!["early", "middle", "late"]);
    }

    #[test]
    fn simulated_clock_advances_to_deadlines() {
        let scheduler = Scheduler::simulated();
        assert_eq!(scheduler.now(), Duration::ZERO);

        let observed = Arc::new(Mutex::new(Duration::ZERO));
        let probe = observed.clone();
        let probe_scheduler = scheduler.clone();
        scheduler.schedule_after(Duration::from_millis(250), move || {
            *probe.lock().unwrap() = probe_scheduler.now();
        });

        scheduler.run();
        assert_eq!(*observed.lock().unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let scheduler = Scheduler::simulated();
        let fired = Arc::new(AtomicUsize::new(0));

        let flag = fired.clone();
        let id = scheduler.schedule_after(Duration::from_millis(10), move || {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.cancel_timer(id);

        scheduler.run();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancelling_a_fired_timer_is_a_no_op() {
        let scheduler = Scheduler::simulated();
        let fired = Arc::new(AtomicUsize::new(0));

        let flag = fired.clone();
        let id = scheduler.schedule_after(Duration::from_millis(5), move || {
            flag.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.run();
        scheduler.cancel_timer(id);
        scheduler.run();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancellation_keeps_no_record_of_fired_or_dead_timers() {
        let scheduler = Scheduler::simulated();

        let fired = scheduler.schedule_after(Duration::from_millis(5), || {});
        scheduler.run();
        scheduler.cancel_timer(fired);
        assert_eq!(scheduler.tracked_timers(), 0);

        let dead = scheduler.schedule_after(Duration::from_millis(5), || {});
        scheduler.cancel_timer(dead);
        assert_eq!(scheduler.tracked_timers(), 0);
        scheduler.run();
        assert_eq!(scheduler.tracked_timers(), 0);
    }
}
