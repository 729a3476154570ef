//! Timer-backed cancellable promises
//!
//! There is no built-in timeout on [`CancellablePromise`]; a timeout is a
//! race between the operation and a deadline, with the loser cancelled.

use std::time::Duration;

use crate::cancellable::{race, CancellablePromise};
use crate::error::Error;
use crate::promise::Promise;
use crate::scheduler::Scheduler;

/// Fulfills once `duration` has elapsed on the scheduler's clock
///
/// Cancelling unschedules the timer.
pub fn delay(scheduler: &Scheduler, duration: Duration) -> CancellablePromise<()> {
    let (promise, resolver) = Promise::pending(scheduler);
    let id = scheduler.schedule_after(duration, move || resolver.fulfill(()));
    let sched = scheduler.clone();
    CancellablePromise::new(promise, move || sched.cancel_timer(id))
}

/// Race `promise` against a deadline
///
/// The deadline path rejects with [`Error::TimedOut`]; whichever side loses
/// is cancelled.
pub fn timeout<T>(
    scheduler: &Scheduler,
    promise: CancellablePromise<T>,
    duration: Duration,
) -> CancellablePromise<T>
where
    T: Clone + Send + 'static,
{
    let (deadline, resolver) = Promise::pending(scheduler);
    let id = scheduler.schedule_after(duration, move || resolver.reject(Error::TimedOut));
    let sched = scheduler.clone();
    let deadline = CancellablePromise::new(deadline, move || sched.cancel_timer(id));
    race(scheduler, vec![promise, deadline], true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn delay_fulfills_at_its_deadline() {
        let scheduler = Scheduler::simulated();
        let delayed = delay(&scheduler, Duration::from_millis(100));

        scheduler.run();
        assert_eq!(delayed.result(), Some(Ok(())));
        assert_eq!(scheduler.now(), Duration::from_millis(100));
    }

    #[test]
    fn cancelled_delay_unschedules_its_timer() {
        let scheduler = Scheduler::simulated();
        let delayed = delay(&scheduler, Duration::from_millis(100));

        delayed.cancel();
        scheduler.run();
        assert_eq!(delayed.result(), Some(Err(Error::Cancelled)));
        // The clock never advanced to the dead timer
        assert_eq!(scheduler.now(), Duration::ZERO);
    }

    #[test]
    fn timeout_rejects_and_aborts_a_slow_operation() {
        let scheduler = Scheduler::simulated();
        let (slow, slow_resolver) = Promise::<i32>::pending(&scheduler);
        scheduler.schedule_after(Duration::from_millis(500), move || slow_resolver.fulfill(1));

        let aborts = Arc::new(AtomicUsize::new(0));
        let count = aborts.clone();
        let guarded_slow = CancellablePromise::new(slow, move || {
            count.fetch_add(1, Ordering::SeqCst);
        });

        let bounded = timeout(&scheduler, guarded_slow, Duration::from_millis(50));
        scheduler.run();

        assert_eq!(bounded.result(), Some(Err(Error::TimedOut)));
        assert_eq!(aborts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timeout_passes_through_a_fast_operation() {
        let scheduler = Scheduler::simulated();
        let (fast, fast_resolver) = Promise::pending(&scheduler);
        scheduler.schedule_after(Duration::from_millis(10), move || fast_resolver.fulfill(7));

        let bounded = timeout(
            &scheduler,
            CancellablePromise::new(fast, || {}),
            Duration::from_millis(50),
        );
        scheduler.run();

        assert_eq!(bounded.result(), Some(Ok(7)));
        // The deadline timer was cancelled, so the clock stopped early
        assert_eq!(scheduler.now(), Duration::from_millis(10));
    }
}
