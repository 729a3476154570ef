//! Cancellation-aware promises
//!
//! The primitive promise has no notion of cancellation, so this module
//! synthesizes one: every [`CancellablePromise`] owns an internal trip-wire
//! (a `Promise<()>` and its resolver) and observes a *guarded* view of the
//! underlying work that settles with the real outcome unless the trip-wire
//! rejects first.
//!
//! [`CancellablePromise::cancel`] is idempotent. On the first call it flips
//! the cancelled flag, propagates to children registered by [`CancellablePromise::then`],
//! and, if the wrapper is still pending, invokes the caller-supplied abort
//! callback and schedules rejection of the trip-wire one turn later.
//! The deferral is load-bearing: continuations that were already queued when
//! `cancel()` ran observe the original settlement, and only continuations
//! arriving afterwards see [`Error::Cancelled`].
//!
//! Cancellation is request-only for the underlying work. The abort callback
//! is advisory; if the work ignores it, the wrapper still rejects with the
//! cancelled kind while the real resource finishes in the background.

use std::sync::{Arc, Mutex, Weak};

use crate::error::Error;
use crate::promise::{Promise, Resolver, Settled, State};
use crate::scheduler::Scheduler;

/// Best-effort request to stop in-flight work; invoked at most once
pub type AbortFn = Box<dyn FnOnce() + Send>;

/// A promise that can be cancelled
///
/// Intended to be owned by a single orchestrating caller; combinators and
/// parents hold cloneable [`CancelHandle`]s instead.
pub struct CancellablePromise<T> {
    promise: Promise<T>,
    guard: Arc<CancelGuard>,
}

/// A cancel-only handle to a [`CancellablePromise`]
///
/// Keeps the cancel machinery alive without owning the value, so a stale
/// handle held after settlement can still call [`CancelHandle::cancel`] and
/// have it no-op.
#[derive(Clone)]
pub struct CancelHandle {
    guard: Arc<CancelGuard>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.guard.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.guard.is_cancelled()
    }
}

struct CancelGuard {
    state: Mutex<GuardState>,
    token: Resolver<()>,
    scheduler: Scheduler,
}

struct GuardState {
    cancelled: bool,
    abort: Option<AbortFn>,
    subsequent: Vec<Weak<CancelGuard>>,
    // Must not own the promise: waiters registered on the promise hold this
    // guard, and a strong edge back would cycle.
    still_pending: Box<dyn Fn() -> bool + Send>,
}

impl CancelGuard {
    fn cancel(&self) {
        let (subsequent, abort, pending) = {
            let mut state = self.state.lock().unwrap();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            let pending = (state.still_pending)();
            let abort = if pending { state.abort.take() } else { None };
            (std::mem::take(&mut state.subsequent), abort, pending)
        };

        // Children created by `then` are cancelled even when this promise
        // already settled; the propagation edge is non-owning.
        for child in subsequent {
            if let Some(child) = child.upgrade() {
                child.cancel();
            }
        }

        let token = self.token.clone();
        if pending {
            tracing::debug!("cancelling pending promise");
            if let Some(abort) = abort {
                abort();
            }
            // Let already scheduled continuations run before the rejection
            // becomes observable.
            self.scheduler.schedule(move || token.reject(Error::Cancelled));
        } else {
            // The original settlement stands, but the trip-wire must still be
            // released.
            self.scheduler.schedule(move || token.fulfill(()));
        }
    }

    fn is_cancelled(&self) -> bool {
        self.state.lock().unwrap().cancelled
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        // Release a still-pending trip-wire so nothing waits on it forever.
        let token = self.token.clone();
        self.scheduler.schedule(move || token.fulfill(()));
    }
}

/// A view of `promise` that settles with its outcome unless `cancel_signal`
/// rejects first
pub(crate) fn guarded<T>(promise: &Promise<T>, cancel_signal: &Promise<()>) -> Promise<T>
where
    T: Clone + Send + 'static,
{
    let (out, resolver) = Promise::pending(promise.scheduler());
    let forward = resolver.clone();
    promise.pipe(move |settled| forward.resolve(settled));
    // The signal waiter must not own the guarded view: the guard reaches the
    // signal through its token, and waiters on the view may hold the guard.
    let resolver = resolver.downgrade();
    cancel_signal.pipe(move |settled| {
        if let Err(error) = settled {
            if let Some(resolver) = resolver.upgrade() {
                resolver.reject(error);
            }
        }
    });
    out
}

impl<T> CancellablePromise<T> {
    /// Request cancellation
    ///
    /// Idempotent. Fires the abort callback at most once, and only if the
    /// promise is still pending; a promise that already settled keeps its
    /// outcome.
    pub fn cancel(&self) {
        self.guard.cancel();
    }

    /// True once [`CancellablePromise::cancel`] has been called; never reverts
    pub fn is_cancelled(&self) -> bool {
        self.guard.is_cancelled()
    }

    /// A cancel-only handle, safe to hold past settlement
    pub fn handle(&self) -> CancelHandle {
        CancelHandle {
            guard: Arc::clone(&self.guard),
        }
    }

    pub fn state(&self) -> State {
        self.promise.state()
    }

    /// True while neither fulfilled, rejected, nor cancelled-and-settled
    pub fn is_pending(&self) -> bool {
        self.promise.is_pending()
    }

    /// The underlying observation handle
    pub fn as_promise(&self) -> Promise<T> {
        self.promise.clone()
    }
}

impl<T: Clone + Send + 'static> CancellablePromise<T> {
    fn init<F>(scheduler: &Scheduler, body: F, abort: AbortFn) -> Self
    where
        F: FnOnce(Promise<()>) -> Promise<T>,
    {
        let (cancel_signal, token) = Promise::pending(scheduler);
        let underlying = body(cancel_signal.clone());
        let promise = guarded(&underlying, &cancel_signal);
        let guard = Arc::new(CancelGuard {
            state: Mutex::new(GuardState {
                cancelled: false,
                abort: Some(abort),
                subsequent: Vec::new(),
                still_pending: Box::new(promise.pending_probe()),
            }),
            token,
            scheduler: scheduler.clone(),
        });
        CancellablePromise { promise, guard }
    }

    /// Wrap an existing promise with an abort callback
    pub fn new(promise: Promise<T>, abort: impl FnOnce() + Send + 'static) -> Self {
        let scheduler = promise.scheduler().clone();
        Self::init(&scheduler, move |_| promise, Box::new(abort))
    }

    /// Construct from a resolver-style body
    ///
    /// The body receives the settle handle and returns the abort callback.
    /// A synchronous `Err` becomes an immediate rejection and the abort
    /// callback is a no-op, since no work started.
    pub fn from_resolver<F>(scheduler: &Scheduler, body: F) -> Self
    where
        F: FnOnce(Resolver<T>) -> Result<AbortFn, Error>,
    {
        let (promise, resolver) = Promise::pending(scheduler);
        let abort = match body(resolver.clone()) {
            Ok(abort) => abort,
            Err(error) => {
                resolver.reject(error);
                Box::new(|| {})
            }
        };
        Self::init(scheduler, move |_| promise, abort)
    }

    /// Construct from a body that races internally against the cancellation
    /// signal
    ///
    /// The signal is a `Promise<()>` that rejects with [`Error::Cancelled`]
    /// when the promise is cancelled and fulfills benignly when it is
    /// released. The abort callback is a no-op.
    pub fn from_signal<F>(scheduler: &Scheduler, body: F) -> Self
    where
        F: FnOnce(Promise<()>) -> Promise<T>,
    {
        Self::init(scheduler, body, Box::new(|| {}))
    }

    /// The settlement, if no longer pending
    ///
    /// A cancelled promise settles as `Err(Error::Cancelled)`.
    pub fn result(&self) -> Option<Settled<T>> {
        self.promise.result()
    }

    /// Register a callback to receive the settlement
    pub fn pipe(&self, callback: impl FnOnce(Settled<T>) + Send + 'static) {
        self.promise.pipe(callback);
    }

    /// Register a callback for the rejection, if any
    ///
    /// Handlers should test [`Error::is_cancelled`] and stay silent on
    /// cancellation.
    pub fn catch<F>(&self, handler: F)
    where
        F: FnOnce(Error) + Send + 'static,
    {
        self.promise.catch(handler);
    }

    /// A cancellable promise for the transformed value
    ///
    /// The transform has no independent cancellation; cancelling the result
    /// cancels this promise.
    pub fn map<U, F>(&self, transform: F) -> CancellablePromise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let handle = self.handle();
        CancellablePromise::new(self.promise.map(transform), move || handle.cancel())
    }

    /// Sequence a second cancellable operation after this one fulfills
    ///
    /// Cancelling the result cancels this promise. If this promise was
    /// already cancelled by the time `body` produces the child, the child is
    /// cancelled immediately; otherwise the child is registered so a later
    /// cancellation propagates to it. The returned promise owns the child's
    /// cancel machinery; the registration in this promise is non-owning.
    pub fn then<U, F>(&self, body: F) -> CancellablePromise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> CancellablePromise<U> + Send + 'static,
    {
        let parent = Arc::downgrade(&self.guard);
        let slot: Arc<Mutex<Option<Arc<CancelGuard>>>> = Arc::new(Mutex::new(None));
        let filled = Arc::clone(&slot);
        let chained = self.promise.then(move |value| {
            let child = body(value);
            *filled.lock().unwrap() = Some(Arc::clone(&child.guard));
            // An unreachable parent guard means no handle is left that could
            // ever cancel the chain; the child runs unregistered.
            if let Some(parent) = parent.upgrade() {
                let cancelled = {
                    let mut state = parent.state.lock().unwrap();
                    if !state.cancelled {
                        state.subsequent.push(Arc::downgrade(&child.guard));
                    }
                    state.cancelled
                };
                if cancelled {
                    child.cancel();
                }
            }
            child.as_promise()
        });
        let handle = self.handle();
        CancellablePromise::new(chained, move || {
            handle.cancel();
            // The slot keeps the child guard alive for propagation until the
            // chain is cancelled or dropped.
            drop(slot);
        })
    }
}

/// Cancel every promise in the list
pub fn cancel_all<T>(promises: &[CancellablePromise<T>]) {
    for each in promises {
        each.cancel();
    }
}

// Shared shape of the gathering combinators. The composite owns the inputs'
// cancel machinery through a slot with two release paths: the gathered result
// settling, and the composite's own signal firing (cancelled or dropped).
// Whichever runs first takes the guards, so a composite that goes away always
// lets the inputs' guards go with it.
fn composite<T, U>(
    scheduler: &Scheduler,
    promises: Vec<CancellablePromise<T>>,
    auto_cancel: bool,
    combine: impl FnOnce(&Scheduler, Vec<Promise<T>>) -> Promise<U> + Send + 'static,
) -> CancellablePromise<U>
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
{
    let views: Vec<Promise<T>> = promises.iter().map(|p| p.as_promise()).collect();
    let guards: Arc<Mutex<Vec<Arc<CancelGuard>>>> = Arc::new(Mutex::new(
        promises.into_iter().map(|p| p.guard).collect(),
    ));
    let sched = scheduler.clone();
    CancellablePromise::from_signal(scheduler, move |cancel_signal| {
        let on_signal = Arc::clone(&guards);
        cancel_signal.pipe(move |settled| {
            let taken = std::mem::take(&mut *on_signal.lock().unwrap());
            if auto_cancel && settled.is_err() {
                for guard in &taken {
                    guard.cancel();
                }
            }
        });
        let raw = combine(&sched, views);
        guarded(&raw, &cancel_signal).ensure(move || {
            let taken = std::mem::take(&mut *guards.lock().unwrap());
            if auto_cancel {
                for guard in &taken {
                    guard.cancel();
                }
            }
        })
    })
}

/// Settle with the first input that settles; cancellable as a unit
///
/// `auto_cancel` cancels the remaining inputs once one settles or once the
/// composite itself is cancelled.
pub fn race<T>(
    scheduler: &Scheduler,
    promises: Vec<CancellablePromise<T>>,
    auto_cancel: bool,
) -> CancellablePromise<T>
where
    T: Clone + Send + 'static,
{
    composite(scheduler, promises, auto_cancel, |sched, views| {
        Promise::race(sched, views)
    })
}

/// Wait for every input to fulfill; cancellable as a unit
///
/// Rejects as soon as any input rejects. `auto_cancel` cancels the remaining
/// inputs on early rejection or on cancellation of the composite.
pub fn all<T>(
    scheduler: &Scheduler,
    promises: Vec<CancellablePromise<T>>,
    auto_cancel: bool,
) -> CancellablePromise<Vec<T>>
where
    T: Clone + Send + 'static,
{
    composite(scheduler, promises, auto_cancel, |sched, views| {
        Promise::all(sched, views)
    })
}

/// Wait for every input to settle, collecting each outcome; cancellable as a
/// unit
///
/// Never rejects on account of individual failures. `auto_cancel` cancels the
/// remaining inputs when the composite is cancelled.
pub fn all_settled<T>(
    scheduler: &Scheduler,
    promises: Vec<CancellablePromise<T>>,
    auto_cancel: bool,
) -> CancellablePromise<Vec<Settled<T>>>
where
    T: Clone + Send + 'static,
{
    composite(scheduler, promises, auto_cancel, |sched, views| {
        Promise::all_settled(sched, views)
    })
}

/// Lifts plain promises into cancellable ones
pub trait PromiseExt<T> {
    /// Wrap with a no-op abort: cancelling stops observation of the result,
    /// not the underlying work.
    fn as_cancellable(&self) -> CancellablePromise<T>;
}

impl<T: Clone + Send + 'static> PromiseExt<T> for Promise<T> {
    fn as_cancellable(&self) -> CancellablePromise<T> {
        let promise = self.clone();
        CancellablePromise::from_signal(self.scheduler(), move |_| promise)
    }
}
