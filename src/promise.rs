//! The single-resolution promise primitive
//!
//! A [`Promise`] is pending until its [`Resolver`] settles it exactly once,
//! either fulfilled with a value or rejected with an [`Error`]. Observation
//! callbacks registered with [`Promise::pipe`] are always scheduled on the
//! promise's [`Scheduler`], never run inline, so registering and settling
//! never block and never reenter the caller.
//!
//! The primitive knows nothing about cancellation; that layer lives in
//! [`crate::cancellable`]. The resolver is deliberately trip-once rather than
//! settle-or-panic: the cancellation machinery releases its internal signal
//! redundantly and relies on later settlements being no-ops.
//!
//! Promises also implement [`std::future::Future`], registering the caller's
//! waker and waking it on settlement, so they can be awaited by any executor.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Waker};

use crate::error::Error;
use crate::scheduler::Scheduler;

/// The settlement of a promise: its value or the error it rejected with
pub type Settled<T> = Result<T, Error>;

/// Observable lifecycle of a promise
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Pending,
    Fulfilled,
    Rejected,
}

/// A cloneable observation handle to a single-resolution asynchronous value
pub struct Promise<T> {
    shared: Arc<Mutex<Shared<T>>>,
    scheduler: Scheduler,
}

/// The settle handle for a [`Promise`]
///
/// Cloneable; the first settlement wins and every later one is a no-op.
pub struct Resolver<T> {
    shared: Arc<Mutex<Shared<T>>>,
    scheduler: Scheduler,
}

struct Shared<T> {
    result: Option<Settled<T>>,
    waiters: Vec<Box<dyn FnOnce(Settled<T>) + Send>>,
    wakers: Vec<Waker>,
}

impl<T> Promise<T> {
    /// Create a pending promise together with its resolver
    pub fn pending(scheduler: &Scheduler) -> (Promise<T>, Resolver<T>) {
        let shared = Arc::new(Mutex::new(Shared {
            result: None,
            waiters: Vec::new(),
            wakers: Vec::new(),
        }));

        let promise = Promise {
            shared: Arc::clone(&shared),
            scheduler: scheduler.clone(),
        };
        let resolver = Resolver {
            shared,
            scheduler: scheduler.clone(),
        };
        (promise, resolver)
    }

    pub fn state(&self) -> State {
        match &self.shared.lock().unwrap().result {
            None => State::Pending,
            Some(Ok(_)) => State::Fulfilled,
            Some(Err(_)) => State::Rejected,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state() == State::Pending
    }

    pub fn is_fulfilled(&self) -> bool {
        self.state() == State::Fulfilled
    }

    pub fn is_rejected(&self) -> bool {
        self.state() == State::Rejected
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// An already-fulfilled promise
    pub fn fulfilled(scheduler: &Scheduler, value: T) -> Promise<T> {
        let (promise, resolver) = Promise::pending(scheduler);
        resolver.fulfill(value);
        promise
    }

    /// An already-rejected promise
    pub fn rejected(scheduler: &Scheduler, error: Error) -> Promise<T> {
        let (promise, resolver) = Promise::pending(scheduler);
        resolver.reject(error);
        promise
    }

    /// The settlement, if the promise is no longer pending
    pub fn result(&self) -> Option<Settled<T>> {
        self.shared.lock().unwrap().result.clone()
    }

    /// A pendingness probe that does not keep the promise alive
    ///
    /// A promise whose shared state is gone has no observers left and counts
    /// as not pending.
    pub(crate) fn pending_probe(&self) -> impl Fn() -> bool + Send + 'static {
        let shared = Arc::downgrade(&self.shared);
        move || match shared.upgrade() {
            Some(shared) => shared.lock().unwrap().result.is_none(),
            None => false,
        }
    }

    /// Register a callback to receive the settlement
    ///
    /// The callback is scheduled, never invoked inline, even when the
    /// promise has already settled.
    pub fn pipe(&self, callback: impl FnOnce(Settled<T>) + Send + 'static) {
        let mut shared = self.shared.lock().unwrap();
        match shared.result.clone() {
            Some(result) => {
                drop(shared);
                self.scheduler.schedule(move || callback(result));
            }
            None => shared.waiters.push(Box::new(callback)),
        }
    }

    /// A promise for the transformed value
    pub fn map<U, F>(&self, transform: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let (promise, resolver) = Promise::pending(&self.scheduler);
        self.pipe(move |settled| match settled {
            Ok(value) => resolver.fulfill(transform(value)),
            Err(error) => resolver.reject(error),
        });
        promise
    }

    /// Sequence another asynchronous operation after this one fulfills
    ///
    /// Rejections bypass `body` and propagate unchanged.
    pub fn then<U, F>(&self, body: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Promise<U> + Send + 'static,
    {
        let (promise, resolver) = Promise::pending(&self.scheduler);
        self.pipe(move |settled| match settled {
            Ok(value) => body(value).pipe(move |inner| resolver.resolve(inner)),
            Err(error) => resolver.reject(error),
        });
        promise
    }

    /// Register a callback for the rejection, if any
    pub fn catch<F>(&self, handler: F)
    where
        F: FnOnce(Error) + Send + 'static,
    {
        self.pipe(move |settled| {
            if let Err(error) = settled {
                handler(error);
            }
        });
    }

    /// Run a callback once the promise settles, passing the settlement through
    pub fn ensure<F>(&self, finally: F) -> Promise<T>
    where
        F: FnOnce() + Send + 'static,
    {
        let (promise, resolver) = Promise::pending(&self.scheduler);
        self.pipe(move |settled| {
            finally();
            resolver.resolve(settled);
        });
        promise
    }

    /// Wait for every promise to fulfill, in input order
    ///
    /// Rejects as soon as any input rejects. An empty input fulfills with an
    /// empty list.
    pub fn all(scheduler: &Scheduler, promises: Vec<Promise<T>>) -> Promise<Vec<T>> {
        let (promise, resolver) = Promise::pending(scheduler);
        if promises.is_empty() {
            resolver.fulfill(Vec::new());
            return promise;
        }

        let remaining = promises.len();
        let slots: Arc<Mutex<(Vec<Option<T>>, usize)>> =
            Arc::new(Mutex::new((vec![None; remaining], remaining)));
        for (index, each) in promises.into_iter().enumerate() {
            let slots = Arc::clone(&slots);
            let resolver = resolver.clone();
            each.pipe(move |settled| match settled {
                Ok(value) => {
                    let mut slots = slots.lock().unwrap();
                    slots.0[index] = Some(value);
                    slots.1 -= 1;
                    if slots.1 == 0 {
                        let values: Option<Vec<T>> =
                            slots.0.iter_mut().map(Option::take).collect();
                        if let Some(values) = values {
                            resolver.fulfill(values);
                        }
                    }
                }
                Err(error) => resolver.reject(error),
            });
        }
        promise
    }

    /// Settle with the first input that settles, value or error
    ///
    /// Racing an empty list rejects immediately; a promise that can never
    /// settle is a programming error, not a wait.
    pub fn race(scheduler: &Scheduler, promises: Vec<Promise<T>>) -> Promise<T> {
        let (promise, resolver) = Promise::pending(scheduler);
        if promises.is_empty() {
            resolver.reject(Error::failed("cannot race an empty list of promises"));
            return promise;
        }

        for each in promises {
            let resolver = resolver.clone();
            each.pipe(move |settled| resolver.resolve(settled));
        }
        promise
    }

    /// Wait for every promise to settle, collecting each outcome in input order
    ///
    /// Never rejects on account of individual failures.
    pub fn all_settled(
        scheduler: &Scheduler,
        promises: Vec<Promise<T>>,
    ) -> Promise<Vec<Settled<T>>> {
        let (promise, resolver) = Promise::pending(scheduler);
        if promises.is_empty() {
            resolver.fulfill(Vec::new());
            return promise;
        }

        let remaining = promises.len();
        let slots: Arc<Mutex<(Vec<Option<Settled<T>>>, usize)>> =
            Arc::new(Mutex::new((vec![None; remaining], remaining)));
        for (index, each) in promises.into_iter().enumerate() {
            let slots = Arc::clone(&slots);
            let resolver = resolver.clone();
            each.pipe(move |settled| {
                let mut slots = slots.lock().unwrap();
                slots.0[index] = Some(settled);
                slots.1 -= 1;
                if slots.1 == 0 {
                    let outcomes: Option<Vec<Settled<T>>> =
                        slots.0.iter_mut().map(Option::take).collect();
                    if let Some(outcomes) = outcomes {
                        resolver.fulfill(outcomes);
                    }
                }
            });
        }
        promise
    }
}

impl<T: Clone + Send + 'static> Resolver<T> {
    /// Fulfill the promise; a no-op if it has already settled
    pub fn fulfill(&self, value: T) {
        self.settle(Ok(value));
    }

    /// Reject the promise; a no-op if it has already settled
    pub fn reject(&self, error: Error) {
        self.settle(Err(error));
    }

    /// Settle the promise with an existing outcome
    pub fn resolve(&self, settled: Settled<T>) {
        self.settle(settled);
    }

    fn settle(&self, settled: Settled<T>) {
        let (waiters, wakers) = {
            let mut shared = self.shared.lock().unwrap();
            if shared.result.is_some() {
                // First settlement wins
                return;
            }
            shared.result = Some(settled.clone());
            (
                std::mem::take(&mut shared.waiters),
                std::mem::take(&mut shared.wakers),
            )
        };
        for waiter in waiters {
            let each = settled.clone();
            self.scheduler.schedule(move || waiter(each));
        }
        for waker in wakers {
            waker.wake();
        }
    }
}

impl<T> Resolver<T> {
    pub fn is_settled(&self) -> bool {
        self.shared.lock().unwrap().result.is_some()
    }

    /// A settle handle that does not keep the promise alive
    pub(crate) fn downgrade(&self) -> WeakResolver<T> {
        WeakResolver {
            shared: Arc::downgrade(&self.shared),
            scheduler: self.scheduler.clone(),
        }
    }
}

/// A non-owning [`Resolver`]; settling through it is skipped once every
/// observer of the promise is gone.
pub(crate) struct WeakResolver<T> {
    shared: Weak<Mutex<Shared<T>>>,
    scheduler: Scheduler,
}

impl<T> WeakResolver<T> {
    pub(crate) fn upgrade(&self) -> Option<Resolver<T>> {
        self.shared.upgrade().map(|shared| Resolver {
            shared,
            scheduler: self.scheduler.clone(),
        })
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<T: Clone> Future for Promise<T> {
    type Output = Settled<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut shared = self.shared.lock().unwrap();
        match shared.result.clone() {
            Some(result) => Poll::Ready(result),
            None => {
                shared.wakers.push(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}
