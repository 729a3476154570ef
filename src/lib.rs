//! cancellable-promise: promises with first-class cancellation
//!
//! This crate layers cancellation on top of a single-resolution promise
//! primitive that has none:
//! - A [`Promise`]/[`Resolver`] pair is a plain asynchronous value: pending,
//!   then exactly once fulfilled or rejected, observed through callbacks that
//!   run serialized on one [`Scheduler`].
//! - A [`CancellablePromise`] wraps a promise together with an abort callback
//!   and an internal trip-wire, adding `cancel()`, `is_cancelled()`, and
//!   cancellation-aware combinators ([`CancellablePromise::map`],
//!   [`CancellablePromise::then`], [`race`], [`all`], [`all_settled`]).
//!
//! Cancellation is advisory for the underlying work: the abort callback asks
//! it to stop, and whether or not it listens, the wrapper settles as rejected
//! with the distinguished [`Error::Cancelled`] kind that downstream handlers
//! can test with [`Error::is_cancelled`].
//!
//! # Example
//!
//! ```
//! use cancellable_promise::{AbortFn, CancellablePromise, Error, Scheduler};
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let scheduler = Scheduler::simulated();
//! let aborted = Arc::new(AtomicBool::new(false));
//!
//! let flag = aborted.clone();
//! let sched = scheduler.clone();
//! let fetch = CancellablePromise::from_resolver(&scheduler, move |resolver| -> Result<AbortFn, Error> {
//!     let timer = sched.schedule_after(Duration::from_millis(100), move || resolver.fulfill(42));
//!     Ok(Box::new(move || {
//!         flag.store(true, Ordering::SeqCst);
//!         sched.cancel_timer(timer);
//!     }))
//! });
//!
//! fetch.cancel();
//! scheduler.run();
//!
//! assert!(aborted.load(Ordering::SeqCst));
//! assert_eq!(fetch.result(), Some(Err(Error::Cancelled)));
//! ```
//!
//! # Timeouts
//!
//! There is no built-in timeout; [`timer::timeout`] races an operation
//! against a [`timer::delay`]-style deadline with `auto_cancel`, so the
//! losing side is cancelled.

#![deny(warnings)]

pub mod cancellable;
pub mod promise;
pub mod scheduler;
pub mod timer;

// Re-export core types
pub use cancellable::{
    all, all_settled, cancel_all, race, AbortFn, CancelHandle, CancellablePromise, PromiseExt,
};
pub use error::Error;
pub use promise::{Promise, Resolver, Settled, State};
pub use scheduler::{Scheduler, TimerId};
pub use timer::{delay, timeout};

/// Error types for cancellation-aware promises
pub mod error {
    use thiserror::Error;

    /// The ways a promise can reject
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum Error {
        /// Terminal outcome produced only by cancellation; downstream
        /// handlers should treat it as silence, not as a fault.
        #[error("operation cancelled")]
        Cancelled,

        /// Produced by [`crate::timer::timeout`] when the deadline wins
        #[error("operation timed out")]
        TimedOut,

        /// Any ordinary failure of the underlying computation
        #[error("{0}")]
        Failed(String),
    }

    impl Error {
        /// An ordinary failure carrying a message
        pub fn failed(message: impl Into<String>) -> Self {
            Error::Failed(message.into())
        }

        /// True only for the distinguished cancelled kind
        pub fn is_cancelled(&self) -> bool {
            matches!(self, Error::Cancelled)
        }
    }
}
