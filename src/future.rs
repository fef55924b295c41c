//! One-shot completion signals for write/connect/close results.
//!
//! The event loop is a synchronous, cooperative scheduler (spec §4.7), not
//! an async-await runtime, so outbound operations complete through a
//! listener-based signal rather than `Future`/`async fn` — the same shape
//! as Netty's `ChannelPromise`/`ChannelFuture` pair, collapsed here into a
//! single clonable type since nothing in this crate needs a distinct
//! read-only future type.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::CoreError;

type Listener<T> = Box<dyn FnOnce(&Result<T, CoreError>) + Send + 'static>;

struct Inner<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

enum State<T> {
    Pending(Vec<Listener<T>>),
    Done(Result<T, CoreError>),
}

/// A completion signal that may be completed at most once. Clones share the
/// same underlying state; any clone may complete it, and every clone
/// observes the same outcome.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            inner: self.inner.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.inner.state.lock();
        match &*guard {
            State::Pending(_) => write!(f, "Promise(pending)"),
            State::Done(result) => write!(f, "Promise(done: {result:?})"),
        }
    }
}

/// Alias used at call sites that only ever read a promise's outcome,
/// matching the vocabulary of spec §4.4 ("completion signal").
pub type CompletionSignal<T> = Promise<T>;

impl<T> Promise<T> {
    pub fn new() -> Self {
        Promise {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending(Vec::new())),
                ready: Condvar::new(),
            }),
        }
    }

    /// Returns an already-completed promise, useful for synchronous
    /// failure paths (e.g. a write rejected before it reaches the loop).
    pub fn completed(result: Result<T, CoreError>) -> Self {
        let promise = Self::new();
        promise.try_complete(result);
        promise
    }

    pub fn succeeded(value: T) -> Self {
        Self::completed(Ok(value))
    }

    pub fn failed(error: CoreError) -> Self {
        Self::completed(Err(error))
    }

    /// Completes the promise, returning `false` if it was already done.
    /// Listeners registered before completion run in registration order,
    /// on the completing thread.
    pub fn try_complete(&self, result: Result<T, CoreError>) -> bool {
        let (listeners, stored): (Vec<Listener<T>>, *const Result<T, CoreError>) = {
            let mut guard = self.inner.state.lock();
            if matches!(&*guard, State::Done(_)) {
                return false;
            }
            let listeners = match std::mem::replace(&mut *guard, State::Done(result)) {
                State::Pending(listeners) => listeners,
                State::Done(_) => unreachable!("just checked for Pending above"),
            };
            let stored = match &*guard {
                State::Done(result) => result as *const Result<T, CoreError>,
                State::Pending(_) => unreachable!("just wrote Done above"),
            };
            (listeners, stored)
        };
        self.inner.ready.notify_all();
        // The promise is one-shot: once Done, the state never changes again
        // for the lifetime of `inner`, so reading through the raw pointer
        // without holding the lock is sound.
        let result_ref = unsafe { &*stored };
        for listener in listeners {
            listener(result_ref);
        }
        true
    }

    pub fn is_done(&self) -> bool {
        matches!(&*self.inner.state.lock(), State::Done(_))
    }

    /// Registers a listener invoked once the promise completes. If it is
    /// already complete, the listener runs immediately on the calling
    /// thread.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&Result<T, CoreError>) + Send + 'static,
    {
        let mut guard = self.inner.state.lock();
        match &mut *guard {
            State::Pending(listeners) => listeners.push(Box::new(listener)),
            State::Done(result) => {
                let stored = result as *const Result<T, CoreError>;
                drop(guard);
                let result_ref = unsafe { &*stored };
                listener(result_ref);
            }
        }
    }

    /// Blocks the calling thread until the promise completes.
    ///
    /// The event loop itself must never call this — only external callers
    /// (tests, demo code) waiting off-loop.
    pub fn wait(&self) -> Result<T, CoreError>
    where
        T: Clone,
    {
        let mut guard = self.inner.state.lock();
        loop {
            match &*guard {
                State::Done(result) => return result.clone(),
                State::Pending(_) => self.inner.ready.wait(&mut guard),
            }
        }
    }

    /// Like [`wait`](Self::wait), bounded by `timeout`. Returns `None` if
    /// the promise had not completed by the deadline.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, CoreError>>
    where
        T: Clone,
    {
        let mut guard = self.inner.state.lock();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let State::Done(result) = &*guard {
                return Some(result.clone());
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let timed_out = self.inner.ready.wait_for(&mut guard, remaining).timed_out();
            if timed_out {
                if let State::Done(result) = &*guard {
                    return Some(result.clone());
                }
                return None;
            }
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn completes_once() {
        let promise: Promise<u32> = Promise::new();
        assert!(promise.try_complete(Ok(1)));
        assert!(!promise.try_complete(Ok(2)));
        assert_eq!(promise.wait().unwrap(), 1);
    }

    #[test]
    fn listener_runs_immediately_when_already_done() {
        let promise = Promise::succeeded(7u32);
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        promise.add_listener(move |result| {
            *seen2.lock() = Some(result.as_ref().ok().copied());
        });
        assert_eq!(*seen.lock(), Some(Some(7)));
    }

    #[test]
    fn listener_runs_on_completion() {
        let promise: Promise<u32> = Promise::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        promise.add_listener(move |_| fired2.store(true, Ordering::SeqCst));
        assert!(!fired.load(Ordering::SeqCst));
        promise.try_complete(Ok(1));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn wait_timeout_returns_none_when_pending() {
        let promise: Promise<u32> = Promise::new();
        assert!(promise.wait_timeout(Duration::from_millis(5)).is_none());
    }
}
