//! Fixed-size pool of event loops with a `next()` assignment policy (spec
//! §4.8).

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing::warn;

use crate::error::CoreError;

use super::event_loop::EventLoop;

thread_local! {
    /// Ambient "current executor" registry (spec §4.8's affinitised
    /// variant): set to `Some((group ptr, index))` for the duration of a
    /// thread that *is* one of a group's loop threads, so a nested `next()`
    /// call from within loop code returns that same loop.
    static CURRENT_LOOP: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

struct Inner {
    loops: Vec<EventLoop>,
    counter: AtomicUsize,
}

/// A fixed-size, ordered sequence of [`EventLoop`]s plus a round-robin (or
/// thread-affine) `next()` policy.
#[derive(Clone)]
pub struct EventLoopGroup {
    inner: std::sync::Arc<Inner>,
}

impl EventLoopGroup {
    /// Builds `count` loops via `factory`. If building loop `k` fails, every
    /// loop `0..k` already constructed is shut down and awaited before the
    /// error is returned (spec §4.8).
    pub fn new(count: usize, factory: impl Fn(usize) -> Result<EventLoop, CoreError>) -> Result<Self, CoreError> {
        let mut loops = Vec::with_capacity(count);
        for index in 0..count {
            match factory(index) {
                Ok(event_loop) => loops.push(event_loop),
                Err(error) => {
                    warn!(failed_index = index, "event loop group construction failed, unwinding");
                    for built in &loops {
                        built.shutdown_gracefully(Duration::from_millis(0), Duration::from_secs(5)).wait().ok();
                    }
                    return Err(error);
                }
            }
        }
        Ok(EventLoopGroup {
            inner: std::sync::Arc::new(Inner {
                loops,
                counter: AtomicUsize::new(0),
            }),
        })
    }

    /// Convenience constructor: `count` loops, each with the default 100 ms
    /// breakout interval, named `"{prefix}-{index}"`.
    pub fn with_default_loops(count: usize, prefix: &str) -> Self {
        let prefix = prefix.to_string();
        EventLoopGroup::new(count, move |index| {
            Ok(EventLoop::with_default_interval(format!("{prefix}-{index}")))
        })
        .expect("default event loop construction never fails")
    }

    pub fn len(&self) -> usize {
        self.inner.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.loops.is_empty()
    }

    fn group_key(&self) -> usize {
        std::sync::Arc::as_ptr(&self.inner) as *const () as usize
    }

    /// Thread-affine, monotonic round-robin (spec §4.8): if the calling
    /// thread is itself one of this group's loop threads, returns that same
    /// loop; otherwise returns `loops[counter.fetch_add(1) % count]`.
    pub fn next(&self) -> EventLoop {
        if let Some(index) = CURRENT_LOOP.with(|c| {
            c.get().and_then(|(key, index)| (key == self.group_key()).then_some(index))
        }) {
            return self.inner.loops[index].clone();
        }
        let index = self.inner.counter.fetch_add(1, Ordering::Relaxed) % self.inner.loops.len();
        self.inner.loops[index].clone()
    }

    pub fn loops(&self) -> &[EventLoop] {
        &self.inner.loops
    }

    /// Marks the calling thread as affinitised to `loops[index]` of this
    /// group for the duration of `f`. [`EventLoop::new`] does not call this
    /// itself (it has no `EventLoopGroup` to reference); a group that wants
    /// affinity support must register it from within each loop's own
    /// startup task, e.g. by scheduling an immediate task on loop `index`
    /// that calls this once.
    pub fn run_as_current<R>(&self, index: usize, f: impl FnOnce() -> R) -> R {
        let key = self.group_key();
        CURRENT_LOOP.with(|c| c.set(Some((key, index))));
        let result = f();
        CURRENT_LOOP.with(|c| c.set(None));
        result
    }

    /// Broadcasts `shutdown_gracefully` to every loop and returns a promise
    /// completing once all of them have reached `Terminated` (spec §4.8
    /// "composite termination signal").
    pub fn shutdown_gracefully(
        &self,
        quiet_period: Duration,
        timeout: Duration,
    ) -> crate::future::Promise<()> {
        let composite = crate::future::Promise::new();
        if self.inner.loops.is_empty() {
            composite.try_complete(Ok(()));
            return composite;
        }
        let remaining = std::sync::Arc::new(AtomicUsize::new(self.inner.loops.len()));
        for event_loop in &self.inner.loops {
            let terminated = event_loop.shutdown_gracefully(quiet_period, timeout);
            let remaining = remaining.clone();
            let composite = composite.clone();
            terminated.add_listener(move |_| {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    composite.try_complete(Ok(()));
                }
            });
        }
        composite
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_is_monotonic_and_distinct_for_size_two() {
        let group = EventLoopGroup::with_default_loops(2, "test-rr");
        let first = group.next();
        let second = group.next();
        assert_ne!(first.name(), second.name());
        group.shutdown_gracefully(Duration::from_millis(1), Duration::from_secs(2)).wait().unwrap();
    }

    #[test]
    fn affinity_returns_same_loop_from_within_it() {
        let group = EventLoopGroup::with_default_loops(3, "test-affinity");
        let chosen = group.run_as_current(1, || group.next());
        assert_eq!(chosen.name(), group.loops()[1].name());
        group.shutdown_gracefully(Duration::from_millis(1), Duration::from_secs(2)).wait().unwrap();
    }

    #[test]
    fn construction_failure_unwinds_already_built_loops() {
        let result = EventLoopGroup::new(3, |index| {
            if index == 2 {
                Err(CoreError::channel("boom"))
            } else {
                Ok(EventLoop::with_default_interval(format!("test-unwind-{index}")))
            }
        });
        assert!(result.is_err());
    }
}
