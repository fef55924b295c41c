//! Units of work submitted to an [`EventLoop`](super::event_loop::EventLoop)
//! (spec §4.7).

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

/// Cooperative cancellation for a submitted task. Cancelling does not
/// pre-empt a task already running (spec §4.7 "In-flight tasks are not
/// pre-empted") — it only prevents a task from starting once it reaches the
/// front of its queue.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::Acquire)
    }

    /// Exposes the shared flag so [`super::event_loop::EventLoop::schedule`]
    /// can thread the same `Arc` through a [`ScheduledTask`] without a
    /// second layer of indirection.
    pub(crate) fn flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A closure submitted to the loop's immediate (MPSC) queue, optionally
/// guarded by a [`CancelToken`] checked just before it runs.
pub struct Task {
    run: Box<dyn FnOnce() + Send + 'static>,
    cancel: Option<CancelToken>,
}

impl Task {
    pub fn new<F: FnOnce() + Send + 'static>(run: F) -> Self {
        Task {
            run: Box::new(run),
            cancel: None,
        }
    }

    pub fn with_cancel<F: FnOnce() + Send + 'static>(run: F, cancel: CancelToken) -> Self {
        Task {
            run: Box::new(run),
            cancel: Some(cancel),
        }
    }

    /// Runs the task unless it was cancelled since submission (spec §4.7
    /// "cancelled tasks are dropped when dequeued").
    pub fn run(self) {
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return;
        }
        (self.run)();
    }
}

/// A task scheduled for a future deadline, ordered by `(deadline, sequence)`
/// so ties between equally-timed tasks still resolve in submission order.
/// Cancellation before the deadline tombstones the entry lazily: it stays
/// in the heap but is skipped (and dropped) when popped (spec §4.7
/// "Scheduled tasks cancelled before their deadline are removed lazily").
pub struct ScheduledTask {
    pub deadline: Instant,
    pub sequence: u64,
    pub task: Task,
    pub cancelled: Arc<AtomicBool>,
}

impl ScheduledTask {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::Acquire)
    }
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}
impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    /// Reversed so a `BinaryHeap<ScheduledTask>` behaves as a min-heap on
    /// `(deadline, sequence)` — the earliest, earliest-submitted task pops
    /// first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Monotonic sequence generator for scheduled-task tie-breaking.
#[derive(Default)]
pub struct SequenceCounter(AtomicU64);

impl SequenceCounter {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, AtomicOrdering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn cancelled_task_does_not_run() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter2 = counter.clone();
        let token = CancelToken::new();
        let task = Task::with_cancel(move || { counter2.fetch_add(1, AtomicOrdering::SeqCst); }, token.clone());
        token.cancel();
        task.run();
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn scheduled_task_min_heap_orders_by_deadline_then_sequence() {
        use std::collections::BinaryHeap;
        let base = Instant::now();
        let mut heap = BinaryHeap::new();
        heap.push(ScheduledTask {
            deadline: base + Duration::from_millis(10),
            sequence: 1,
            task: Task::new(|| {}),
            cancelled: Arc::new(AtomicBool::new(false)),
        });
        heap.push(ScheduledTask {
            deadline: base + Duration::from_millis(5),
            sequence: 0,
            task: Task::new(|| {}),
            cancelled: Arc::new(AtomicBool::new(false)),
        });
        heap.push(ScheduledTask {
            deadline: base + Duration::from_millis(5),
            sequence: 2,
            task: Task::new(|| {}),
            cancelled: Arc::new(AtomicBool::new(false)),
        });
        let first = heap.pop().unwrap();
        assert_eq!(first.sequence, 0);
        let second = heap.pop().unwrap();
        assert_eq!(second.sequence, 2);
    }
}
