//! Single-threaded cooperative executor (spec §4.7).

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::CoreError;

use super::task::{CancelToken, ScheduledTask, SequenceCounter, Task};

/// Anything a [`crate::pipeline::HandlerContext`] can run work on. Satisfied
/// by [`EventLoop`] itself; a handler inserted with an explicit executor
/// override (spec §3 "the executor it must run on") need only implement
/// this trait.
pub trait Executor: Send + Sync {
    /// Whether the calling thread *is* this executor's thread.
    fn in_event_loop(&self) -> bool;

    /// Runs `task` inline if already on this executor's thread, otherwise
    /// hands it to the executor's queue. Returns `Err(CoreError::Rejected)`
    /// if the executor has begun or finished shutting down.
    fn execute(&self, task: Task) -> Result<(), CoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventLoopState {
    Running = 0,
    ShuttingDown = 1,
    Shutdown = 2,
    Terminated = 3,
}

impl EventLoopState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => EventLoopState::Running,
            1 => EventLoopState::ShuttingDown,
            2 => EventLoopState::Shutdown,
            _ => EventLoopState::Terminated,
        }
    }
}

struct ShutdownRequest {
    quiet_period: Duration,
    timeout: Duration,
    requested_at: Instant,
}

struct Inner {
    thread_id: Mutex<Option<ThreadId>>,
    sender: std::sync::mpsc::Sender<Task>,
    scheduled: Mutex<BinaryHeap<ScheduledTask>>,
    seq: SequenceCounter,
    state: AtomicU8,
    breakout_interval: Duration,
    last_submission: Mutex<Instant>,
    shutdown_request: Mutex<Option<ShutdownRequest>>,
    terminated: crate::future::Promise<()>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
    name: String,
}

/// A dedicated OS thread draining an immediate-task MPSC queue and a
/// deadline-ordered scheduled-task heap, per spec §4.7. Channels registered
/// with this loop (spec §3 "each Channel is exclusively owned by its Loop
/// for the duration of registration") always have their pipeline and
/// handler callbacks dispatched from this thread unless a handler's context
/// carries its own executor override.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<Inner>,
}

impl EventLoop {
    /// Spawns the loop's dedicated thread. `breakout_interval` bounds how
    /// long the thread waits for the next immediate task before it must
    /// re-check scheduled-task deadlines and shutdown state (default 100 ms,
    /// spec §6).
    pub fn new(name: impl Into<String>, breakout_interval: Duration) -> Self {
        let name = name.into();
        let (sender, receiver) = std::sync::mpsc::channel::<Task>();
        let inner = Arc::new(Inner {
            thread_id: Mutex::new(None),
            sender,
            scheduled: Mutex::new(BinaryHeap::new()),
            seq: SequenceCounter::default(),
            state: AtomicU8::new(EventLoopState::Running as u8),
            breakout_interval,
            last_submission: Mutex::new(Instant::now()),
            shutdown_request: Mutex::new(None),
            terminated: crate::future::Promise::new(),
            join_handle: Mutex::new(None),
            name: name.clone(),
        });
        let run_inner = inner.clone();
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || run(run_inner, receiver))
            .expect("spawning event loop thread");
        *inner.join_handle.lock().unwrap() = Some(handle);
        EventLoop { inner }
    }

    pub fn with_default_interval(name: impl Into<String>) -> Self {
        Self::new(name, Duration::from_millis(100))
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> EventLoopState {
        EventLoopState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Schedules `task` to run no earlier than `delay` from now. Returns a
    /// [`CancelToken`] the caller may use for lazy tombstoning.
    pub fn schedule(&self, delay: Duration, task: Task) -> Result<CancelToken, CoreError> {
        if self.state() != EventLoopState::Running {
            return Err(CoreError::Rejected);
        }
        let token = CancelToken::new();
        let entry = ScheduledTask {
            deadline: Instant::now() + delay,
            sequence: self.inner.seq.next(),
            task,
            cancelled: token.flag(),
        };
        self.inner.scheduled.lock().unwrap().push(entry);
        self.touch_last_submission();
        Ok(token)
    }

    fn touch_last_submission(&self) {
        *self.inner.last_submission.lock().unwrap() = Instant::now();
    }

    /// `Running → ShuttingDown`. The loop keeps draining already-queued and
    /// newly-submitted-but-not-yet-rejected tasks until `quiet_period` has
    /// passed with no submissions, or `timeout` has elapsed since this call,
    /// whichever comes first (spec §4.7).
    pub fn shutdown_gracefully(
        &self,
        quiet_period: Duration,
        timeout: Duration,
    ) -> crate::future::Promise<()> {
        let mut guard = self.inner.shutdown_request.lock().unwrap();
        if guard.is_none() {
            self.inner
                .state
                .store(EventLoopState::ShuttingDown as u8, Ordering::Release);
            *guard = Some(ShutdownRequest {
                quiet_period,
                timeout,
                requested_at: Instant::now(),
            });
            info!(loop_name = %self.inner.name, ?quiet_period, ?timeout, "event loop shutdown requested");
        }
        self.inner.terminated.clone()
    }

    pub fn terminated(&self) -> crate::future::Promise<()> {
        self.inner.terminated.clone()
    }
}

impl Executor for EventLoop {
    fn in_event_loop(&self) -> bool {
        *self.inner.thread_id.lock().unwrap() == Some(std::thread::current().id())
    }

    fn execute(&self, task: Task) -> Result<(), CoreError> {
        if self.state() != EventLoopState::Running && self.state() != EventLoopState::ShuttingDown {
            return Err(CoreError::Rejected);
        }
        if self.in_event_loop() {
            task.run();
            return Ok(());
        }
        self.touch_last_submission();
        self.inner.sender.send(task).map_err(|_| CoreError::Rejected)
    }
}

fn run(inner: Arc<Inner>, receiver: std::sync::mpsc::Receiver<Task>) {
    *inner.thread_id.lock().unwrap() = Some(std::thread::current().id());
    debug!(loop_name = %inner.name, "event loop thread started");
    loop {
        // Run anything already due before waiting on the queue, so a
        // scheduled task that matured while we were off running the
        // previous immediate task gets first crack at the thread.
        run_due_scheduled(&inner);
        match receiver.recv_timeout(next_wait(&inner)) {
            Ok(task) => {
                // The wait may have been cut short by a task arriving at
                // (or after) the moment a scheduled task also came due;
                // per spec §4.7 the scheduled task wins that tie.
                run_due_scheduled(&inner);
                task.run();
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {}
        }
        if maybe_finish_shutdown(&inner) {
            break;
        }
    }
    inner.state.store(EventLoopState::Terminated as u8, Ordering::Release);
    inner.terminated.try_complete(Ok(()));
    info!(loop_name = %inner.name, "event loop terminated");
}

/// How long the thread may block on the immediate-task queue before it must
/// wake up to re-check scheduled-task deadlines and shutdown state: the
/// configured breakout interval, or sooner if a scheduled task matures
/// first.
fn next_wait(inner: &Arc<Inner>) -> Duration {
    let now = Instant::now();
    match inner.scheduled.lock().unwrap().peek() {
        Some(top) if top.deadline <= now => Duration::ZERO,
        Some(top) => (top.deadline - now).min(inner.breakout_interval),
        None => inner.breakout_interval,
    }
}

fn run_due_scheduled(inner: &Arc<Inner>) {
    let now = Instant::now();
    let mut heap = inner.scheduled.lock().unwrap();
    let mut due = Vec::new();
    while let Some(top) = heap.peek() {
        if top.deadline > now {
            break;
        }
        due.push(heap.pop().expect("just peeked"));
    }
    drop(heap);
    for entry in due {
        if !entry.is_cancelled() {
            entry.task.run();
        }
    }
}

fn maybe_finish_shutdown(inner: &Arc<Inner>) -> bool {
    let state = EventLoopState::from_u8(inner.state.load(Ordering::Acquire));
    if state != EventLoopState::ShuttingDown {
        return state == EventLoopState::Terminated;
    }
    let guard = inner.shutdown_request.lock().unwrap();
    let Some(request) = guard.as_ref() else {
        return false;
    };
    let now = Instant::now();
    let quiet_elapsed = now.duration_since(*inner.last_submission.lock().unwrap());
    let total_elapsed = now.duration_since(request.requested_at);
    if quiet_elapsed >= request.quiet_period || total_elapsed >= request.timeout {
        inner.state.store(EventLoopState::Shutdown as u8, Ordering::Release);
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn tasks_run_in_fifo_order() {
        let event_loop = EventLoop::new("test-fifo", Duration::from_millis(10));
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            event_loop.execute(Task::new(move || order.lock().unwrap().push(i))).unwrap();
        }
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        event_loop.shutdown_gracefully(Duration::from_millis(1), Duration::from_secs(1)).wait().unwrap();
    }

    #[test]
    fn rejects_after_shutdown_requested_and_drained() {
        let event_loop = EventLoop::new("test-shutdown", Duration::from_millis(10));
        event_loop
            .shutdown_gracefully(Duration::from_millis(1), Duration::from_millis(500))
            .wait()
            .unwrap();
        assert_eq!(event_loop.state(), EventLoopState::Terminated);
        assert!(matches!(
            event_loop.execute(Task::new(|| {})),
            Err(CoreError::Rejected)
        ));
    }

    #[test]
    fn scheduled_task_runs_after_deadline() {
        let event_loop = EventLoop::new("test-scheduled", Duration::from_millis(5));
        let flag = Arc::new(AtomicU32::new(0));
        let flag2 = flag.clone();
        event_loop
            .schedule(Duration::from_millis(20), Task::new(move || { flag2.store(1, Ordering::SeqCst); }))
            .unwrap();
        assert_eq!(flag.load(Ordering::SeqCst), 0);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(flag.load(Ordering::SeqCst), 1);
        event_loop.shutdown_gracefully(Duration::from_millis(1), Duration::from_secs(1)).wait().unwrap();
    }

    /// Spec §8 scenario 6, scaled down: submissions keep extending the quiet
    /// period, so termination lands near `last_submission + quiet_period`
    /// rather than immediately after the shutdown request.
    #[test]
    fn shutdown_waits_out_the_quiet_period_after_last_submission() {
        let event_loop = EventLoop::new("test-quiet-period", Duration::from_millis(2));
        for _ in 0..5 {
            event_loop.execute(Task::new(|| {})).unwrap();
            std::thread::sleep(Duration::from_millis(10));
        }
        let start = Instant::now();
        event_loop
            .shutdown_gracefully(Duration::from_millis(30), Duration::from_secs(5))
            .wait()
            .unwrap();
        // Terminates well before the 5s timeout, but not before a quiet
        // period had a chance to elapse with no further submissions.
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(event_loop.state(), EventLoopState::Terminated);
    }
}
