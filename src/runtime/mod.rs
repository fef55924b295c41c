//! Event-loop / loop-group scheduling model (spec §4.7, §4.8).

pub mod event_loop;
pub mod group;
pub mod task;

pub use event_loop::{EventLoop, EventLoopState, Executor};
pub use group::EventLoopGroup;
pub use task::{CancelToken, ScheduledTask, Task};
