//! Drives a single propagation step: picks the executor a target handler
//! must run on, invokes it under `catch_unwind`, and routes a panic into
//! `exceptionCaught` (spec §4.4, §4.5, §9).

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::buffer::PipelineMessage;
use crate::channel::Channel;
use crate::error::CoreError;
use crate::future::Promise;
use crate::runtime::{Executor, Task};

use super::chain::{self, PipelineShared, Slot, Snapshot};
use super::context::HandlerContext;
use super::event::{HandlerEvent, UserEvent};
use super::handler::Handler;

fn effective_executor(shared: &PipelineShared, slot: &Slot) -> Option<Arc<dyn Executor>> {
    if let Some(executor) = &slot.executor_override {
        return Some(executor.clone());
    }
    shared.channel().and_then(|channel| channel.event_loop()).map(|event_loop| Arc::new(event_loop) as Arc<dyn Executor>)
}

/// Runs `job` on the slot's executor: inline if there is none (an
/// unregistered or channel-less pipeline, exercised by this module's own
/// unit tests) or if the executor reports the calling thread as already its
/// own; otherwise hands it to the executor's queue.
fn submit(shared: &Arc<PipelineShared>, slot: &Slot, job: impl FnOnce() + Send + 'static) {
    submit_on(effective_executor(shared, slot), job);
}

fn submit_on(executor: Option<Arc<dyn Executor>>, job: impl FnOnce() + Send + 'static) {
    match executor {
        Some(executor) => {
            if executor.execute(Task::new(job)).is_err() {
                trace!("handler invocation dropped: executor no longer accepting tasks");
            }
        }
        None => job(),
    }
}

fn guarded(ctx: &HandlerContext, event: HandlerEvent, f: impl FnOnce()) {
    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        handle_panic(ctx, event, payload);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked with a non-string payload".to_string()
    }
}

/// Converts a caught panic into `exceptionCaught`, except when the panic
/// happened *while already handling* `exceptionCaught` — re-firing it there
/// would recurse forever. This direct check of the event already being
/// dispatched stands in for a re-entrancy counter: the two are equivalent
/// because `exceptionCaught` is the only event whose default action fires
/// itself further along the same direction.
fn handle_panic(ctx: &HandlerContext, event: HandlerEvent, payload: Box<dyn Any + Send>) {
    let message = panic_message(&payload);
    warn!(handler = ctx.name(), ?event, error = %message, "handler invocation panicked");
    if event == HandlerEvent::ExceptionCaught {
        return;
    }
    ctx.fire_exception_caught(CoreError::channel(message));
}

fn dispatch<F>(shared: Arc<PipelineShared>, snapshot: Arc<Snapshot>, from: usize, event: HandlerEvent, forward: bool, action: F)
where
    F: FnOnce(Option<&Arc<dyn Handler>>, &HandlerContext) + Send + 'static,
{
    let index = chain::find_next(&snapshot, from, event, forward);
    let slot = &snapshot.slots[index];
    let handler = slot.handler.clone();
    let ctx = HandlerContext::new(shared.clone(), snapshot.clone(), index);
    submit(&shared, slot, move || {
        guarded(&ctx, event, || action(handler.as_ref(), &ctx));
    });
}

pub(crate) fn propagate_inbound<F>(shared: Arc<PipelineShared>, snapshot: Arc<Snapshot>, from: usize, event: HandlerEvent, action: F)
where
    F: FnOnce(Option<&Arc<dyn Handler>>, &HandlerContext) + Send + 'static,
{
    dispatch(shared, snapshot, from, event, true, action);
}

pub(crate) fn propagate_outbound<F>(shared: Arc<PipelineShared>, snapshot: Arc<Snapshot>, from: usize, event: HandlerEvent, action: F)
where
    F: FnOnce(Option<&Arc<dyn Handler>>, &HandlerContext) + Send + 'static,
{
    dispatch(shared, snapshot, from, event, false, action);
}

/// Outbound write with the cross-thread pending-byte accounting described
/// in spec §4.5/§9: if the target handler does not run on the calling
/// thread, the message's estimated size is added to the channel's outbound
/// pending counter *before* the write is handed off, so a caller's
/// subsequent `isWritable()` already reflects it. That increment is raw
/// (spec §4.6/§5 requires the writability-edge check itself to run on the
/// channel's own loop, never on the submitting thread), so the edge is only
/// evaluated once execution reaches the executor — first against the
/// pre-debited total, then again immediately after the same amount is
/// subtracted back, right before the normal `OutboundBuffer` accounting
/// (which happens once the write reaches the pipeline head and is pushed
/// for real) takes back over. Net zero once drained, but visible as
/// backpressure in between.
pub(crate) fn propagate_write(shared: Arc<PipelineShared>, snapshot: Arc<Snapshot>, from: usize, msg: PipelineMessage, promise: Promise<()>) {
    let index = chain::find_next(&snapshot, from, HandlerEvent::Write, false);
    let slot = &snapshot.slots[index];
    let handler = slot.handler.clone();
    let ctx = HandlerContext::new(shared.clone(), snapshot.clone(), index);
    let executor = effective_executor(&shared, slot);
    let crosses_thread = executor.as_ref().is_some_and(|e| !e.in_event_loop());
    let pre_debited = crosses_thread
        .then(|| shared.channel())
        .flatten()
        .map(|channel| {
            let size = channel.estimate_size(&msg);
            channel.outbound_add_pending_raw(size);
            (channel, size)
        });
    let event = HandlerEvent::Write;
    submit_on(executor, move || {
        if let Some((channel, size)) = pre_debited {
            channel.outbound_check_writability();
            channel.outbound_sub_pending(size);
        }
        guarded(&ctx, event, || match handler.as_ref() {
            Some(h) => h.write(&ctx, msg, promise),
            None => terminal_write(&ctx, msg, promise),
        });
    });
}

/// Fires `handlerAdded`/`handlerRemoved` for `handler`. Takes the handler
/// explicitly rather than reading `snapshot.slots[index].handler`: on the
/// removal path that slot has already been unlinked and cleared (see
/// `chain::unlink`), and on the replace path it may already hold the
/// *new* handler by the time this runs, so re-reading it would either find
/// nothing or fire on the wrong handler.
pub(crate) fn notify_lifecycle(shared: &Arc<PipelineShared>, snapshot: &Arc<Snapshot>, index: usize, handler: Arc<dyn Handler>, added: bool) {
    let slot = &snapshot.slots[index];
    let ctx = HandlerContext::new(shared.clone(), snapshot.clone(), index);
    submit(shared, slot, move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            if added {
                handler.handler_added(&ctx)
            } else {
                handler.handler_removed(&ctx)
            }
        }));
        if let Err(payload) = result {
            warn!(handler = ctx.name(), added, error = %panic_message(&payload), "handler lifecycle callback panicked");
            ctx.fire_exception_caught(CoreError::channel(panic_message(&payload)));
        }
    });
}

fn channel_of(ctx: &HandlerContext) -> Option<Channel> {
    ctx.shared.channel().map(|inner| Channel { inner })
}

pub(crate) fn terminal_no_op(ctx: &HandlerContext, event: HandlerEvent) {
    trace!(handler = ctx.name(), ?event, "event reached pipeline end, no-op");
}

pub(crate) fn terminal_channel_read(ctx: &HandlerContext, msg: PipelineMessage) {
    trace!(handler = ctx.name(), "channelRead reached pipeline tail, discarding message");
    drop(msg);
}

pub(crate) fn terminal_user_event(ctx: &HandlerContext, evt: UserEvent) {
    trace!(handler = ctx.name(), "userEventTriggered reached pipeline tail, discarding event");
    drop(evt);
}

pub(crate) fn terminal_exception_caught(ctx: &HandlerContext, cause: CoreError) {
    warn!(handler = ctx.name(), error = %cause, "exceptionCaught reached pipeline tail unhandled");
}

pub(crate) fn terminal_bind(ctx: &HandlerContext, addr: SocketAddr, promise: Promise<()>) {
    match channel_of(ctx) {
        Some(channel) => channel.inner.transport.bind(&channel, addr, promise),
        None => promise.try_complete(Err(CoreError::ClosedChannel)),
    }
}

pub(crate) fn terminal_connect(ctx: &HandlerContext, remote: SocketAddr, local: Option<SocketAddr>, promise: Promise<()>) {
    match channel_of(ctx) {
        Some(channel) => channel.inner.transport.connect(&channel, remote, local, promise),
        None => promise.try_complete(Err(CoreError::ClosedChannel)),
    }
}

pub(crate) fn terminal_disconnect(ctx: &HandlerContext, promise: Promise<()>) {
    match channel_of(ctx) {
        Some(channel) => channel.inner.transport.disconnect(&channel, promise),
        None => promise.try_complete(Err(CoreError::ClosedChannel)),
    }
}

pub(crate) fn terminal_close(ctx: &HandlerContext, promise: Promise<()>) {
    match channel_of(ctx) {
        Some(channel) => channel.inner.transport.close(&channel, promise),
        None => promise.try_complete(Ok(())),
    }
}

pub(crate) fn terminal_deregister(ctx: &HandlerContext, promise: Promise<()>) {
    match channel_of(ctx) {
        Some(channel) => channel.inner.transport.deregister(&channel, promise),
        None => promise.try_complete(Ok(())),
    }
}

pub(crate) fn terminal_read(ctx: &HandlerContext) {
    if let Some(channel) = channel_of(ctx) {
        channel.inner.transport.begin_read(&channel);
    }
}

pub(crate) fn terminal_write(ctx: &HandlerContext, msg: PipelineMessage, promise: Promise<()>) {
    match channel_of(ctx) {
        Some(channel) => channel.inner.transport.write(&channel, msg, promise),
        None => promise.try_complete(Err(CoreError::ClosedChannel)),
    }
}

pub(crate) fn terminal_flush(ctx: &HandlerContext) {
    if let Some(channel) = channel_of(ctx) {
        channel.inner.transport.flush(&channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::chain::Pipeline;
    use std::sync::Weak;

    struct Panics;
    impl Handler for Panics {
        fn channel_active(&self, _ctx: &HandlerContext) {
            panic!("boom");
        }
    }

    struct CatchesExceptions(Arc<std::sync::Mutex<Option<String>>>);
    impl Handler for CatchesExceptions {
        fn exception_caught(&self, _ctx: &HandlerContext, cause: CoreError) {
            *self.0.lock().unwrap() = Some(cause.to_string());
        }
    }

    #[test]
    fn panic_in_handler_is_routed_to_exception_caught() {
        let pipeline = Pipeline::new(Weak::new());
        let captured = Arc::new(std::sync::Mutex::new(None));
        pipeline.add_last("panics", Arc::new(Panics)).unwrap();
        pipeline.add_last("catches", Arc::new(CatchesExceptions(captured.clone()))).unwrap();
        pipeline.head_context().fire_channel_active();
        assert!(captured.lock().unwrap().is_some());
    }

    struct PanicsOnException;
    impl Handler for PanicsOnException {
        fn exception_caught(&self, _ctx: &HandlerContext, _cause: CoreError) {
            panic!("exception handler itself panics");
        }
    }

    #[test]
    fn panic_while_handling_exception_caught_does_not_recurse() {
        let pipeline = Pipeline::new(Weak::new());
        pipeline.add_last("panics-on-exception", Arc::new(PanicsOnException)).unwrap();
        // Must return rather than loop forever.
        pipeline.head_context().fire_exception_caught(CoreError::channel("seed"));
    }
}
