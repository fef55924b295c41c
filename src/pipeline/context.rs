//! A handler's view of its position in a pipeline: the `ctx.fireXxx()` and
//! outbound-initiator methods a [`Handler`](super::handler::Handler)
//! implementation calls to keep propagation moving (spec §4.3, §4.4).

use std::net::SocketAddr;
use std::sync::Arc;

use crate::buffer::PipelineMessage;
use crate::channel::Channel;
use crate::error::CoreError;
use crate::future::Promise;

use super::chain::{PipelineShared, Snapshot};
use super::event::{HandlerEvent, UserEvent};
use super::invoker;

/// A transient handle into one slot of one pipeline [`Snapshot`]. Cheap to
/// construct; a fresh one is built for every handler a propagating event
/// reaches, so none outlive the snapshot they were built against (spec §9:
/// "a context captured before a structural edit still refers to its own,
/// now-superseded, arena generation").
pub struct HandlerContext {
    pub(super) shared: Arc<PipelineShared>,
    pub(super) snapshot: Arc<Snapshot>,
    pub(super) index: usize,
}

impl HandlerContext {
    pub(super) fn new(shared: Arc<PipelineShared>, snapshot: Arc<Snapshot>, index: usize) -> Self {
        HandlerContext { shared, snapshot, index }
    }

    /// The handler's name in the pipeline at the time this context was
    /// built, or `"head"`/`"tail"` for a sentinel-positioned context.
    pub fn name(&self) -> &str {
        &self.snapshot.slots[self.index].name
    }

    /// The owning channel, if it is still alive (it always is for a context
    /// reached through normal propagation; `None` only if the channel was
    /// already fully dropped, which cannot happen while a `HandlerContext`
    /// referencing it is live, but is expressed as `Option` rather than
    /// assumed to keep this module independent of that invariant).
    pub fn channel(&self) -> Option<Channel> {
        self.shared.channel().map(|inner| Channel { inner })
    }

    // ---- inbound propagation -------------------------------------------

    pub fn fire_channel_registered(&self) {
        invoker::propagate_inbound(self.shared.clone(), self.snapshot.clone(), self.index, HandlerEvent::ChannelRegistered, |handler, ctx| match handler {
            Some(h) => h.channel_registered(ctx),
            None => invoker::terminal_no_op(ctx, HandlerEvent::ChannelRegistered),
        });
    }

    pub fn fire_channel_unregistered(&self) {
        invoker::propagate_inbound(self.shared.clone(), self.snapshot.clone(), self.index, HandlerEvent::ChannelUnregistered, |handler, ctx| match handler {
            Some(h) => h.channel_unregistered(ctx),
            None => invoker::terminal_no_op(ctx, HandlerEvent::ChannelUnregistered),
        });
    }

    pub fn fire_channel_active(&self) {
        invoker::propagate_inbound(self.shared.clone(), self.snapshot.clone(), self.index, HandlerEvent::ChannelActive, |handler, ctx| match handler {
            Some(h) => h.channel_active(ctx),
            None => invoker::terminal_no_op(ctx, HandlerEvent::ChannelActive),
        });
    }

    pub fn fire_channel_inactive(&self) {
        invoker::propagate_inbound(self.shared.clone(), self.snapshot.clone(), self.index, HandlerEvent::ChannelInactive, |handler, ctx| match handler {
            Some(h) => h.channel_inactive(ctx),
            None => invoker::terminal_no_op(ctx, HandlerEvent::ChannelInactive),
        });
    }

    pub fn fire_channel_read(&self, msg: PipelineMessage) {
        invoker::propagate_inbound(self.shared.clone(), self.snapshot.clone(), self.index, HandlerEvent::ChannelRead, move |handler, ctx| match handler {
            Some(h) => h.channel_read(ctx, msg),
            None => invoker::terminal_channel_read(ctx, msg),
        });
    }

    pub fn fire_channel_read_complete(&self) {
        invoker::propagate_inbound(self.shared.clone(), self.snapshot.clone(), self.index, HandlerEvent::ChannelReadComplete, |handler, ctx| match handler {
            Some(h) => h.channel_read_complete(ctx),
            None => invoker::terminal_no_op(ctx, HandlerEvent::ChannelReadComplete),
        });
    }

    pub fn fire_channel_writability_changed(&self) {
        invoker::propagate_inbound(self.shared.clone(), self.snapshot.clone(), self.index, HandlerEvent::ChannelWritabilityChanged, |handler, ctx| match handler {
            Some(h) => h.channel_writability_changed(ctx),
            None => invoker::terminal_no_op(ctx, HandlerEvent::ChannelWritabilityChanged),
        });
    }

    pub fn fire_user_event_triggered(&self, evt: UserEvent) {
        invoker::propagate_inbound(self.shared.clone(), self.snapshot.clone(), self.index, HandlerEvent::UserEventTriggered, move |handler, ctx| match handler {
            Some(h) => h.user_event_triggered(ctx, evt),
            None => invoker::terminal_user_event(ctx, evt),
        });
    }

    pub fn fire_exception_caught(&self, cause: CoreError) {
        invoker::propagate_inbound(self.shared.clone(), self.snapshot.clone(), self.index, HandlerEvent::ExceptionCaught, move |handler, ctx| match handler {
            Some(h) => h.exception_caught(ctx, cause),
            None => invoker::terminal_exception_caught(ctx, cause),
        });
    }

    // ---- outbound propagation -------------------------------------------

    pub fn bind(&self, addr: SocketAddr, promise: Promise<()>) {
        invoker::propagate_outbound(self.shared.clone(), self.snapshot.clone(), self.index, HandlerEvent::Bind, move |handler, ctx| match handler {
            Some(h) => h.bind(ctx, addr, promise),
            None => invoker::terminal_bind(ctx, addr, promise),
        });
    }

    pub fn connect(&self, remote: SocketAddr, local: Option<SocketAddr>, promise: Promise<()>) {
        invoker::propagate_outbound(self.shared.clone(), self.snapshot.clone(), self.index, HandlerEvent::Connect, move |handler, ctx| match handler {
            Some(h) => h.connect(ctx, remote, local, promise),
            None => invoker::terminal_connect(ctx, remote, local, promise),
        });
    }

    pub fn disconnect(&self, promise: Promise<()>) {
        invoker::propagate_outbound(self.shared.clone(), self.snapshot.clone(), self.index, HandlerEvent::Disconnect, move |handler, ctx| match handler {
            Some(h) => h.disconnect(ctx, promise),
            None => invoker::terminal_disconnect(ctx, promise),
        });
    }

    pub fn close(&self, promise: Promise<()>) {
        invoker::propagate_outbound(self.shared.clone(), self.snapshot.clone(), self.index, HandlerEvent::Close, move |handler, ctx| match handler {
            Some(h) => h.close(ctx, promise),
            None => invoker::terminal_close(ctx, promise),
        });
    }

    pub fn deregister(&self, promise: Promise<()>) {
        invoker::propagate_outbound(self.shared.clone(), self.snapshot.clone(), self.index, HandlerEvent::Deregister, move |handler, ctx| match handler {
            Some(h) => h.deregister(ctx, promise),
            None => invoker::terminal_deregister(ctx, promise),
        });
    }

    pub fn read(&self) {
        invoker::propagate_outbound(self.shared.clone(), self.snapshot.clone(), self.index, HandlerEvent::Read, |handler, ctx| match handler {
            Some(h) => h.read(ctx),
            None => invoker::terminal_read(ctx),
        });
    }

    /// Initiates an outbound write (spec §4.5). Unlike the other outbound
    /// events this one tracks pending bytes across a thread hop so
    /// `isWritable()` reflects a queued-but-not-yet-processed write
    /// immediately rather than only once the target loop drains it — see
    /// [`invoker::propagate_write`].
    pub fn write(&self, msg: PipelineMessage, promise: Promise<()>) {
        invoker::propagate_write(self.shared.clone(), self.snapshot.clone(), self.index, msg, promise);
    }

    pub fn flush(&self) {
        invoker::propagate_outbound(self.shared.clone(), self.snapshot.clone(), self.index, HandlerEvent::Flush, |handler, ctx| match handler {
            Some(h) => h.flush(ctx),
            None => invoker::terminal_flush(ctx),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::chain::Pipeline;
    use crate::pipeline::handler::Handler;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Weak;

    struct CountingRead(Arc<AtomicUsize>);
    impl Handler for CountingRead {
        fn channel_read(&self, ctx: &HandlerContext, msg: PipelineMessage) {
            self.0.fetch_add(1, Ordering::SeqCst);
            ctx.fire_channel_read(msg);
        }
    }

    #[test]
    fn channel_read_propagates_through_handler_to_tail() {
        let pipeline = Pipeline::new(Weak::new());
        let count = Arc::new(AtomicUsize::new(0));
        pipeline.add_last("counter", Arc::new(CountingRead(count.clone()))).unwrap();
        pipeline
            .head_context()
            .fire_channel_read(PipelineMessage::User(Box::new(42i32)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fire_from_tail_context_reaches_no_handler_and_does_not_panic() {
        let pipeline = Pipeline::new(Weak::new());
        pipeline.head_context().fire_channel_active();
    }
}
