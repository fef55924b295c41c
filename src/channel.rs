//! Channel data model and the transport-unsafe interface external
//! transports implement (spec §3, §6).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use tracing::{debug, info};

use crate::buffer::{BufferAllocator, HeapBufferAllocator, MessageSizeEstimator, PipelineMessage};
use crate::config::ChannelConfig;
use crate::error::{CoreError, CoreResult};
use crate::future::Promise;
use crate::outbound::OutboundBuffer;
use crate::pipeline::Pipeline;
use crate::runtime::EventLoop;

/// Distinguishes datagram-shaped channels from byte-stream ones, chiefly to
/// pick a sane default for `max_messages_per_read` (SPEC_FULL §3: the
/// original gives datagram channels 1, byte-stream channels 16).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// A byte-stream (e.g. TCP): reads may be split/coalesced arbitrarily.
    Stream,
    /// A discrete-message transport (e.g. UDP): each read is one message.
    Message,
}

/// Read-only facts about a channel's transport, set once at construction
/// (spec §3 "Carries a Metadata record").
#[derive(Debug, Clone, Copy)]
pub struct ChannelMetadata {
    pub kind: ChannelKind,
    pub default_max_messages_per_read: u32,
    /// Whether half-closure (readable-but-not-writable, or vice versa) is a
    /// meaningful state for this transport.
    pub supports_half_closure: bool,
}

impl ChannelMetadata {
    pub fn stream() -> Self {
        ChannelMetadata {
            kind: ChannelKind::Stream,
            default_max_messages_per_read: 16,
            supports_half_closure: true,
        }
    }

    pub fn message() -> Self {
        ChannelMetadata {
            kind: ChannelKind::Message,
            default_max_messages_per_read: 1,
            supports_half_closure: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    /// Allocated but not yet registered with an event loop.
    Initialized = 0,
    /// Registered with a loop, not yet active (e.g. connect in flight).
    Registered = 1,
    /// Fully open for I/O.
    Active = 2,
    /// No longer active; may still have unflushed outbound entries.
    Inactive = 3,
    /// Terminated; all resources released.
    Closed = 4,
}

impl ChannelState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ChannelState::Initialized,
            1 => ChannelState::Registered,
            2 => ChannelState::Active,
            3 => ChannelState::Inactive,
            _ => ChannelState::Closed,
        }
    }
}

/// The external interface concrete transports implement and the pipeline
/// head's default outbound behaviour forwards to (spec §6). Out of scope
/// for this crate to implement concretely (§1); [`crate::transport`]
/// provides an in-memory loopback implementation for tests and the demo.
pub trait TransportUnsafe: Send + Sync {
    fn bind(&self, channel: &Channel, addr: SocketAddr, promise: Promise<()>);
    fn connect(&self, channel: &Channel, remote: SocketAddr, local: Option<SocketAddr>, promise: Promise<()>);
    fn disconnect(&self, channel: &Channel, promise: Promise<()>);
    fn close(&self, channel: &Channel, promise: Promise<()>);
    fn deregister(&self, channel: &Channel, promise: Promise<()>);
    fn begin_read(&self, channel: &Channel);
    /// Pushes `msg` into the channel's outbound buffer (the transport owns
    /// the decision of when to actually hand bytes to the socket, which
    /// happens in `flush`).
    fn write(&self, channel: &Channel, msg: PipelineMessage, promise: Promise<()>);
    fn flush(&self, channel: &Channel);
}

/// Internals shared by every [`Channel`] handle clone. Not exposed outside
/// the crate: external code only ever sees [`Channel`] and [`Pipeline`]/
/// [`crate::pipeline::HandlerContext`].
pub(crate) struct ChannelInner {
    pub(crate) id: String,
    pub(crate) metadata: ChannelMetadata,
    pub(crate) config: ChannelConfig,
    pub(crate) outbound: parking_lot::Mutex<OutboundBuffer>,
    pub(crate) pipeline: Pipeline,
    state: AtomicU8,
    pub(crate) event_loop: ArcSwapOption<EventLoop>,
    pub(crate) transport: Arc<dyn TransportUnsafe>,
    pub(crate) allocator: Arc<dyn BufferAllocator>,
    pub(crate) message_size_estimator: Arc<dyn MessageSizeEstimator>,
}

impl ChannelInner {
    pub(crate) fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn event_loop(&self) -> Option<EventLoop> {
        self.event_loop.load_full().as_deref().cloned()
    }

    pub(crate) fn estimate_size(&self, msg: &PipelineMessage) -> usize {
        self.message_size_estimator.size(msg)
    }

    /// Adds `size` to the outbound buffer's pending counter and, if the
    /// crossing flips writability, fires `channelWritabilityChanged`
    /// inbound (spec §4.6).
    pub(crate) fn outbound_add_pending(self: &Arc<Self>, size: usize) {
        let edge = self.outbound.lock().add_pending_and_check(size);
        self.fire_writability_edge(edge);
    }

    /// Bumps the pending-byte counter without evaluating or firing a
    /// writability edge. Used only for the cross-thread write pre-debit
    /// (spec §4.5/§9): the counter must update immediately so the
    /// submitting thread's subsequent `isWritable()` reflects it, but the
    /// edge check itself must run on the channel's own loop (spec §4.6/§5),
    /// via [`ChannelInner::outbound_check_writability`] once the write
    /// reaches it.
    pub(crate) fn outbound_add_pending_raw(self: &Arc<Self>, size: usize) {
        self.outbound.lock().add_pending(size);
    }

    /// Evaluates the current writability edge and fires
    /// `channelWritabilityChanged` if it crossed. Callers must only invoke
    /// this from the channel's own loop.
    pub(crate) fn outbound_check_writability(self: &Arc<Self>) {
        let edge = self.outbound.lock().check_writability();
        self.fire_writability_edge(edge);
    }

    pub(crate) fn outbound_sub_pending(self: &Arc<Self>, size: usize) {
        let edge = self.outbound.lock().sub_pending_and_check(size);
        self.fire_writability_edge(edge);
    }

    /// Queues `msg` on this channel's outbound buffer, firing
    /// `channelWritabilityChanged` if the push flips the writability edge.
    /// The transport-facing counterpart of [`outbound_pop_flushed`].
    pub(crate) fn outbound_push(self: &Arc<Self>, msg: PipelineMessage, size: usize, promise: Promise<()>) {
        let edge = self.outbound.lock().push(msg, size, promise);
        self.fire_writability_edge(edge);
    }

    /// Pops the oldest queued write for an in-memory or test transport to
    /// deliver, firing `channelWritabilityChanged` if draining it flips the
    /// edge back to writable.
    pub(crate) fn outbound_pop_flushed(self: &Arc<Self>) -> Option<PipelineMessage> {
        let (msg, edge) = self.outbound.lock().pop_flushed()?;
        self.fire_writability_edge(edge);
        Some(msg)
    }

    pub(crate) fn fire_writability_edge(self: &Arc<Self>, edge: crate::outbound::WritabilityEdge) {
        if edge != crate::outbound::WritabilityEdge::Unchanged {
            self.pipeline.head_context().fire_channel_writability_changed();
        }
    }
}

/// A single network endpoint: one pipeline, one config, one outbound
/// buffer, at most one event-loop assignment (spec §3). Cheap to clone
/// (`Arc`-backed); clones refer to the same underlying channel.
#[derive(Clone)]
pub struct Channel {
    pub(crate) inner: Arc<ChannelInner>,
}

impl Channel {
    pub fn new(
        id: impl Into<String>,
        metadata: ChannelMetadata,
        transport: Arc<dyn TransportUnsafe>,
    ) -> Self {
        Self::with_allocator(id, metadata, transport, Arc::new(HeapBufferAllocator))
    }

    pub fn with_allocator(
        id: impl Into<String>,
        metadata: ChannelMetadata,
        transport: Arc<dyn TransportUnsafe>,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Self {
        let id = id.into();
        let config = ChannelConfig::new();
        config.set_max_messages_per_read(metadata.default_max_messages_per_read);
        let high = config.write_buffer_high_water_mark();
        let low = config.write_buffer_low_water_mark();
        let estimator: Arc<dyn MessageSizeEstimator> =
            Arc::new(crate::buffer::DefaultMessageSizeEstimator::default());
        let inner = Arc::new_cyclic(|weak: &Weak<ChannelInner>| ChannelInner {
            id,
            metadata,
            config,
            outbound: parking_lot::Mutex::new(OutboundBuffer::new(high, low)),
            pipeline: Pipeline::new(weak.clone()),
            state: AtomicU8::new(ChannelState::Initialized as u8),
            event_loop: ArcSwapOption::from(None),
            transport,
            allocator,
            message_size_estimator: estimator,
        });
        Channel { inner }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn metadata(&self) -> ChannelMetadata {
        self.inner.metadata
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    pub fn is_writable(&self) -> bool {
        self.inner.outbound.lock().is_writable()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    pub fn allocator(&self) -> Arc<dyn BufferAllocator> {
        self.inner.allocator.clone()
    }

    pub fn event_loop(&self) -> Option<EventLoop> {
        self.inner.event_loop()
    }

    /// Attaches this channel to `event_loop` (spec §4.7 "registerAsync").
    /// Drains any `handlerAdded` callbacks queued by handlers added before
    /// registration, then fires `channelRegistered` inbound.
    pub fn register(&self, event_loop: EventLoop) -> CoreResult<()> {
        if self.inner.event_loop.load().is_some() {
            return Err(CoreError::channel("channel already registered"));
        }
        self.inner.event_loop.store(Some(Arc::new(event_loop)));
        self.inner.set_state(ChannelState::Registered);
        self.inner.pipeline.notify_pending_added();
        debug!(channel = %self.id(), "channel registered");
        self.inner.pipeline.head_context().fire_channel_registered();
        Ok(())
    }

    pub fn mark_active(&self) {
        self.inner.set_state(ChannelState::Active);
        info!(channel = %self.id(), "channel active");
        self.inner.pipeline.head_context().fire_channel_active();
    }

    pub fn mark_inactive(&self) {
        self.inner.set_state(ChannelState::Inactive);
        self.inner.outbound.lock().close();
        self.inner.pipeline.head_context().fire_channel_inactive();
    }

    pub fn bind(&self, addr: SocketAddr) -> Promise<()> {
        let promise = Promise::new();
        self.inner.pipeline.tail_context().bind(addr, promise.clone());
        promise
    }

    /// Initiates connect, racing it against `CONNECT_TIMEOUT` (spec §5, §8
    /// scenario 2). If the timeout fires first, the promise completes with
    /// `ConnectTimeout`, the channel is marked inactive, and
    /// `exceptionCaught` fires once; if the transport's own connect
    /// completes first, the pending timeout task is cancelled.
    pub fn connect(&self, remote: SocketAddr, local: Option<SocketAddr>) -> Promise<()> {
        let promise = Promise::new();
        self.arm_connect_timeout(&promise);
        self.inner.pipeline.tail_context().connect(remote, local, promise.clone());
        promise
    }

    fn arm_connect_timeout(&self, promise: &Promise<()>) {
        let Some(event_loop) = self.event_loop() else { return };
        let timeout = self.inner.config.connect_timeout();
        let inner = self.inner.clone();
        let promise_for_timer = promise.clone();
        let scheduled = event_loop.schedule(
            timeout,
            crate::runtime::Task::new(move || {
                if promise_for_timer.try_complete(Err(CoreError::ConnectTimeout { elapsed: timeout })) {
                    inner.set_state(ChannelState::Inactive);
                    inner.pipeline.head_context().fire_exception_caught(CoreError::ConnectTimeout { elapsed: timeout });
                }
            }),
        );
        if let Ok(token) = scheduled {
            promise.add_listener(move |_| token.cancel());
        }
    }

    pub fn disconnect(&self) -> Promise<()> {
        let promise = Promise::new();
        self.inner.pipeline.tail_context().disconnect(promise.clone());
        promise
    }

    pub fn close(&self) -> Promise<()> {
        let promise = Promise::new();
        self.inner.pipeline.tail_context().close(promise.clone());
        promise
    }

    pub fn deregister(&self) -> Promise<()> {
        let promise = Promise::new();
        self.inner.pipeline.tail_context().deregister(promise.clone());
        promise
    }

    pub fn read(&self) {
        self.inner.pipeline.tail_context().read();
    }

    pub fn write(&self, msg: PipelineMessage) -> Promise<()> {
        let promise = Promise::new();
        self.inner.pipeline.tail_context().write(msg, promise.clone());
        promise
    }

    pub fn write_and_flush(&self, msg: PipelineMessage) -> Promise<()> {
        let promise = self.write(msg);
        self.flush();
        promise
    }

    pub fn flush(&self) {
        self.inner.pipeline.tail_context().flush();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Handler, HandlerContext};
    use crate::runtime::EventLoop;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Never completes `connect`, so only the arm_connect_timeout path can
    /// resolve the promise (spec §8 scenario 2).
    struct NeverConnects;
    impl TransportUnsafe for NeverConnects {
        fn bind(&self, _channel: &Channel, _addr: SocketAddr, _promise: Promise<()>) {}
        fn connect(&self, _channel: &Channel, _remote: SocketAddr, _local: Option<SocketAddr>, _promise: Promise<()>) {}
        fn disconnect(&self, _channel: &Channel, promise: Promise<()>) {
            promise.try_complete(Ok(()));
        }
        fn close(&self, _channel: &Channel, promise: Promise<()>) {
            promise.try_complete(Ok(()));
        }
        fn deregister(&self, _channel: &Channel, promise: Promise<()>) {
            promise.try_complete(Ok(()));
        }
        fn begin_read(&self, _channel: &Channel) {}
        fn write(&self, _channel: &Channel, _msg: PipelineMessage, promise: Promise<()>) {
            promise.try_complete(Ok(()));
        }
        fn flush(&self, _channel: &Channel) {}
    }

    struct CountExceptions(Arc<AtomicUsize>);
    impl Handler for CountExceptions {
        fn exception_caught(&self, ctx: &HandlerContext, cause: CoreError) {
            self.0.fetch_add(1, Ordering::SeqCst);
            ctx.fire_exception_caught(cause);
        }
    }

    #[test]
    fn connect_times_out_when_transport_never_completes() {
        let channel = Channel::new("stalls", ChannelMetadata::stream(), Arc::new(NeverConnects));
        channel.inner.config.set(&crate::config::options::connect_timeout(), Duration::from_millis(10));
        let exceptions = Arc::new(AtomicUsize::new(0));
        channel.pipeline().add_last("counter", Arc::new(CountExceptions(exceptions.clone()))).unwrap();
        let event_loop = EventLoop::with_default_interval("test-connect-timeout");
        channel.register(event_loop.clone()).unwrap();

        let start = std::time::Instant::now();
        let promise = channel.connect("127.0.0.1:9".parse().unwrap(), None);
        let result = promise.wait_timeout(Duration::from_secs(1));
        assert!(matches!(result, Some(Err(CoreError::ConnectTimeout { .. }))));
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(channel.state(), ChannelState::Inactive);
        assert_eq!(exceptions.load(Ordering::SeqCst), 1);

        event_loop.shutdown_gracefully(Duration::from_millis(1), Duration::from_secs(2)).wait().unwrap();
    }
}
