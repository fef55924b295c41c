//! In-memory loopback [`TransportUnsafe`] implementation. The crate does not
//! ship a real socket transport (spec §1 Non-goal: "concrete transport
//! implementations"); this one exists solely so tests and the bundled demo
//! can exercise a whole channel without a network.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use crate::buffer::PipelineMessage;
use crate::channel::{Channel, ChannelMetadata, TransportUnsafe};
use crate::future::Promise;

/// Delivers everything written on one side straight into the peer's
/// pipeline on `flush`, with no intervening socket or serialization. `bind`
/// and `connect` both just mark the channel active; there is nothing to
/// actually bind or connect to.
pub struct LoopbackTransport {
    peer: OnceLock<Channel>,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(LoopbackTransport { peer: OnceLock::new() })
    }

    /// Wires this transport to deliver to `peer`. Must be called exactly
    /// once, after both channels in a pair exist (see [`loopback_pair`]).
    pub fn link(&self, peer: Channel) {
        self.peer
            .set(peer)
            .unwrap_or_else(|_| panic!("LoopbackTransport::link called more than once"));
    }
}

impl TransportUnsafe for LoopbackTransport {
    fn bind(&self, channel: &Channel, _addr: SocketAddr, promise: Promise<()>) {
        channel.mark_active();
        promise.try_complete(Ok(()));
    }

    fn connect(&self, channel: &Channel, _remote: SocketAddr, _local: Option<SocketAddr>, promise: Promise<()>) {
        channel.mark_active();
        promise.try_complete(Ok(()));
    }

    fn disconnect(&self, channel: &Channel, promise: Promise<()>) {
        channel.mark_inactive();
        promise.try_complete(Ok(()));
    }

    fn close(&self, channel: &Channel, promise: Promise<()>) {
        channel.mark_inactive();
        promise.try_complete(Ok(()));
    }

    fn deregister(&self, _channel: &Channel, promise: Promise<()>) {
        promise.try_complete(Ok(()));
    }

    /// Loopback delivery is push-driven from `flush`, so there is no
    /// separate read demand to honour.
    fn begin_read(&self, _channel: &Channel) {}

    fn write(&self, channel: &Channel, msg: PipelineMessage, promise: Promise<()>) {
        let size = channel.inner.estimate_size(&msg);
        channel.inner.outbound_push(msg, size, promise);
    }

    fn flush(&self, channel: &Channel) {
        let Some(peer) = self.peer.get() else { return };
        let mut delivered_any = false;
        while let Some(msg) = channel.inner.outbound_pop_flushed() {
            delivered_any = true;
            peer.pipeline().head_context().fire_channel_read(msg);
        }
        if delivered_any {
            peer.pipeline().head_context().fire_channel_read_complete();
        }
    }
}

/// Builds two channels wired to deliver to each other, for tests and
/// demos (grounded on the TCP transport's own test-only loopback mock).
pub fn loopback_pair(id_a: impl Into<String>, id_b: impl Into<String>, metadata: ChannelMetadata) -> (Channel, Channel) {
    let transport_a = LoopbackTransport::new();
    let transport_b = LoopbackTransport::new();
    let channel_a = Channel::new(id_a, metadata, transport_a.clone());
    let channel_b = Channel::new(id_b, metadata, transport_b.clone());
    transport_a.link(channel_b.clone());
    transport_b.link(channel_a.clone());
    (channel_a, channel_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Handler, HandlerContext};
    use crate::runtime::EventLoop;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordReads(Arc<AtomicUsize>);
    impl Handler for RecordReads {
        fn channel_read(&self, ctx: &HandlerContext, msg: PipelineMessage) {
            if let PipelineMessage::Bytes(bytes) = &msg {
                assert_eq!(&bytes[..], b"ping");
            }
            self.0.fetch_add(1, Ordering::SeqCst);
            ctx.fire_channel_read(msg);
        }
    }

    #[test]
    fn write_and_flush_delivers_to_peer_pipeline() {
        let (a, b) = loopback_pair("a", "b", ChannelMetadata::stream());
        let event_loop = EventLoop::with_default_interval("test-loopback");
        a.register(event_loop.clone()).unwrap();
        b.register(event_loop.clone()).unwrap();
        let reads = Arc::new(AtomicUsize::new(0));
        b.pipeline().add_last("recorder", Arc::new(RecordReads(reads.clone()))).unwrap();
        a.mark_active();
        b.mark_active();

        a.write_and_flush(PipelineMessage::Bytes(Bytes::from_static(b"ping"))).wait().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(reads.load(Ordering::SeqCst), 1);

        event_loop.shutdown_gracefully(std::time::Duration::from_millis(1), std::time::Duration::from_secs(2)).wait().unwrap();
    }

    #[test]
    fn write_past_high_water_mark_flips_writability() {
        let (a, b) = loopback_pair("a2", "b2", ChannelMetadata::stream());
        assert!(a.is_writable());
        let chunk = vec![0u8; 16 * 1024];
        // Default high water mark is 64 KiB; five 16 KiB chunks cross it
        // without ever being flushed (flushing would drain them again).
        for _ in 0..5 {
            a.write(PipelineMessage::Bytes(Bytes::from(chunk.clone())));
        }
        assert!(!a.is_writable());
        let _ = b;
    }
}
