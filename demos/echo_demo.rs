//! Minimal end-to-end demonstration: two loopback channels on a shared
//! event loop, an echo handler on one side, a response-printing handler on
//! the other.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use transport_core::buffer::PipelineMessage;
use transport_core::pipeline::{Handler, HandlerContext};
use transport_core::runtime::EventLoop;
use transport_core::transport::loopback_pair;
use transport_core::ChannelMetadata;

struct Echo;

impl Handler for Echo {
    fn channel_read(&self, ctx: &HandlerContext, msg: PipelineMessage) {
        if let PipelineMessage::Bytes(bytes) = &msg {
            tracing::info!(payload = ?String::from_utf8_lossy(bytes), "server echoing back");
        }
        ctx.write(msg, transport_core::Promise::new());
        ctx.flush();
    }
}

struct PrintResponses;

impl Handler for PrintResponses {
    fn channel_read(&self, ctx: &HandlerContext, msg: PipelineMessage) {
        if let PipelineMessage::Bytes(bytes) = &msg {
            println!("client received: {}", String::from_utf8_lossy(&bytes));
        }
        ctx.fire_channel_read(msg);
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let event_loop = EventLoop::with_default_interval("echo-demo");
    let (client, server) = loopback_pair("client", "server", ChannelMetadata::stream());

    client.register(event_loop.clone()).unwrap();
    server.register(event_loop.clone()).unwrap();

    server.pipeline().add_last("echo", Arc::new(Echo)).unwrap();
    client.pipeline().add_last("printer", Arc::new(PrintResponses)).unwrap();

    client.mark_active();
    server.mark_active();

    client
        .write_and_flush(PipelineMessage::Bytes(Bytes::from_static(b"hello from client")))
        .wait()
        .expect("write to succeed");

    // Give the loop thread a moment to deliver the echoed response before
    // the process exits.
    std::thread::sleep(Duration::from_millis(100));

    event_loop
        .shutdown_gracefully(Duration::from_millis(50), Duration::from_secs(2))
        .wait()
        .expect("clean shutdown");
}
