//! Bit-exact channel option names (spec §6).
//!
//! Each constant is a function rather than a `static` because
//! [`ChannelOption::named`] registers the name in the process-wide pool on
//! first use; a `fn` keeps that registration lazy without requiring a
//! `Lazy`/`OnceLock` per option name. Call sites still read like constants:
//! `config.set(&options::tcp_nodelay(), true)`.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::{BufferAllocator, MessageSizeEstimator, ReceiveBufferSizer};
use crate::config::ChannelOption;

/// Factory stored under [`rcvbuf_allocator`], producing a fresh
/// [`ReceiveBufferSizer`] per channel (sizers carry per-channel read
/// history, so they cannot be shared between channels the way a
/// `BufferAllocator` can).
pub type RecvBufferSizerFactory = Arc<dyn Fn() -> Box<dyn ReceiveBufferSizer> + Send + Sync>;

macro_rules! channel_option {
    ($fn_name:ident, $name:literal, $ty:ty) => {
        pub fn $fn_name() -> ChannelOption<$ty> {
            ChannelOption::named($name)
        }
    };
}

channel_option!(allocator, "ALLOCATOR", Arc<dyn BufferAllocator>);
channel_option!(rcvbuf_allocator, "RCVBUF_ALLOCATOR", RecvBufferSizerFactory);
channel_option!(message_size_estimator, "MESSAGE_SIZE_ESTIMATOR", Arc<dyn MessageSizeEstimator>);
channel_option!(connect_timeout, "CONNECT_TIMEOUT", Duration);
channel_option!(write_spin_count, "WRITE_SPIN_COUNT", u32);
channel_option!(write_buffer_high_water_mark, "WRITE_BUFFER_HIGH_WATER_MARK", usize);
channel_option!(write_buffer_low_water_mark, "WRITE_BUFFER_LOW_WATER_MARK", usize);
channel_option!(allow_half_closure, "ALLOW_HALF_CLOSURE", bool);
channel_option!(auto_read, "AUTO_READ", bool);
channel_option!(so_broadcast, "SO_BROADCAST", bool);
channel_option!(so_keepalive, "SO_KEEPALIVE", bool);
channel_option!(so_sndbuf, "SO_SNDBUF", i32);
channel_option!(so_rcvbuf, "SO_RCVBUF", i32);
channel_option!(so_reuseaddr, "SO_REUSEADDR", bool);
channel_option!(so_reuseport, "SO_REUSEPORT", bool);
channel_option!(so_linger, "SO_LINGER", i32);
channel_option!(so_backlog, "SO_BACKLOG", i32);
channel_option!(so_timeout, "SO_TIMEOUT", Duration);
channel_option!(ip_tos, "IP_TOS", i32);
channel_option!(ip_multicast_addr, "IP_MULTICAST_ADDR", IpAddr);
channel_option!(ip_multicast_if, "IP_MULTICAST_IF", IpAddr);
channel_option!(ip_multicast_ttl, "IP_MULTICAST_TTL", i32);
channel_option!(ip_multicast_loop_disabled, "IP_MULTICAST_LOOP_DISABLED", bool);
channel_option!(tcp_nodelay, "TCP_NODELAY", bool);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_names_are_bit_exact() {
        assert_eq!(allocator().name(), "ALLOCATOR");
        assert_eq!(tcp_nodelay().name(), "TCP_NODELAY");
        assert_eq!(ip_multicast_loop_disabled().name(), "IP_MULTICAST_LOOP_DISABLED");
    }
}
