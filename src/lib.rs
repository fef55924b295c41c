//! Transport core: pipeline dispatch, event-loop scheduling, and channel
//! configuration/flow-control for an async network I/O framework.
//!
//! Concrete socket transports, TLS, codecs, and bootstrap DSLs are external
//! collaborators; this crate specifies and implements only the three hard
//! parts: the handler pipeline, the event-loop/loop-group scheduling model,
//! and channel configuration with receive/write flow control.

pub mod buffer;
pub mod channel;
pub mod config;
pub mod error;
pub mod future;
pub mod outbound;
pub mod pipeline;
pub mod runtime;
pub mod transport;

pub use channel::{Channel, ChannelKind, ChannelMetadata, ChannelState};
pub use config::{ChannelConfig, ChannelOption};
pub use error::{CoreError, CoreResult};
pub use future::{CompletionSignal, Promise};
pub use outbound::OutboundBuffer;
pub use pipeline::{HandlerContext, Pipeline};
pub use runtime::{EventLoop, EventLoopGroup};
