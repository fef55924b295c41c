//! Buffer allocation, adaptive receive sizing, and message-size estimation
//! (spec §4.1, §4.2, §6 "Allocator interface").
//!
//! Concrete byte-buffer allocator libraries are out of scope (spec §1); this
//! module only specifies the contract consumed by the pipeline and provides
//! a minimal allocator over [`bytes::BytesMut`], whose `Clone`/`Drop`
//! already give the reference-counted `retain`/`release` semantics spec §6
//! asks for.

pub mod estimator;
pub mod recv_sizer;

use std::any::Any;
use std::fmt;

use bytes::{Bytes, BytesMut};

pub use estimator::{DefaultMessageSizeEstimator, MessageSizeEstimator};
pub use recv_sizer::{AdaptiveReceiveBufferSizer, FixedReceiveBufferSizer, ReceiveBufferSizer};

/// A message flowing through the pipeline: either a byte payload (the
/// common case for transport-level handlers) or an arbitrary user message
/// produced by a decoder further up the chain.
pub enum PipelineMessage {
    /// An immutable, reference-counted byte payload (outbound or already
    /// decoded inbound data).
    Bytes(Bytes),
    /// A mutable byte buffer, typically fresh off a receive allocation.
    BytesMut(BytesMut),
    /// An application-level message, type-erased so the pipeline does not
    /// need to be generic over every protocol's decoded type.
    User(Box<dyn Any + Send>),
}

impl PipelineMessage {
    pub fn readable_bytes(&self) -> Option<usize> {
        match self {
            PipelineMessage::Bytes(b) => Some(b.len()),
            PipelineMessage::BytesMut(b) => Some(b.len()),
            PipelineMessage::User(_) => None,
        }
    }
}

impl fmt::Debug for PipelineMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineMessage::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            PipelineMessage::BytesMut(b) => f.debug_tuple("BytesMut").field(&b.len()).finish(),
            PipelineMessage::User(_) => f.write_str("User(..)"),
        }
    }
}

/// Consumed allocator interface (spec §6): `buffer`/`direct_buffer` return a
/// freshly-sized, reference-counted buffer.
pub trait BufferAllocator: Send + Sync {
    fn buffer(&self, capacity: usize) -> BytesMut;

    /// A direct (off heap-GC, not off-process-heap) allocation. This crate
    /// has no GC to avoid, so it is equivalent to `buffer`; a host embedding
    /// this core over a different buffer library may override the
    /// distinction.
    fn direct_buffer(&self, capacity: usize) -> BytesMut {
        self.buffer(capacity)
    }
}

/// The allocator used when a transport does not supply its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapBufferAllocator;

impl BufferAllocator for HeapBufferAllocator {
    fn buffer(&self, capacity: usize) -> BytesMut {
        BytesMut::with_capacity(capacity)
    }
}
