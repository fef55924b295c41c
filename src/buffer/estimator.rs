//! Outbound message size estimation (spec §4.2).

use crate::buffer::PipelineMessage;

/// Pure function `size(msg) -> usize`. Used by [`OutboundBuffer`](crate::outbound::OutboundBuffer)
/// to cost each pending write without knowing the message's concrete type.
pub trait MessageSizeEstimator: Send + Sync {
    fn size(&self, msg: &PipelineMessage) -> usize;
}

/// Recognises byte-buffer messages (returns their readable length);
/// anything else costs `unknown_size` (default 0), matching spec §4.2 for
/// messages the transport cannot cost (e.g. already-decoded user objects).
#[derive(Debug, Clone, Copy)]
pub struct DefaultMessageSizeEstimator {
    unknown_size: usize,
}

impl DefaultMessageSizeEstimator {
    pub const fn new(unknown_size: usize) -> Self {
        DefaultMessageSizeEstimator { unknown_size }
    }
}

impl Default for DefaultMessageSizeEstimator {
    fn default() -> Self {
        DefaultMessageSizeEstimator::new(0)
    }
}

impl MessageSizeEstimator for DefaultMessageSizeEstimator {
    fn size(&self, msg: &PipelineMessage) -> usize {
        msg.readable_bytes().unwrap_or(self.unknown_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn costs_byte_buffers_by_length() {
        let estimator = DefaultMessageSizeEstimator::default();
        let msg = PipelineMessage::Bytes(Bytes::from_static(b"hello"));
        assert_eq!(estimator.size(&msg), 5);
    }

    #[test]
    fn unknown_messages_use_configured_default() {
        let estimator = DefaultMessageSizeEstimator::new(42);
        let msg = PipelineMessage::User(Box::new(7u32));
        assert_eq!(estimator.size(&msg), 42);
    }
}
