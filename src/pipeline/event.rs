//! The pipeline's event vocabulary and the per-handler skip-mask bitset
//! (spec §4.3).

use std::any::Any;

/// Inbound (head → tail) and outbound (tail → head) events a
/// [`Handler`](super::handler::Handler) may intercept. The discriminant
/// fixes the bit position used by [`SkipMask`]; `handlerAdded` /
/// `handlerRemoved` are lifecycle notifications and are deliberately not
/// members of this enum (spec §4.3: "not propagated").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandlerEvent {
    ChannelRegistered = 0,
    ChannelUnregistered = 1,
    ChannelActive = 2,
    ChannelInactive = 3,
    ChannelRead = 4,
    ChannelReadComplete = 5,
    ChannelWritabilityChanged = 6,
    UserEventTriggered = 7,
    ExceptionCaught = 8,
    Bind = 9,
    Connect = 10,
    Disconnect = 11,
    Close = 12,
    Deregister = 13,
    Read = 14,
    Write = 15,
    Flush = 16,
}

impl HandlerEvent {
    pub const COUNT: usize = 17;

    pub const INBOUND: [HandlerEvent; 9] = [
        HandlerEvent::ChannelRegistered,
        HandlerEvent::ChannelUnregistered,
        HandlerEvent::ChannelActive,
        HandlerEvent::ChannelInactive,
        HandlerEvent::ChannelRead,
        HandlerEvent::ChannelReadComplete,
        HandlerEvent::ChannelWritabilityChanged,
        HandlerEvent::UserEventTriggered,
        HandlerEvent::ExceptionCaught,
    ];

    pub const OUTBOUND: [HandlerEvent; 8] = [
        HandlerEvent::Bind,
        HandlerEvent::Connect,
        HandlerEvent::Disconnect,
        HandlerEvent::Close,
        HandlerEvent::Deregister,
        HandlerEvent::Read,
        HandlerEvent::Write,
        HandlerEvent::Flush,
    ];

    pub fn is_inbound(self) -> bool {
        (self as u8) <= (HandlerEvent::ExceptionCaught as u8)
    }

    pub fn is_outbound(self) -> bool {
        !self.is_inbound()
    }

    fn bit(self) -> u32 {
        1 << (self as u8)
    }
}

/// Per-(handler, event) bitset: bit set means the handler's implementation
/// of that event is an identity forwarder (re-fires to the neighbour
/// without doing anything else), so the invoker can skip straight past it
/// during traversal instead of entering and immediately re-dispatching.
///
/// Computed once per handler *type* (spec §4.3 "Computed once per class and
/// cached"); since Rust has no runtime reflection over trait method
/// overrides, each [`Handler`](super::handler::Handler) impl declares its
/// own mask via [`Handler::skip_mask`](super::handler::Handler::skip_mask)
/// (spec §9's "static table ... populated by asking the handler
/// implementation to declare which events it forwards identically").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SkipMask(u32);

impl SkipMask {
    pub const NONE: SkipMask = SkipMask(0);
    pub const ALL: SkipMask = SkipMask((1u32 << HandlerEvent::COUNT) - 1);

    pub const fn none() -> Self {
        SkipMask::NONE
    }

    pub const fn all() -> Self {
        SkipMask::ALL
    }

    #[must_use]
    pub fn set(self, event: HandlerEvent) -> Self {
        SkipMask(self.0 | event.bit())
    }

    #[must_use]
    pub fn clear(self, event: HandlerEvent) -> Self {
        SkipMask(self.0 & !event.bit())
    }

    pub fn contains(self, event: HandlerEvent) -> bool {
        self.0 & event.bit() != 0
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        SkipMask(self.0 | other.0)
    }
}

/// Type-erased application event carried by `userEventTriggered`, mirroring
/// [`crate::buffer::PipelineMessage::User`].
pub struct UserEvent(pub Box<dyn Any + Send>);

impl UserEvent {
    pub fn new<T: Any + Send>(value: T) -> Self {
        UserEvent(Box::new(value))
    }

    pub fn downcast<T: Any>(self) -> Result<Box<T>, Self> {
        if self.0.is::<T>() {
            Ok(self.0.downcast::<T>().expect("is:: just checked"))
        } else {
            Err(self)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_mask_contains_every_event() {
        for event in HandlerEvent::INBOUND.into_iter().chain(HandlerEvent::OUTBOUND) {
            assert!(SkipMask::ALL.contains(event));
            assert!(!SkipMask::NONE.contains(event));
        }
    }

    #[test]
    fn clear_then_set_round_trips() {
        let mask = SkipMask::ALL.clear(HandlerEvent::ChannelRead);
        assert!(!mask.contains(HandlerEvent::ChannelRead));
        assert!(mask.contains(HandlerEvent::ChannelActive));
        let mask = mask.set(HandlerEvent::ChannelRead);
        assert!(mask.contains(HandlerEvent::ChannelRead));
    }

    #[test]
    fn inbound_outbound_partition_is_exhaustive() {
        assert_eq!(HandlerEvent::INBOUND.len() + HandlerEvent::OUTBOUND.len(), HandlerEvent::COUNT);
    }
}
