//! Handler contract: the 16 (well, 17 — see [`HandlerEvent`]) pipeline
//! events, each with a default identity-forwarding implementation (spec
//! §4.3, §9).

use std::net::SocketAddr;

use crate::buffer::PipelineMessage;
use crate::error::CoreError;
use crate::future::Promise;

use super::context::HandlerContext;
use super::event::{SkipMask, UserEvent};

/// Polymorphic over the full event set; a concrete handler overrides only
/// the events it cares about and declares, via [`skip_mask`](Handler::skip_mask),
/// which of the rest it merely forwards unchanged — letting the invoker
/// fast-skip it for those events instead of entering it only to re-fire.
///
/// The default implementation of every event method simply forwards to the
/// next context in the traversal direction, so a handler that overrides
/// nothing behaves as a transparent pass-through.
pub trait Handler: Send + Sync + 'static {
    /// Whether this handler is safe to add to more than one pipeline
    /// concurrently. Non-sharable handlers fail insertion if already added
    /// anywhere (spec §4.3 "Sharable constraint").
    fn is_sharable(&self) -> bool {
        false
    }

    /// Declares which events this handler forwards identically, letting the
    /// invoker fast-skip it for those during traversal. Defaults to "skip
    /// nothing": Rust has no reflection over which trait methods an impl
    /// overrides, so assuming a skip by default would silently drop real
    /// handler logic for any handler that overrides an event method but
    /// forgets to also override this one. A handler that genuinely forwards
    /// some events identically opts in explicitly by overriding this method.
    fn skip_mask(&self) -> SkipMask {
        SkipMask::NONE
    }

    /// Fires once after this handler is linked into a pipeline. Not part of
    /// the propagated event set.
    fn handler_added(&self, _ctx: &HandlerContext) {}

    /// Fires once after this handler is unlinked from a pipeline.
    fn handler_removed(&self, _ctx: &HandlerContext) {}

    fn channel_registered(&self, ctx: &HandlerContext) {
        ctx.fire_channel_registered();
    }

    fn channel_unregistered(&self, ctx: &HandlerContext) {
        ctx.fire_channel_unregistered();
    }

    fn channel_active(&self, ctx: &HandlerContext) {
        ctx.fire_channel_active();
    }

    fn channel_inactive(&self, ctx: &HandlerContext) {
        ctx.fire_channel_inactive();
    }

    fn channel_read(&self, ctx: &HandlerContext, msg: PipelineMessage) {
        ctx.fire_channel_read(msg);
    }

    fn channel_read_complete(&self, ctx: &HandlerContext) {
        ctx.fire_channel_read_complete();
    }

    fn channel_writability_changed(&self, ctx: &HandlerContext) {
        ctx.fire_channel_writability_changed();
    }

    fn user_event_triggered(&self, ctx: &HandlerContext, evt: UserEvent) {
        ctx.fire_user_event_triggered(evt);
    }

    fn exception_caught(&self, ctx: &HandlerContext, cause: CoreError) {
        ctx.fire_exception_caught(cause);
    }

    fn bind(&self, ctx: &HandlerContext, addr: SocketAddr, promise: Promise<()>) {
        ctx.bind(addr, promise);
    }

    fn connect(
        &self,
        ctx: &HandlerContext,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        promise: Promise<()>,
    ) {
        ctx.connect(remote, local, promise);
    }

    fn disconnect(&self, ctx: &HandlerContext, promise: Promise<()>) {
        ctx.disconnect(promise);
    }

    fn close(&self, ctx: &HandlerContext, promise: Promise<()>) {
        ctx.close(promise);
    }

    fn deregister(&self, ctx: &HandlerContext, promise: Promise<()>) {
        ctx.deregister(promise);
    }

    fn read(&self, ctx: &HandlerContext) {
        ctx.read();
    }

    fn write(&self, ctx: &HandlerContext, msg: PipelineMessage, promise: Promise<()>) {
        ctx.write(msg, promise);
    }

    fn flush(&self, ctx: &HandlerContext) {
        ctx.flush();
    }
}

/// Global registry enforcing the "non-sharable handler already added"
/// invariant (spec §4.3). Keyed by the handler's `Arc` data address, which
/// stays stable and unique for as long as the handler remains linked into
/// some pipeline (the slot holding that `Arc` is exactly what keeps it
/// alive), so address reuse after a full drop can never collide with a
/// still-added handler.
mod added_registry {
    use std::sync::OnceLock;

    use dashmap::DashSet;

    fn registry() -> &'static DashSet<usize> {
        static REGISTRY: OnceLock<DashSet<usize>> = OnceLock::new();
        REGISTRY.get_or_init(DashSet::new)
    }

    /// Returns `true` if `key` was not already marked added (and is now).
    pub(super) fn try_mark_added(key: usize) -> bool {
        registry().insert(key)
    }

    pub(super) fn mark_removed(key: usize) {
        registry().remove(&key);
    }
}

/// Identity key for a `Arc<dyn Handler>`: the data pointer, with the
/// vtable half of the fat pointer discarded.
pub(crate) fn handler_identity(handler: &std::sync::Arc<dyn Handler>) -> usize {
    std::sync::Arc::as_ptr(handler) as *const () as usize
}

/// Called by [`super::chain::Pipeline`] before linking a handler in.
/// Returns `Err` if the handler is non-sharable and already added
/// somewhere.
pub(crate) fn mark_added(handler: &std::sync::Arc<dyn Handler>) -> Result<(), crate::error::PipelineError> {
    if handler.is_sharable() {
        return Ok(());
    }
    let key = handler_identity(handler);
    if added_registry::try_mark_added(key) {
        Ok(())
    } else {
        Err(crate::error::PipelineError::HandlerAlreadyAdded(format!(
            "non-sharable handler at {key:#x}"
        )))
    }
}

/// Called by [`super::chain::Pipeline`] after unlinking a handler.
pub(crate) fn mark_removed(handler: &std::sync::Arc<dyn Handler>) {
    if !handler.is_sharable() {
        added_registry::mark_removed(handler_identity(handler));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Noop;
    impl Handler for Noop {}

    struct SharableNoop;
    impl Handler for SharableNoop {
        fn is_sharable(&self) -> bool {
            true
        }
    }

    #[test]
    fn non_sharable_handler_rejected_on_second_add() {
        let handler: Arc<dyn Handler> = Arc::new(Noop);
        assert!(mark_added(&handler).is_ok());
        assert!(mark_added(&handler).is_err());
        mark_removed(&handler);
        assert!(mark_added(&handler).is_ok());
        mark_removed(&handler);
    }

    #[test]
    fn sharable_handler_allows_repeated_add() {
        let handler: Arc<dyn Handler> = Arc::new(SharableNoop);
        assert!(mark_added(&handler).is_ok());
        assert!(mark_added(&handler).is_ok());
    }
}
