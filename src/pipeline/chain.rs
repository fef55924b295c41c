//! The pipeline itself: an arena of [`HandlerContext`] slots bracketed by
//! two synthetic sentinels, with lock-free traversal and lock-guarded
//! structural edits (spec §3, §4.3, §9).
//!
//! Structural edits rebuild the slot vector and publish it through an
//! [`arc_swap::ArcSwap`]; event propagation only ever loads the current
//! snapshot once per top-level fire and walks plain indices through it, so
//! traversal never takes the edit lock (spec §5: "event propagation does
//! not" take the pipeline monitor).

use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::debug;

use crate::channel::ChannelInner;
use crate::error::{CoreResult, PipelineError};
use crate::runtime::Executor;

use super::context::HandlerContext;
use super::event::SkipMask;
use super::handler::{self, Handler};

pub(super) const HEAD: usize = 0;
pub(super) const TAIL: usize = 1;
const NONE: usize = usize::MAX;

#[derive(Clone)]
pub(super) struct Slot {
    pub(super) name: Arc<str>,
    pub(super) handler: Option<Arc<dyn Handler>>,
    pub(super) executor_override: Option<Arc<dyn Executor>>,
    pub(super) skip_mask: SkipMask,
    pub(super) prev: usize,
    pub(super) next: usize,
}

pub(super) struct Snapshot {
    pub(super) slots: Vec<Slot>,
}

impl Snapshot {
    fn sentinel_pair() -> Self {
        Snapshot {
            slots: vec![
                Slot {
                    name: Arc::from("head"),
                    handler: None,
                    executor_override: None,
                    skip_mask: SkipMask::NONE,
                    prev: NONE,
                    next: TAIL,
                },
                Slot {
                    name: Arc::from("tail"),
                    handler: None,
                    executor_override: None,
                    skip_mask: SkipMask::NONE,
                    prev: HEAD,
                    next: NONE,
                },
            ],
        }
    }

    fn position_of(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|s| s.handler.is_some() && &*s.name == name)
    }
}

/// Walks from `from` in `direction` (forward = toward tail, used by inbound
/// traversal; backward = toward head, used by outbound) until it finds a
/// slot that is either a sentinel or a real handler not skipping `event`
/// (spec §4.3 invariant iv).
pub(super) fn find_next(snapshot: &Snapshot, from: usize, event: super::event::HandlerEvent, forward: bool) -> usize {
    let mut index = from;
    loop {
        index = if forward { snapshot.slots[index].next } else { snapshot.slots[index].prev };
        debug_assert_ne!(index, NONE, "traversal walked past a sentinel");
        let slot = &snapshot.slots[index];
        match &slot.handler {
            None => return index,
            Some(_) if slot.skip_mask.contains(event) => continue,
            Some(_) => return index,
        }
    }
}

/// State shared by the [`Pipeline`] handle and every [`HandlerContext`]
/// constructed against it.
pub(crate) struct PipelineShared {
    pub(crate) channel: Weak<ChannelInner>,
    edit_lock: Mutex<()>,
    snapshot: ArcSwap<Snapshot>,
    pending_added: Mutex<Vec<Arc<str>>>,
}

impl PipelineShared {
    pub(crate) fn channel(&self) -> Option<Arc<ChannelInner>> {
        self.channel.upgrade()
    }

    pub(crate) fn load(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }
}

enum InsertPos<'a> {
    First,
    Last,
    Before(&'a str),
    After(&'a str),
}

/// Ordered, non-empty chain of handler entries for one channel (spec §3).
#[derive(Clone)]
pub struct Pipeline {
    pub(crate) shared: Arc<PipelineShared>,
}

impl Pipeline {
    pub(crate) fn new(channel: Weak<ChannelInner>) -> Self {
        Pipeline {
            shared: Arc::new(PipelineShared {
                channel,
                edit_lock: Mutex::new(()),
                snapshot: ArcSwap::new(Arc::new(Snapshot::sentinel_pair())),
                pending_added: Mutex::new(Vec::new()),
            }),
        }
    }

    fn is_registered(&self) -> bool {
        self.shared.channel().is_some_and(|c| c.event_loop().is_some())
    }

    /// A transient context positioned at the head sentinel, used to kick
    /// off inbound propagation from outside any handler (the transport
    /// layer, or [`crate::channel::Channel`]'s lifecycle methods).
    pub fn head_context(&self) -> HandlerContext {
        HandlerContext::new(self.shared.clone(), self.shared.load(), HEAD)
    }

    /// A transient context positioned at the tail sentinel, used to kick
    /// off outbound propagation from application code calling
    /// [`crate::channel::Channel::write`] and friends directly.
    pub fn tail_context(&self) -> HandlerContext {
        HandlerContext::new(self.shared.clone(), self.shared.load(), TAIL)
    }

    pub fn add_first(&self, name: impl Into<String>, handler: Arc<dyn Handler>) -> CoreResult<()> {
        self.insert(InsertPos::First, name.into(), handler, None)
    }

    pub fn add_last(&self, name: impl Into<String>, handler: Arc<dyn Handler>) -> CoreResult<()> {
        self.insert(InsertPos::Last, name.into(), handler, None)
    }

    pub fn add_before(&self, anchor: &str, name: impl Into<String>, handler: Arc<dyn Handler>) -> CoreResult<()> {
        self.insert(InsertPos::Before(anchor), name.into(), handler, None)
    }

    pub fn add_after(&self, anchor: &str, name: impl Into<String>, handler: Arc<dyn Handler>) -> CoreResult<()> {
        self.insert(InsertPos::After(anchor), name.into(), handler, None)
    }

    /// Like [`add_last`](Self::add_last), but pins the handler to run on
    /// `executor` instead of defaulting to the channel's event loop (spec
    /// §3 "the executor it must run on").
    pub fn add_last_on(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
        executor: Arc<dyn Executor>,
    ) -> CoreResult<()> {
        self.insert(InsertPos::Last, name.into(), handler, Some(executor))
    }

    fn insert(
        &self,
        pos: InsertPos<'_>,
        name: String,
        handler: Arc<dyn Handler>,
        executor_override: Option<Arc<dyn Executor>>,
    ) -> CoreResult<()> {
        handler::mark_added(&handler)?;
        let _guard = self.shared.edit_lock.lock();
        let old = self.shared.load();
        if old.position_of(&name).is_some() {
            handler::mark_removed(&handler);
            return Err(PipelineError::DuplicateName(name).into());
        }
        let mut slots: Vec<Slot> = old.slots.clone();
        let new_index = slots.len();
        slots.push(Slot {
            name: Arc::from(name.as_str()),
            handler: Some(handler.clone()),
            executor_override,
            skip_mask: handler.skip_mask(),
            prev: NONE,
            next: NONE,
        });
        let anchor_index = match pos {
            InsertPos::First => {
                link_after(&mut slots, HEAD, new_index);
                new_index
            }
            InsertPos::Last => {
                link_before(&mut slots, TAIL, new_index);
                new_index
            }
            InsertPos::Before(anchor) => {
                let anchor_index = old.position_of(anchor).ok_or_else(|| {
                    handler::mark_removed(&handler);
                    PipelineError::HandlerNotFound(anchor.to_string())
                })?;
                link_before(&mut slots, anchor_index, new_index);
                new_index
            }
            InsertPos::After(anchor) => {
                let anchor_index = old.position_of(anchor).ok_or_else(|| {
                    handler::mark_removed(&handler);
                    PipelineError::HandlerNotFound(anchor.to_string())
                })?;
                link_after(&mut slots, anchor_index, new_index);
                new_index
            }
        };
        let _ = anchor_index;
        let snapshot = Arc::new(Snapshot { slots });
        self.shared.snapshot.store(snapshot.clone());
        if self.is_registered() {
            drop(_guard);
            self.fire_added(&snapshot, new_index, handler);
        } else {
            self.shared.pending_added.lock().push(snapshot.slots[new_index].name.clone());
            drop(_guard);
        }
        debug!(handler = %name, "handler added to pipeline");
        Ok(())
    }

    pub fn remove(&self, name: &str) -> CoreResult<Arc<dyn Handler>> {
        let _guard = self.shared.edit_lock.lock();
        let old = self.shared.load();
        let idx = old.position_of(name).ok_or_else(|| PipelineError::HandlerNotFound(name.to_string()))?;
        let removed = old.slots[idx].handler.clone().expect("position_of only matches real handlers");
        let mut slots: Vec<Slot> = old.slots.clone();
        unlink(&mut slots, idx);
        let was_pending = {
            let mut pending = self.shared.pending_added.lock();
            if let Some(pos) = pending.iter().position(|n| &**n == name) {
                pending.remove(pos);
                true
            } else {
                false
            }
        };
        let snapshot = Arc::new(Snapshot { slots });
        self.shared.snapshot.store(snapshot.clone());
        drop(_guard);
        handler::mark_removed(&removed);
        if !was_pending {
            // Only notify removal if handlerAdded was (or will have been)
            // observed; a handler removed before the channel ever
            // registered never saw handlerAdded, so it is skipped here
            // too (spec §8 "handlerAdded precedes ... handlerRemoved
            // follows the last [dispatch]").
            self.fire_removed(&snapshot, idx, removed.clone());
        }
        debug!(handler = %name, "handler removed from pipeline");
        Ok(removed)
    }

    pub fn replace(
        &self,
        old_name: &str,
        new_name: impl Into<String>,
        new_handler: Arc<dyn Handler>,
    ) -> CoreResult<Arc<dyn Handler>> {
        let new_name = new_name.into();
        handler::mark_added(&new_handler)?;
        let _guard = self.shared.edit_lock.lock();
        let old = self.shared.load();
        let idx = old.position_of(old_name).ok_or_else(|| {
            handler::mark_removed(&new_handler);
            PipelineError::HandlerNotFound(old_name.to_string())
        })?;
        if new_name != old_name && old.position_of(&new_name).is_some() {
            handler::mark_removed(&new_handler);
            return Err(PipelineError::DuplicateName(new_name).into());
        }
        let previous = old.slots[idx].handler.clone().expect("position_of only matches real handlers");
        let mut slots: Vec<Slot> = old.slots.clone();
        slots[idx].name = Arc::from(new_name.as_str());
        slots[idx].handler = Some(new_handler.clone());
        slots[idx].skip_mask = new_handler.skip_mask();
        let snapshot = Arc::new(Snapshot { slots });
        self.shared.snapshot.store(snapshot.clone());
        let registered = self.is_registered();
        drop(_guard);
        handler::mark_removed(&previous);
        if registered {
            self.fire_removed(&snapshot, idx, previous.clone());
            self.fire_added(&snapshot, idx, new_handler);
        } else {
            self.shared.pending_added.lock().push(snapshot.slots[idx].name.clone());
        }
        Ok(previous)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        let snapshot = self.shared.load();
        snapshot.position_of(name).and_then(|i| snapshot.slots[i].handler.clone())
    }

    pub fn context(&self, handler: &Arc<dyn Handler>) -> Option<String> {
        let target = handler::handler_identity(handler);
        let snapshot = self.shared.load();
        snapshot
            .slots
            .iter()
            .find(|s| s.handler.as_ref().is_some_and(|h| handler::handler_identity(h) == target))
            .map(|s| s.name.to_string())
    }

    /// Handler names in head-to-tail order.
    pub fn names(&self) -> Vec<String> {
        let snapshot = self.shared.load();
        let mut out = Vec::new();
        let mut index = snapshot.slots[HEAD].next;
        while index != TAIL {
            out.push(snapshot.slots[index].name.to_string());
            index = snapshot.slots[index].next;
        }
        out
    }

    /// Fires the deferred `handlerAdded` callbacks for every handler added
    /// before the channel was registered (spec §4.7 "First-time
    /// registration additionally emits handlerAdded for any handlers
    /// queued pre-registration").
    pub(crate) fn notify_pending_added(&self) {
        let pending: Vec<Arc<str>> = std::mem::take(&mut *self.shared.pending_added.lock());
        let snapshot = self.shared.load();
        for name in pending {
            if let Some(index) = snapshot.position_of(&name) {
                if let Some(handler) = snapshot.slots[index].handler.clone() {
                    self.fire_added(&snapshot, index, handler);
                }
            }
        }
    }

    fn fire_added(&self, snapshot: &Arc<Snapshot>, index: usize, handler: Arc<dyn Handler>) {
        super::invoker::notify_lifecycle(&self.shared, snapshot, index, handler, true);
    }

    fn fire_removed(&self, snapshot: &Arc<Snapshot>, index: usize, handler: Arc<dyn Handler>) {
        super::invoker::notify_lifecycle(&self.shared, snapshot, index, handler, false);
    }
}

fn link_before(slots: &mut [Slot], anchor: usize, new: usize) {
    let prev = slots[anchor].prev;
    slots[new].prev = prev;
    slots[new].next = anchor;
    slots[prev].next = new;
    slots[anchor].prev = new;
}

fn link_after(slots: &mut [Slot], anchor: usize, new: usize) {
    let next = slots[anchor].next;
    slots[new].prev = anchor;
    slots[new].next = next;
    slots[anchor].next = new;
    slots[next].prev = new;
}

/// Relinks `index`'s neighbours around it and clears its handler so the
/// slot no longer satisfies [`Snapshot::position_of`] — otherwise the
/// removed slot keeps `handler: Some(..)` forever (arena entries are never
/// swap-removed, only unlinked), so a later `get`/`add_*` for the same name
/// would see a "still present" handler and either resurrect it or reject a
/// fresh add as a duplicate name.
fn unlink(slots: &mut [Slot], index: usize) {
    let prev = slots[index].prev;
    let next = slots[index].next;
    slots[prev].next = next;
    slots[next].prev = prev;
    slots[index].handler = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::handler::Handler;

    struct Noop;
    impl Handler for Noop {}

    fn test_pipeline() -> Pipeline {
        Pipeline::new(Weak::new())
    }

    #[test]
    fn duplicate_name_rejected_and_leaves_pipeline_unchanged() {
        let pipeline = test_pipeline();
        pipeline.add_last("a", Arc::new(Noop)).unwrap();
        let before = pipeline.names();
        assert!(pipeline.add_last("a", Arc::new(Noop)).is_err());
        assert_eq!(pipeline.names(), before);
    }

    #[test]
    fn add_first_add_last_and_between_order_correctly() {
        let pipeline = test_pipeline();
        pipeline.add_last("b", Arc::new(Noop)).unwrap();
        pipeline.add_first("a", Arc::new(Noop)).unwrap();
        pipeline.add_last("d", Arc::new(Noop)).unwrap();
        pipeline.add_before("d", "c", Arc::new(Noop)).unwrap();
        assert_eq!(pipeline.names(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn remove_relinks_neighbours() {
        let pipeline = test_pipeline();
        pipeline.add_last("a", Arc::new(Noop)).unwrap();
        pipeline.add_last("b", Arc::new(Noop)).unwrap();
        pipeline.add_last("c", Arc::new(Noop)).unwrap();
        pipeline.remove("b").unwrap();
        assert_eq!(pipeline.names(), vec!["a", "c"]);
    }

    #[test]
    fn removed_slot_does_not_linger_as_a_stale_handler() {
        let pipeline = test_pipeline();
        pipeline.add_last("a", Arc::new(Noop)).unwrap();
        pipeline.add_last("b", Arc::new(Noop)).unwrap();
        pipeline.remove("b").unwrap();
        // The removed slot must stop satisfying `position_of`: `get` no
        // longer sees it and a fresh handler may reuse the name.
        assert!(pipeline.get("b").is_none());
        assert!(pipeline.add_last("b", Arc::new(Noop)).is_ok());
        assert_eq!(pipeline.names(), vec!["a", "b"]);
    }

    #[test]
    fn non_sharable_handler_cannot_join_twice() {
        let pipeline = test_pipeline();
        let handler: Arc<dyn Handler> = Arc::new(Noop);
        pipeline.add_last("a", handler.clone()).unwrap();
        let other = test_pipeline();
        assert!(other.add_last("a", handler).is_err());
    }

    // Property test for spec §8: "traversal visits handlers in the correct
    // direction and skips exactly those whose skip-mask bit for E is set."
    mod skip_mask_traversal {
        use super::*;
        use crate::buffer::PipelineMessage;
        use crate::pipeline::context::HandlerContext;
        use crate::pipeline::event::HandlerEvent;
        use proptest::prelude::*;
        use std::sync::Mutex;

        /// Forwards `channelRead` unconditionally and records its own
        /// position every time the invoker actually enters it; `skip_read`
        /// controls the skip-mask bit the invoker checks before entering.
        struct Recorder {
            index: usize,
            skip_read: bool,
            log: Arc<Mutex<Vec<usize>>>,
        }

        impl Handler for Recorder {
            fn is_sharable(&self) -> bool {
                true
            }

            fn skip_mask(&self) -> SkipMask {
                if self.skip_read {
                    SkipMask::NONE.set(HandlerEvent::ChannelRead)
                } else {
                    SkipMask::NONE
                }
            }

            fn channel_read(&self, ctx: &HandlerContext, msg: PipelineMessage) {
                self.log.lock().unwrap().push(self.index);
                ctx.fire_channel_read(msg);
            }
        }

        proptest! {
            #[test]
            fn traversal_visits_exactly_the_non_skipped_subset(skip_flags in proptest::collection::vec(any::<bool>(), 0..24)) {
                let pipeline = test_pipeline();
                let log = Arc::new(Mutex::new(Vec::new()));
                let expected: Vec<usize> = skip_flags
                    .iter()
                    .enumerate()
                    .filter(|(_, skip)| !**skip)
                    .map(|(i, _)| i)
                    .collect();
                for (i, skip_read) in skip_flags.iter().enumerate() {
                    pipeline
                        .add_last(
                            format!("h{i}"),
                            Arc::new(Recorder { index: i, skip_read: *skip_read, log: log.clone() }),
                        )
                        .unwrap();
                }
                pipeline
                    .head_context()
                    .fire_channel_read(PipelineMessage::User(Box::new(())));
                prop_assert_eq!(&*log.lock().unwrap(), &expected);
            }
        }
    }
}
