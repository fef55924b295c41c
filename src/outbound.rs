//! Pending-write accounting and writability hysteresis (spec §4.6).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crate::buffer::PipelineMessage;
use crate::error::CoreError;
use crate::future::Promise;

/// One pending write: the message, its estimated size, and the completion
/// signal the writer is waiting on.
struct Entry {
    message: Option<PipelineMessage>,
    size: usize,
    promise: Promise<()>,
}

/// Tracks pending outbound bytes and derives a writability flag from
/// high/low water-marks. `pending_bytes` is a plain atomic so any thread
/// may add/subtract without synchronizing with the channel's loop; the
/// writability *transition* is only ever computed on the loop, which
/// serialises edge detection (spec §4.6, §5).
pub struct OutboundBuffer {
    entries: VecDeque<Entry>,
    pending_bytes: AtomicI64,
    writable: AtomicBool,
    high_water_mark: usize,
    low_water_mark: usize,
    closed: bool,
}

/// Outcome of adding bytes to the buffer: whether this crossing flipped
/// writability, and to what value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritabilityEdge {
    /// No water-mark was crossed; still within the hysteresis band.
    Unchanged,
    /// Crossed `high_water_mark` going up: channel became unwritable.
    BecameUnwritable,
    /// Crossed `low_water_mark` coming down: channel became writable.
    BecameWritable,
}

impl OutboundBuffer {
    pub fn new(high_water_mark: usize, low_water_mark: usize) -> Self {
        assert!(
            low_water_mark <= high_water_mark,
            "low water mark must not exceed high water mark"
        );
        OutboundBuffer {
            entries: VecDeque::new(),
            pending_bytes: AtomicI64::new(0),
            writable: AtomicBool::new(true),
            high_water_mark,
            low_water_mark,
            closed: false,
        }
    }

    pub fn pending_bytes(&self) -> i64 {
        self.pending_bytes.load(Ordering::Acquire)
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds `size` bytes to the pending counter from any thread. Does not
    /// itself decide writability — call [`check_writability`] on the
    /// channel's loop to (re-)evaluate the edge.
    pub fn add_pending(&self, size: usize) {
        self.pending_bytes.fetch_add(size as i64, Ordering::AcqRel);
    }

    pub fn sub_pending(&self, size: usize) {
        self.pending_bytes.fetch_sub(size as i64, Ordering::AcqRel);
    }

    /// Adds `size` and re-checks writability in one step, for callers that
    /// track bytes outside of a queued [`push`](Self::push) entry (e.g. the
    /// cross-thread write accounting in `pipeline::invoker`).
    pub fn add_pending_and_check(&self, size: usize) -> WritabilityEdge {
        self.add_pending(size);
        self.check_writability()
    }

    pub fn sub_pending_and_check(&self, size: usize) -> WritabilityEdge {
        self.sub_pending(size);
        self.check_writability()
    }

    /// Re-evaluates writability against the current `pending_bytes`. Must
    /// only be called on the channel's event loop (spec §4.6: "the
    /// transition check is performed ... on the loop to serialise edge
    /// detection").
    pub fn check_writability(&self) -> WritabilityEdge {
        let pending = self.pending_bytes();
        let was_writable = self.writable.load(Ordering::Acquire);
        if was_writable && pending >= self.high_water_mark as i64 {
            self.writable.store(false, Ordering::Release);
            WritabilityEdge::BecameUnwritable
        } else if !was_writable && pending <= self.low_water_mark as i64 {
            self.writable.store(true, Ordering::Release);
            WritabilityEdge::BecameWritable
        } else {
            WritabilityEdge::Unchanged
        }
    }

    /// Enqueues a write on the loop thread, adding its size to the pending
    /// counter and re-checking writability in one step. Returns the edge so
    /// the caller (the pipeline tail / transport-unsafe) can fire
    /// `channelWritabilityChanged` if it changed.
    pub fn push(&mut self, message: PipelineMessage, size: usize, promise: Promise<()>) -> WritabilityEdge {
        if self.closed {
            promise.try_complete(Err(CoreError::ClosedChannel));
            return WritabilityEdge::Unchanged;
        }
        self.add_pending(size);
        self.entries.push_back(Entry {
            message: Some(message),
            size,
            promise,
        });
        self.check_writability()
    }

    /// Removes the oldest pending entry (a successful flush), subtracting
    /// its size and re-checking writability.
    pub fn pop_flushed(&mut self) -> Option<(PipelineMessage, WritabilityEdge)> {
        let entry = self.entries.pop_front()?;
        self.sub_pending(entry.size);
        let edge = self.check_writability();
        entry.promise.try_complete(Ok(()));
        Some((entry.message.expect("entry always carries a message until popped"), edge))
    }

    /// Fails every unflushed entry with `ClosedChannel` and marks the
    /// buffer closed, as required when the owning channel closes (spec
    /// §3 "OutboundBuffer ... destroyed on channel close").
    pub fn close(&mut self) -> WritabilityEdge {
        self.closed = true;
        while let Some(entry) = self.entries.pop_front() {
            self.sub_pending(entry.size);
            entry.promise.try_complete(Err(CoreError::ClosedChannel));
        }
        self.check_writability()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg() -> PipelineMessage {
        PipelineMessage::User(Box::new(()))
    }

    #[test]
    fn scenario_writability_transitions() {
        // high=100, low=50 per spec §8 scenario 1.
        let buf = OutboundBuffer::new(100, 50);
        buf.add_pending(100);
        assert_eq!(buf.check_writability(), WritabilityEdge::BecameUnwritable);
        buf.sub_pending(50);
        assert_eq!(buf.check_writability(), WritabilityEdge::BecameWritable);
        // Oscillate 60<->80: no further transitions.
        buf.add_pending(60);
        assert_eq!(buf.check_writability(), WritabilityEdge::Unchanged);
        buf.add_pending(20);
        assert_eq!(buf.check_writability(), WritabilityEdge::Unchanged);
        buf.sub_pending(20);
        assert_eq!(buf.check_writability(), WritabilityEdge::Unchanged);
    }

    #[test]
    fn close_fails_pending_entries() {
        let mut buf = OutboundBuffer::new(100, 50);
        let promise = Promise::new();
        buf.push(msg(), 10, promise.clone());
        buf.close();
        assert!(matches!(promise.wait(), Err(CoreError::ClosedChannel)));
    }

    #[test]
    fn push_after_close_fails_immediately() {
        let mut buf = OutboundBuffer::new(100, 50);
        buf.close();
        let promise = Promise::new();
        buf.push(msg(), 10, promise.clone());
        assert!(matches!(promise.wait(), Err(CoreError::ClosedChannel)));
    }

    // Property test for spec §8: "the number of channelWritabilityChanged
    // fires equals the number of crossings of high ... and low ..., with no
    // fires inside the band."
    mod hysteresis {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn edge_count_matches_independently_tracked_crossings(deltas in proptest::collection::vec(-40i64..40i64, 0..80)) {
                let buf = OutboundBuffer::new(100, 50);
                let mut expected_writable = true;
                let mut expected_unwritable_events = 0u32;
                let mut expected_writable_events = 0u32;
                let mut pending: i64 = 0;
                let mut actual_unwritable_events = 0u32;
                let mut actual_writable_events = 0u32;

                for delta in deltas {
                    if delta >= 0 {
                        buf.add_pending(delta as usize);
                    } else {
                        buf.sub_pending(delta.unsigned_abs() as usize);
                    }
                    pending += delta;

                    match buf.check_writability() {
                        WritabilityEdge::BecameUnwritable => actual_unwritable_events += 1,
                        WritabilityEdge::BecameWritable => actual_writable_events += 1,
                        WritabilityEdge::Unchanged => {}
                    }

                    if expected_writable && pending >= 100 {
                        expected_writable = false;
                        expected_unwritable_events += 1;
                    } else if !expected_writable && pending <= 50 {
                        expected_writable = true;
                        expected_writable_events += 1;
                    }
                }

                prop_assert_eq!(actual_unwritable_events, expected_unwritable_events);
                prop_assert_eq!(actual_writable_events, expected_writable_events);
                prop_assert_eq!(buf.is_writable(), expected_writable);
            }
        }
    }
}
