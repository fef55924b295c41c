//! Receive-buffer sizing and read-loop continuation (spec §4.1).

use std::sync::OnceLock;

use bytes::BytesMut;

use crate::buffer::BufferAllocator;
use crate::config::ChannelConfig;

/// Per-read-loop contract: size the next allocation, track how much was
/// read, and decide whether the loop should keep reading.
///
/// A negative `last_bytes_read` (passed to [`record_bytes_read`]) marks an
/// external termination (EOF or error) and suppresses further continuation
/// regardless of any other condition (spec §4.1 "Edge").
pub trait ReceiveBufferSizer: Send {
    /// Zeroes per-loop counters and captures `max_messages_per_read` from
    /// `config`.
    fn reset(&mut self, config: &ChannelConfig);

    /// The byte count to request for the next read.
    fn guess(&self) -> usize;

    /// Allocates a buffer of [`guess`](Self::guess) bytes from `alloc`.
    fn allocate(&self, alloc: &dyn BufferAllocator) -> BytesMut {
        alloc.buffer(self.guess())
    }

    /// Records that `n` distinct messages were read in this attempt.
    fn inc_messages_read(&mut self, n: u32);

    /// Records the outcome of the last read attempt: `k` bytes read, or a
    /// negative value for EOF/error.
    fn record_bytes_read(&mut self, k: isize);

    /// Whether the read loop should attempt another read.
    fn continue_reading(&self, auto_read: bool) -> bool;

    /// Finalises the loop, feeding read history into the next guess.
    fn read_complete(&mut self);
}

const I32_MAX: i64 = i32::MAX as i64;

/// Fixed-size sizer: always guesses the same capacity, never adapts. Useful
/// for datagram transports where message size is already capped by the
/// protocol (e.g. UDP MTU).
#[derive(Debug, Clone)]
pub struct FixedReceiveBufferSizer {
    size: usize,
    max_messages_per_read: u32,
    total_messages: u32,
    attempted_bytes_read: usize,
    last_bytes_read: isize,
    total_bytes_read: i64,
}

impl FixedReceiveBufferSizer {
    pub fn new(size: usize) -> Self {
        FixedReceiveBufferSizer {
            size,
            max_messages_per_read: 1,
            total_messages: 0,
            attempted_bytes_read: 0,
            last_bytes_read: 0,
            total_bytes_read: 0,
        }
    }
}

impl ReceiveBufferSizer for FixedReceiveBufferSizer {
    fn reset(&mut self, config: &ChannelConfig) {
        self.max_messages_per_read = config.max_messages_per_read();
        self.total_messages = 0;
        self.total_bytes_read = 0;
        self.last_bytes_read = 0;
    }

    fn guess(&self) -> usize {
        self.size
    }

    fn inc_messages_read(&mut self, n: u32) {
        self.total_messages += n;
    }

    fn record_bytes_read(&mut self, k: isize) {
        self.attempted_bytes_read = self.size;
        self.last_bytes_read = k;
        if k > 0 {
            self.total_bytes_read = (self.total_bytes_read + k as i64).min(I32_MAX);
        }
    }

    fn continue_reading(&self, auto_read: bool) -> bool {
        auto_read
            && self.last_bytes_read >= 0
            && self.attempted_bytes_read as isize == self.last_bytes_read
            && self.total_messages < self.max_messages_per_read
            && self.total_bytes_read < I32_MAX
    }

    fn read_complete(&mut self) {}
}

/// Discrete geometric size table the adaptive sizer walks one index at a
/// time, built once at first use. Early entries grow by doubling (16 B up
/// to 512 B); from there growth is linear in 4096 B steps up to 64 MiB,
/// matching the original allocator's table shape (SPEC_FULL §3).
fn size_table() -> &'static [usize] {
    static TABLE: OnceLock<Vec<usize>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = Vec::new();
        let mut v: usize = 16;
        while v < 512 {
            table.push(v);
            v *= 2;
        }
        let mut v: usize = 512;
        while v <= 64 * 1024 * 1024 {
            table.push(v);
            v += 4096;
        }
        table
    })
}

/// Adaptive sizer: grows the next guess when the previous read filled the
/// buffer (signal that more data is likely waiting), shrinks it after two
/// consecutive reads that undershoot by a wide margin, and never leaves the
/// table's bounds.
#[derive(Debug, Clone)]
pub struct AdaptiveReceiveBufferSizer {
    min_index: usize,
    max_index: usize,
    index: usize,
    decrease_now: bool,
    max_messages_per_read: u32,
    total_messages: u32,
    attempted_bytes_read: usize,
    last_bytes_read: isize,
    total_bytes_read: i64,
}

impl AdaptiveReceiveBufferSizer {
    pub fn new(minimum: usize, initial: usize, maximum: usize) -> Self {
        let table = size_table();
        let index_for = |target: usize| -> usize {
            table
                .iter()
                .position(|&v| v >= target)
                .unwrap_or(table.len() - 1)
        };
        let min_index = index_for(minimum);
        let max_index = index_for(maximum).max(min_index);
        let index = index_for(initial).clamp(min_index, max_index);
        AdaptiveReceiveBufferSizer {
            min_index,
            max_index,
            index,
            decrease_now: false,
            max_messages_per_read: 1,
            total_messages: 0,
            attempted_bytes_read: 0,
            last_bytes_read: 0,
            total_bytes_read: 0,
        }
    }

    fn current_size(&self) -> usize {
        size_table()[self.index]
    }
}

impl Default for AdaptiveReceiveBufferSizer {
    fn default() -> Self {
        // 64 B minimum, 1 KiB initial, 64 MiB maximum: matches the
        // defaults a transport-agnostic core can assume are safe for both
        // datagram and byte-stream channels.
        Self::new(64, 1024, 64 * 1024 * 1024)
    }
}

impl ReceiveBufferSizer for AdaptiveReceiveBufferSizer {
    fn reset(&mut self, config: &ChannelConfig) {
        self.max_messages_per_read = config.max_messages_per_read();
        self.total_messages = 0;
        self.total_bytes_read = 0;
        self.last_bytes_read = 0;
    }

    fn guess(&self) -> usize {
        self.current_size()
    }

    fn inc_messages_read(&mut self, n: u32) {
        self.total_messages += n;
    }

    fn record_bytes_read(&mut self, k: isize) {
        self.attempted_bytes_read = self.current_size();
        self.last_bytes_read = k;
        if k > 0 {
            self.total_bytes_read = (self.total_bytes_read + k as i64).min(I32_MAX);
        }
    }

    fn continue_reading(&self, auto_read: bool) -> bool {
        auto_read
            && self.last_bytes_read >= 0
            && self.attempted_bytes_read as isize == self.last_bytes_read
            && self.total_messages < self.max_messages_per_read
            && self.total_bytes_read < I32_MAX
    }

    fn read_complete(&mut self) {
        let filled = self.attempted_bytes_read as isize == self.last_bytes_read;
        if filled {
            // The buffer was exhausted: grow immediately, and cancel any
            // pending shrink decision.
            self.decrease_now = false;
            self.index = (self.index + 1).min(self.max_index);
        } else if self.last_bytes_read >= 0
            && (self.last_bytes_read as usize) < self.current_size() / 2
        {
            // Undershot by a full table step: require two consecutive
            // undershoots before shrinking, to avoid oscillating on bursty
            // traffic.
            if self.decrease_now {
                self.index = self.index.saturating_sub(1).max(self.min_index);
                self.decrease_now = false;
            } else {
                self.decrease_now = true;
            }
        } else {
            self.decrease_now = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_sizer_stops_on_eof() {
        let mut sizer = FixedReceiveBufferSizer::new(512);
        sizer.record_bytes_read(-1);
        assert!(!sizer.continue_reading(true));
    }

    #[test]
    fn fixed_sizer_stops_after_max_messages() {
        let mut sizer = FixedReceiveBufferSizer::new(512);
        sizer.max_messages_per_read = 1;
        sizer.record_bytes_read(512);
        sizer.inc_messages_read(1);
        assert!(!sizer.continue_reading(true));
    }

    #[test]
    fn adaptive_grows_when_buffer_fills() {
        let mut sizer = AdaptiveReceiveBufferSizer::new(16, 16, 4096);
        let initial = sizer.guess();
        sizer.record_bytes_read(initial as isize);
        sizer.read_complete();
        assert!(sizer.guess() > initial);
    }

    #[test]
    fn adaptive_shrinks_after_two_undershoots() {
        let mut sizer = AdaptiveReceiveBufferSizer::new(16, 4096, 1 << 20);
        let initial = sizer.guess();
        for _ in 0..2 {
            sizer.record_bytes_read(1);
            sizer.read_complete();
        }
        assert!(sizer.guess() < initial);
    }

    #[test]
    fn adaptive_never_exceeds_bounds() {
        let mut sizer = AdaptiveReceiveBufferSizer::new(16, 16, 64);
        for _ in 0..100 {
            let g = sizer.guess();
            sizer.record_bytes_read(g as isize);
            sizer.read_complete();
        }
        assert!(sizer.guess() <= 64);
    }
}
