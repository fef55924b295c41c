//! Typed, thread-safe channel configuration (spec §4.6, §6).

pub mod options;

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;

pub use options::*;

/// Process-wide identity for an option name. The pool is append-only and
/// lock-free for lookup (spec §9 "Global option pool"): once a name has
/// been seen, subsequent lookups never block on insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OptionId(u32);

struct OptionPool {
    ids: DashMap<&'static str, OptionId>,
    next: AtomicU32,
}

impl OptionPool {
    fn id_for(&self, name: &'static str) -> OptionId {
        if let Some(existing) = self.ids.get(name) {
            return *existing;
        }
        let candidate = OptionId(self.next.fetch_add(1, Ordering::Relaxed));
        *self.ids.entry(name).or_insert(candidate)
    }
}

fn pool() -> &'static OptionPool {
    static POOL: OnceLock<OptionPool> = OnceLock::new();
    POOL.get_or_init(|| OptionPool {
        ids: DashMap::new(),
        next: AtomicU32::new(0),
    })
}

/// A typed, string-named configuration key. `T` never appears in a stored
/// value directly — it only constrains `ChannelConfig::get`/`set` so a
/// caller cannot accidentally read an option back as the wrong type.
pub struct ChannelOption<T> {
    id: OptionId,
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ChannelOption<T> {
    /// Looks up (or, on first use for this name, creates) the option's
    /// identity in the process-wide pool. Safe to call concurrently for the
    /// same name from multiple threads.
    pub fn named(name: &'static str) -> Self {
        ChannelOption {
            id: pool().id_for(name),
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn id(&self) -> OptionId {
        self.id
    }
}

impl<T> Clone for ChannelOption<T> {
    fn clone(&self) -> Self {
        ChannelOption {
            id: self.id,
            name: self.name,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for ChannelOption<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelOption").field("name", &self.name).finish()
    }
}

/// Typed option map for one channel. Reads/writes of individual options are
/// independent (no cross-option locking); each entry is reached through a
/// sharded concurrent map so readers never block writers of a different
/// option (spec §5 "atomic read/write with release/acquire semantics").
pub struct ChannelConfig {
    values: DashMap<OptionId, Arc<dyn Any + Send + Sync>>,
    /// Not a string-named channel option (spec §6 only names socket- and
    /// buffer-level options): `maxMessagesPerRead` defaults from the
    /// channel's `Metadata` (spec §3, §6) and is stored directly here so
    /// [`crate::channel::ChannelMetadata::bind_defaults`] can seed it
    /// without going through the generic pool.
    max_messages_per_read: AtomicU32,
}

impl fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("options_set", &self.values.len())
            .finish()
    }
}

impl ChannelConfig {
    pub fn new() -> Self {
        let config = ChannelConfig {
            values: DashMap::new(),
            max_messages_per_read: AtomicU32::new(16),
        };
        config.apply_defaults();
        config
    }

    fn apply_defaults(&self) {
        self.set(&options::connect_timeout(), Duration::from_secs(30));
        self.set(&options::write_spin_count(), 16u32);
        self.set(&options::write_buffer_high_water_mark(), 64 * 1024usize);
        self.set(&options::write_buffer_low_water_mark(), 32 * 1024usize);
        self.set(&options::auto_read(), true);
        self.set(&options::allow_half_closure(), false);
    }

    pub fn set<T: Send + Sync + 'static>(&self, option: &ChannelOption<T>, value: T) {
        self.values.insert(option.id(), Arc::new(value));
    }

    pub fn get<T: Clone + Send + Sync + 'static>(&self, option: &ChannelOption<T>) -> Option<T> {
        self.values
            .get(&option.id())
            .and_then(|entry| entry.downcast_ref::<T>().cloned())
    }

    pub fn get_or<T: Clone + Send + Sync + 'static>(&self, option: &ChannelOption<T>, default: T) -> T {
        self.get(option).unwrap_or(default)
    }

    pub fn contains(&self, id: OptionId) -> bool {
        self.values.contains_key(&id)
    }

    // Hot-path convenience accessors used by the receive/write flow-control
    // components; all of them just read through the generic map, but are
    // spelled out because they are consulted on every loop tick.

    pub fn connect_timeout(&self) -> Duration {
        self.get_or(&options::connect_timeout(), Duration::from_secs(30))
    }

    pub fn write_spin_count(&self) -> u32 {
        self.get_or(&options::write_spin_count(), 16)
    }

    pub fn write_buffer_high_water_mark(&self) -> usize {
        self.get_or(&options::write_buffer_high_water_mark(), 64 * 1024)
    }

    pub fn write_buffer_low_water_mark(&self) -> usize {
        self.get_or(&options::write_buffer_low_water_mark(), 32 * 1024)
    }

    pub fn auto_read(&self) -> bool {
        self.get_or(&options::auto_read(), true)
    }

    pub fn allow_half_closure(&self) -> bool {
        self.get_or(&options::allow_half_closure(), false)
    }

    pub fn max_messages_per_read(&self) -> u32 {
        self.max_messages_per_read.load(Ordering::Acquire)
    }

    pub fn set_max_messages_per_read(&self, value: u32) {
        self.max_messages_per_read.store(value, Ordering::Release);
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_name_yields_same_id() {
        let a: ChannelOption<u32> = ChannelOption::named("X_TEST_OPTION");
        let b: ChannelOption<u32> = ChannelOption::named("X_TEST_OPTION");
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn different_names_yield_different_ids() {
        let a: ChannelOption<u32> = ChannelOption::named("X_TEST_OPTION_A");
        let b: ChannelOption<u32> = ChannelOption::named("X_TEST_OPTION_B");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn defaults_are_populated() {
        let config = ChannelConfig::new();
        assert_eq!(config.write_buffer_high_water_mark(), 64 * 1024);
        assert_eq!(config.write_buffer_low_water_mark(), 32 * 1024);
        assert!(config.auto_read());
    }

    #[test]
    fn set_then_get_round_trips() {
        let config = ChannelConfig::new();
        config.set(&options::tcp_nodelay(), true);
        assert_eq!(config.get(&options::tcp_nodelay()), Some(true));
    }
}
