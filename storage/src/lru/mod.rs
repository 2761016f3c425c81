//! A sharded, reference-counted LRU cache.
//!
//! Keys are opaque byte strings. Each key hashes into one of [SHARDS] independently locked shards
//! and the total `capacity` is divided evenly across them. Every entry carries a caller-chosen
//! `charge` that counts against its shard's capacity.
//!
//! # Handles
//!
//! [ShardedCache::insert] and [ShardedCache::lookup] return a [Handle] that pins the entry: a pinned
//! entry is never evicted and its value stays alive even if the key is erased or replaced in the
//! meantime. Cloning a [Handle] takes another reference and dropping it releases one. When the last
//! reference to an entry that is no longer in the table goes away, the entry's [Deleter] runs
//! exactly once.
//!
//! # Eviction
//!
//! Entries only referenced by the cache live on an LRU list; entries with outstanding handles live on
//! a separate in-use list and are skipped by eviction. After every insert (or charge update) the
//! shard evicts from the LRU list until its usage fits the capacity again. Usage may exceed the
//! capacity while enough entries are pinned.
//!
//! # Shutdown
//!
//! Dropping the [ShardedCache] removes every entry. Deleters that run from that point on (including
//! for handles still outstanding) receive [Removal::ShuttingDown] instead of [Removal::Evicted] so
//! values can preserve whatever they own on disk.
//!
//! Deleters never run while a shard lock is held.

use std::sync::Arc;

mod shard;
use shard::Shard;

/// Number of bits of the key hash used to pick a shard.
const SHARD_BITS: u32 = 4;

/// Number of shards in a [ShardedCache].
pub const SHARDS: usize = 1 << SHARD_BITS;

/// Why an entry's deleter is running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Removal {
    /// The entry was evicted, erased, or replaced.
    Evicted,
    /// The cache is being torn down.
    ShuttingDown,
}

/// Called once an entry has left the cache and its last handle was released.
pub type Deleter<T> = Arc<dyn Fn(&[u8], &Arc<T>, Removal) + Send + Sync>;

/// Return the shard a key belongs to.
pub(crate) fn shard_index(key: &[u8]) -> usize {
    (crc32fast::hash(key) >> (32 - SHARD_BITS)) as usize
}

/// A pinned reference to a cache entry.
pub struct Handle<T> {
    shard: Arc<Shard<T>>,
    slot: usize,
    value: Arc<T>,
}

impl<T> Handle<T> {
    /// The value of the pinned entry.
    pub fn value(&self) -> &Arc<T> {
        &self.value
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        self.shard.retain(self.slot);
        Self {
            shard: self.shard.clone(),
            slot: self.slot,
            value: self.value.clone(),
        }
    }
}

impl<T> Drop for Handle<T> {
    fn drop(&mut self) {
        self.shard.release(self.slot);
    }
}

/// A thread-safe, capacity-bounded map from byte keys to reference-counted values.
pub struct ShardedCache<T> {
    shards: Vec<Arc<Shard<T>>>,
}

impl<T> ShardedCache<T> {
    /// Create a cache whose shards share `capacity` evenly.
    pub fn new(capacity: usize) -> Self {
        let per_shard = capacity.div_ceil(SHARDS);
        Self {
            shards: (0..SHARDS).map(|_| Arc::new(Shard::new(per_shard))).collect(),
        }
    }

    fn shard(&self, key: &[u8]) -> &Arc<Shard<T>> {
        &self.shards[shard_index(key)]
    }

    /// Insert `value` under `key`, replacing any previous mapping.
    ///
    /// If `key` already maps to this exact value (same allocation), only the charge is updated and
    /// the deleter is kept. Otherwise the previous entry is removed from the table and its deleter
    /// runs once its last handle is released.
    pub fn insert(&self, key: &[u8], value: Arc<T>, charge: usize, deleter: Deleter<T>) -> Handle<T> {
        let shard = self.shard(key);
        let (slot, value) = shard.insert(key, value, charge, deleter);
        Handle {
            shard: shard.clone(),
            slot,
            value,
        }
    }

    /// Pin the entry stored under `key`, if any, and mark it most recently used.
    pub fn lookup(&self, key: &[u8]) -> Option<Handle<T>> {
        let shard = self.shard(key);
        let (slot, value) = shard.lookup(key)?;
        Some(Handle {
            shard: shard.clone(),
            slot,
            value,
        })
    }

    /// Return the value stored under `key` without keeping the entry pinned.
    pub fn lookup_value(&self, key: &[u8]) -> Option<Arc<T>> {
        self.lookup(key).map(|handle| handle.value().clone())
    }

    /// Set the charge of the entry pinned by `handle`.
    ///
    /// Returns false if `key` now maps to a different entry. If the entry was erased while
    /// `handle` was held, it is put back under `key`.
    pub fn update(&self, key: &[u8], handle: &Handle<T>, charge: usize) -> bool {
        let shard = self.shard(key);
        assert!(
            Arc::ptr_eq(shard, &handle.shard),
            "handle does not belong to key"
        );
        shard.update(key, handle.slot, charge)
    }

    /// Remove `key` from the table. Outstanding handles keep the entry alive.
    pub fn erase(&self, key: &[u8]) {
        self.shard(key).erase(key);
    }

    /// Total charge of all entries in the table.
    pub fn usage(&self) -> usize {
        self.shards.iter().map(|shard| shard.usage()).sum()
    }

    /// Number of entries in the table.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.len()).sum()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for ShardedCache<T> {
    fn drop(&mut self) {
        for shard in &self.shards {
            shard.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::{sync::Mutex, thread};

    type Log = Arc<Mutex<Vec<(Vec<u8>, u32, Removal)>>>;

    fn recorder() -> (Log, Deleter<u32>) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let deleter: Deleter<u32> = {
            let log = log.clone();
            Arc::new(move |key: &[u8], value: &Arc<u32>, removal: Removal| {
                log.lock().unwrap().push((key.to_vec(), **value, removal));
            })
        };
        (log, deleter)
    }

    /// Keys that hash into the same shard.
    fn colliding_keys(count: usize) -> Vec<Vec<u8>> {
        let target = shard_index(b"key-0");
        (0..)
            .map(|i| format!("key-{i}").into_bytes())
            .filter(|key| shard_index(key) == target)
            .take(count)
            .collect()
    }

    #[test_traced]
    fn test_insert_lookup_release() {
        let (log, deleter) = recorder();
        let cache = ShardedCache::new(SHARDS * 100);
        drop(cache.insert(b"a", Arc::new(1), 10, deleter.clone()));
        drop(cache.insert(b"b", Arc::new(2), 20, deleter));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.usage(), 30);

        let handle = cache.lookup(b"a").unwrap();
        assert_eq!(**handle.value(), 1);
        assert_eq!(cache.lookup_value(b"b").as_deref(), Some(&2));
        assert!(cache.lookup(b"c").is_none());
        drop(handle);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test_traced]
    fn test_replace_defers_deleter_until_release() {
        let (log, deleter) = recorder();
        let cache = ShardedCache::new(SHARDS * 100);
        drop(cache.insert(b"k", Arc::new(1), 1, deleter.clone()));
        let pinned = cache.lookup(b"k").unwrap();

        drop(cache.insert(b"k", Arc::new(2), 1, deleter));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(**pinned.value(), 1);
        assert_eq!(cache.lookup_value(b"k").as_deref(), Some(&2));

        drop(pinned);
        let deleted = log.lock().unwrap().clone();
        assert_eq!(deleted, vec![(b"k".to_vec(), 1, Removal::Evicted)]);
    }

    #[test_traced]
    fn test_insert_same_value_updates_charge() {
        let (log, deleter) = recorder();
        let cache = ShardedCache::new(SHARDS * 100);
        let value = Arc::new(7);
        let first = cache.insert(b"k", value.clone(), 10, deleter.clone());
        let second = cache.insert(b"k", value, 25, deleter);
        assert_eq!(cache.usage(), 25);
        assert_eq!(cache.len(), 1);
        drop(first);
        drop(second);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(cache.lookup_value(b"k").as_deref(), Some(&7));
    }

    #[test_traced]
    fn test_erase_keeps_pinned_value_alive() {
        let (log, deleter) = recorder();
        let cache = ShardedCache::new(SHARDS * 100);
        let handle = cache.insert(b"k", Arc::new(3), 5, deleter);
        cache.erase(b"k");
        assert!(cache.lookup(b"k").is_none());
        assert_eq!(cache.usage(), 0);
        assert_eq!(**handle.value(), 3);
        assert!(log.lock().unwrap().is_empty());

        let clone = handle.clone();
        drop(handle);
        assert!(log.lock().unwrap().is_empty());
        drop(clone);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test_traced]
    fn test_eviction_in_lru_order() {
        let (log, deleter) = recorder();
        let cache = ShardedCache::new(SHARDS * 100);
        let keys = colliding_keys(3);
        drop(cache.insert(&keys[0], Arc::new(0), 50, deleter.clone()));
        drop(cache.insert(&keys[1], Arc::new(1), 50, deleter.clone()));

        // Touch the oldest so the second becomes least recently used
        drop(cache.lookup(&keys[0]).unwrap());
        drop(cache.insert(&keys[2], Arc::new(2), 50, deleter));

        assert!(cache.lookup(&keys[0]).is_some());
        assert!(cache.lookup(&keys[1]).is_none());
        assert!(cache.lookup(&keys[2]).is_some());
        let deleted = log.lock().unwrap().clone();
        assert_eq!(deleted, vec![(keys[1].clone(), 1, Removal::Evicted)]);
    }

    #[test_traced]
    fn test_eviction_skips_pinned_entries() {
        let (log, deleter) = recorder();
        let cache = ShardedCache::new(SHARDS * 100);
        let keys = colliding_keys(10);
        let pinned = cache.insert(&keys[0], Arc::new(0), 50, deleter.clone());
        for (i, key) in keys.iter().enumerate().skip(1) {
            drop(cache.insert(key, Arc::new(i as u32), 50, deleter.clone()));
            assert!(cache.lookup_value(&keys[0]).is_some());
        }
        assert!(log.lock().unwrap().iter().all(|(_, value, _)| *value != 0));
        assert_eq!(log.lock().unwrap().len(), 8);

        // Once released, the entry is ordinary LRU data again
        drop(pinned);
        drop(cache.insert(&keys[1], Arc::new(11), 50, deleter.clone()));
        drop(cache.insert(&keys[2], Arc::new(12), 50, deleter));
        assert!(cache.lookup(&keys[0]).is_none());
        assert!(log.lock().unwrap().iter().any(|(_, value, _)| *value == 0));
    }

    #[test_traced]
    fn test_usage_may_exceed_capacity_while_pinned() {
        let (_, deleter) = recorder();
        let cache = ShardedCache::new(SHARDS * 100);
        let keys = colliding_keys(4);
        let handles: Vec<_> = keys[..3]
            .iter()
            .map(|key| cache.insert(key, Arc::new(0), 60, deleter.clone()))
            .collect();
        assert_eq!(cache.usage(), 180);
        drop(handles);

        // The next insert trims back under capacity
        drop(cache.insert(&keys[3], Arc::new(1), 0, deleter));
        let resident = keys[..3]
            .iter()
            .filter(|key| cache.lookup(key).is_some())
            .count();
        assert_eq!(resident, 1);
    }

    #[test_traced]
    fn test_update() {
        let (log, deleter) = recorder();
        let cache = ShardedCache::new(SHARDS * 100);
        let handle = cache.insert(b"k", Arc::new(1), 10, deleter.clone());
        assert!(cache.update(b"k", &handle, 40));
        assert_eq!(cache.usage(), 40);

        // Erased entries are put back
        cache.erase(b"k");
        assert!(cache.update(b"k", &handle, 5));
        assert_eq!(cache.usage(), 5);
        assert_eq!(cache.lookup_value(b"k").as_deref(), Some(&1));

        // Replaced entries are not
        drop(cache.insert(b"k", Arc::new(2), 1, deleter));
        assert!(!cache.update(b"k", &handle, 100));
        assert_eq!(cache.usage(), 1);
        drop(handle);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test_traced]
    fn test_shutdown_reason() {
        let (log, deleter) = recorder();
        let cache = ShardedCache::new(SHARDS * 100);
        drop(cache.insert(b"a", Arc::new(1), 1, deleter.clone()));
        let held = cache.insert(b"b", Arc::new(2), 1, deleter.clone());
        let erased = cache.insert(b"c", Arc::new(3), 1, deleter);
        cache.erase(b"c");
        drop(erased);

        drop(cache);
        assert_eq!(log.lock().unwrap().len(), 2);
        drop(held);
        let deleted = log.lock().unwrap().clone();
        assert_eq!(
            deleted,
            vec![
                (b"c".to_vec(), 3, Removal::Evicted),
                (b"a".to_vec(), 1, Removal::ShuttingDown),
                (b"b".to_vec(), 2, Removal::ShuttingDown),
            ]
        );
    }

    #[test_traced]
    fn test_concurrent_access() {
        let (log, deleter) = recorder();
        let cache = Arc::new(ShardedCache::new(SHARDS * 64));
        let mut workers = Vec::new();
        for seed in 0..8u64 {
            let cache = cache.clone();
            let deleter = deleter.clone();
            workers.push(thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                let mut held = Vec::new();
                for i in 0..2_000u32 {
                    let key = format!("key-{}", rng.gen_range(0..256)).into_bytes();
                    match rng.gen_range(0..4) {
                        0 => {
                            let charge = rng.gen_range(1..16);
                            held.push(cache.insert(&key, Arc::new(i), charge, deleter.clone()));
                        }
                        1 => cache.erase(&key),
                        _ => {
                            if let Some(handle) = cache.lookup(&key) {
                                held.push(handle);
                            }
                        }
                    }
                    if held.len() > 8 {
                        held.remove(rng.gen_range(0..held.len()));
                    }
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
        let resident = cache.len();
        let removed = log.lock().unwrap().len();
        drop(Arc::try_unwrap(cache).ok().unwrap());
        let total = log.lock().unwrap().len();
        assert_eq!(total - removed, resident);
        assert!(log.lock().unwrap()[..removed]
            .iter()
            .all(|(_, _, removal)| *removal == Removal::Evicted));
    }
}
