//! Helpers shared by the sharded cache benchmarks.

use pcache_storage::lru::{Deleter, Removal, ShardedCache};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::Arc;

/// Charge of every benchmark entry.
pub const CHARGE: usize = 4096;

pub fn noop() -> Deleter<u64> {
    Arc::new(|_: &[u8], _: &Arc<u64>, _: Removal| {})
}

/// Generate `count` random 32-byte keys (the size of a typical NFS file handle).
pub fn random_keys(count: usize) -> Vec<Vec<u8>> {
    let mut rng = StdRng::seed_from_u64(0);
    (0..count)
        .map(|_| {
            let mut key = vec![0u8; 32];
            rng.fill(&mut key[..]);
            key
        })
        .collect()
}

/// Create a cache holding every key in `keys`.
pub fn populated(keys: &[Vec<u8>]) -> ShardedCache<u64> {
    let cache = ShardedCache::new(keys.len() * CHARGE * 2);
    let deleter = noop();
    for (i, key) in keys.iter().enumerate() {
        drop(cache.insert(key, Arc::new(i as u64), CHARGE, deleter.clone()));
    }
    cache
}
