//! Sharded per-(learner, card) lock table.
//!
//! Reviews of the same card by the same learner must not interleave their
//! read-modify-write. Keys hash into a fixed number of shards so memory stays
//! bounded no matter how many cards exist; unrelated keys only contend when
//! they share a shard.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio::sync::{Mutex, MutexGuard};

/// Default number of shards.
pub const DEFAULT_SHARDS: usize = 64;

/// Keyed mutual exclusion over a fixed shard table.
pub struct KeyedLocks {
    shards: Vec<Mutex<()>>,
}

impl Default for KeyedLocks {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

impl KeyedLocks {
    /// Create a table with `shards` locks (at least one).
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard that guards a key.
    pub fn shard_index(&self, learner_id: &str, card_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        (learner_id, card_id).hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Wait for exclusive access to a key. Released when the guard drops.
    pub async fn lock(&self, learner_id: &str, card_id: &str) -> MutexGuard<'_, ()> {
        self.shards[self.shard_index(learner_id, card_id)].lock().await
    }
}
