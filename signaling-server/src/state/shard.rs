use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use tokio::sync::{Mutex, MutexGuard};

type Slots<V> = HashMap<String, V>;

/// String-keyed map split across independently locked shards, so operations
/// on unrelated users never contend on one lock.
pub struct Shards<V> {
    shards: Box<[Mutex<Slots<V>>]>,
}

impl<V> Shards<V> {
    pub fn new(count: usize) -> Self {
        let count = count.max(1);
        Self {
            shards: (0..count).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    pub fn index(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    pub async fn lock(&self, key: &str) -> MutexGuard<'_, Slots<V>> {
        self.shards[self.index(key)].lock().await
    }

    /// Locks the shards holding `a` and `b`, lowest index first.
    pub async fn lock_pair(&self, a: &str, b: &str) -> PairGuard<'_, V> {
        let (ia, ib) = (self.index(a), self.index(b));
        let (lo, hi) = if ia <= ib { (ia, ib) } else { (ib, ia) };

        let low = self.shards[lo].lock().await;
        let high = if hi == lo {
            None
        } else {
            Some(self.shards[hi].lock().await)
        };

        PairGuard {
            low,
            high,
            a_is_low: ia == lo,
            b_is_low: ib == lo,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mutex<Slots<V>>> {
        self.shards.iter()
    }
}

/// Both shards of a two-party operation, held together.
pub struct PairGuard<'a, V> {
    low: MutexGuard<'a, Slots<V>>,
    high: Option<MutexGuard<'a, Slots<V>>>,
    a_is_low: bool,
    b_is_low: bool,
}

impl<'a, V> PairGuard<'a, V> {
    fn side(&mut self, low: bool) -> &mut Slots<V> {
        match (&mut self.high, low) {
            (Some(high), false) => &mut **high,
            _ => &mut *self.low,
        }
    }

    /// Shard of the first key passed to `lock_pair`.
    pub fn a(&mut self) -> &mut Slots<V> {
        let low = self.a_is_low;
        self.side(low)
    }

    /// Shard of the second key passed to `lock_pair`.
    pub fn b(&mut self) -> &mut Slots<V> {
        let low = self.b_is_low;
        self.side(low)
    }
}
