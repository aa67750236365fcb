//! LRU cache of decompressed blocks.

use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::event::Event;

/// Cache key: owning file partition plus payload offset within it.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct BlockKey {
    pub partition: String,
    pub offset: u64,
}

struct Inner {
    entries: LruCache<BlockKey, (Arc<Vec<Event>>, usize)>,
    current_bytes: usize,
}

/// Byte-budgeted cache of recently decompressed blocks.
///
/// Sizing uses the block's uncompressed length rather than deep-measuring the
/// decoded events; close enough to keep the budget honest.
pub struct BlockCache {
    max_bytes: usize,
    inner: Mutex<Inner>,
}

impl BlockCache {
    /// `max_bytes` of zero disables caching entirely.
    pub fn new(max_bytes: usize) -> Option<Arc<Self>> {
        if max_bytes == 0 {
            return None;
        }
        Some(Arc::new(Self {
            max_bytes,
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                current_bytes: 0,
            }),
        }))
    }

    pub fn get(&self, key: &BlockKey) -> Option<Arc<Vec<Event>>> {
        let mut inner = self.inner.lock().expect("block cache poisoned");
        inner.entries.get(key).map(|(events, _)| Arc::clone(events))
    }

    pub fn insert(&self, key: BlockKey, events: Arc<Vec<Event>>, uncompressed_len: usize) {
        if uncompressed_len > self.max_bytes {
            return;
        }
        let mut inner = self.inner.lock().expect("block cache poisoned");
        if let Some((_, old_len)) = inner.entries.put(key, (events, uncompressed_len)) {
            inner.current_bytes -= old_len;
        }
        inner.current_bytes += uncompressed_len;
        while inner.current_bytes > self.max_bytes {
            match inner.entries.pop_lru() {
                Some((_, (_, len))) => inner.current_bytes -= len,
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("block cache poisoned").entries.len()
    }

    pub fn current_bytes(&self) -> usize {
        self.inner.lock().expect("block cache poisoned").current_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(offset: u64) -> BlockKey {
        BlockKey {
            partition: "2021-09-05-12".into(),
            offset,
        }
    }

    #[test]
    fn disabled_when_budget_is_zero() {
        assert!(BlockCache::new(0).is_none());
    }

    #[test]
    fn evicts_least_recently_used_past_budget() {
        let cache = BlockCache::new(100).unwrap();
        cache.insert(key(0), Arc::new(Vec::new()), 60);
        cache.insert(key(1), Arc::new(Vec::new()), 30);
        assert_eq!(cache.len(), 2);

        // Touch the first entry so the second becomes the LRU victim.
        assert!(cache.get(&key(0)).is_some());
        cache.insert(key(2), Arc::new(Vec::new()), 40);

        assert!(cache.get(&key(0)).is_some());
        assert!(cache.get(&key(1)).is_none());
        assert!(cache.get(&key(2)).is_some());
        assert!(cache.current_bytes() <= 100);
    }

    #[test]
    fn oversized_block_is_not_cached() {
        let cache = BlockCache::new(10).unwrap();
        cache.insert(key(0), Arc::new(Vec::new()), 11);
        assert_eq!(cache.len(), 0);
    }
}
