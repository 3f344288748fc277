use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::storage::models::MediaId;

/// Bounded map of encoded thumbnails. When full, the least recently inserted
/// entry is evicted. Callers invalidate explicitly on relink, delete and
/// regeneration.
pub struct ThumbnailCache {
    entries: DashMap<MediaId, (u64, Bytes)>,
    capacity: usize,
    sequence: AtomicU64,
}

impl ThumbnailCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn get(&self, id: &MediaId) -> Option<Bytes> {
        self.entries.get(id).map(|entry| entry.value().1.clone())
    }

    pub fn insert(&self, id: MediaId, image: Bytes) {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(id, (seq, image));
        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().0)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    pub fn invalidate(&self, id: &MediaId) -> bool {
        self.entries.remove(id).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest_when_full() {
        let cache = ThumbnailCache::new(2);
        cache.insert(MediaId::from("a"), Bytes::from_static(b"1"));
        cache.insert(MediaId::from("b"), Bytes::from_static(b"2"));
        cache.insert(MediaId::from("c"), Bytes::from_static(b"3"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&MediaId::from("a")).is_none());
        assert_eq!(cache.get(&MediaId::from("c")).unwrap(), &b"3"[..]);
    }

    #[test]
    fn test_invalidate_removes_entry() {
        let cache = ThumbnailCache::new(4);
        cache.insert(MediaId::from("a"), Bytes::from_static(b"1"));
        assert!(cache.invalidate(&MediaId::from("a")));
        assert!(!cache.invalidate(&MediaId::from("a")));
        assert!(cache.is_empty());
    }
}
