//! Eviction hooks and the eviction half of a [`Segment`].
//!
//! The owning cache decides *when* to evict; a segment only answers which of
//! its slots is a good victim and performs the removal. A slot is a victim
//! only if its entry is neither vetoed nor pinned.

use crate::error::SegmentResult;
use crate::metadata::Metadata;
use crate::segment::Segment;

/// Decides, at write time, whether an entry must never be evicted.
///
/// Evaluated under the segment lock on every write that leaves an entry in
/// place. The result is cached in the entry's [`Metadata::VETOED`] bit.
pub trait EvictionVeto<K, V>: Fn(&K, &V) -> bool + Send + Sync + 'static {}

impl<K, V, T> EvictionVeto<K, V> for T where T: Fn(&K, &V) -> bool + Send + Sync + 'static {}

/// Receives every entry removed by [`Segment::evict`].
///
/// Runs under the segment lock, after the entry has been deleted. It must not
/// call back into the same segment.
pub trait EvictionListener<K, V>: Send + Sync {
    fn on_eviction(&self, key: K, value: V);
}

impl<K, V, F> EvictionListener<K, V> for F
where
    F: Fn(K, V) + Send + Sync,
{
    fn on_eviction(&self, key: K, value: V) {
        self(key, value)
    }
}

#[inline]
fn victim(metadata: Metadata) -> bool {
    metadata.evictable() && !metadata.is_pinned()
}

impl<K, V> Segment<K, V> {
    /// Suggest a slot to evict, or `None` if nothing here may be evicted.
    ///
    /// The index is only a hint: it is re-validated by [`evict`](Self::evict),
    /// which may still decline it if the slot changed in between.
    pub fn get_eviction_index(&self) -> Option<usize> {
        self.storage.lock().pick_eviction_candidate(&victim)
    }

    /// Evict the entry in slot `index` and notify the listener.
    ///
    /// Returns `Ok(false)` without side effects if the slot is vacant or holds
    /// a vetoed or pinned entry. With `shrink` the engine also gives unused
    /// pages back to the page source.
    pub fn evict(&self, index: usize, shrink: bool) -> SegmentResult<bool> {
        let mut storage = self.storage.lock();
        let Some((key, value, metadata)) = storage.read_at(index)? else {
            return Ok(false);
        };
        if !victim(metadata) {
            tracing::trace!(segment = self.id, index, ?metadata, "eviction declined");
            return Ok(false);
        }

        storage.delete_at(index, shrink);
        tracing::debug!(segment = self.id, index, shrink, "evicted entry");
        self.listener.on_eviction(key, value);
        Ok(true)
    }

    /// Release all storage held by this segment.
    ///
    /// Entries are dropped without listener calls. Dropping a segment has the
    /// same effect; this just makes the point explicit.
    pub fn destroy(self) {
        let mut storage = self.storage.lock();
        let entries = storage.len();
        storage.release_all();
        tracing::debug!(segment = self.id, entries, "destroyed segment");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::engine::PagedEngine;
    use crate::page_source::PageSource;
    use crate::region::HugepageSize;
    use crate::serializer::{StringSerializer, U64Serializer};

    type Evicted = Arc<Mutex<Vec<(u64, String)>>>;

    fn segment(source: &Arc<PageSource>) -> (Segment<u64, String>, Evicted) {
        let evicted: Evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = evicted.clone();
        let segment = Segment::builder(
            PagedEngine::new(source.clone(), 64),
            U64Serializer,
            StringSerializer,
        )
        .veto(|key: &u64, _: &String| *key >= 100)
        .listener(move |key: u64, value: String| sink.lock().push((key, value)))
        .build();
        (segment, evicted)
    }

    fn source() -> Arc<PageSource> {
        Arc::new(PageSource::new(8 * 4096, 4096, HugepageSize::None).unwrap())
    }

    #[test]
    fn test_victim_filter() {
        assert!(victim(Metadata::EMPTY));
        assert!(victim(Metadata::ACCESSED));
        assert!(!victim(Metadata::PINNED));
        assert!(!victim(Metadata::VETOED));
        assert!(!victim(Metadata::PINNED | Metadata::VETOED));
    }

    #[test]
    fn test_closure_listener() {
        let seen = Mutex::new(Vec::new());
        let listener = |key: u64, value: &'static str| seen.lock().push((key, value));
        listener.on_eviction(1, "one");
        assert_eq!(*seen.lock(), vec![(1, "one")]);
    }

    #[test]
    fn test_evict_notifies_listener() {
        let source = source();
        let (segment, evicted) = segment(&source);
        segment.put(&1, &"one".to_string()).unwrap();

        let index = segment.get_eviction_index().expect("candidate");
        assert!(segment.evict(index, true).unwrap());
        assert!(segment.get(&1).unwrap().is_none());
        assert_eq!(*evicted.lock(), vec![(1, "one".to_string())]);
    }

    #[test]
    fn test_no_candidate_when_all_protected() {
        let source = source();
        let (segment, _) = segment(&source);
        segment.put(&100, &"vetoed".to_string()).unwrap();
        segment.put_pinned(&1, &"pinned".to_string()).unwrap();
        assert_eq!(segment.get_eviction_index(), None);
    }

    #[test]
    fn test_evict_vacant_slot() {
        let source = source();
        let (segment, evicted) = segment(&source);
        assert!(!segment.evict(0, false).unwrap());
        assert!(!segment.evict(usize::MAX, false).unwrap());
        assert!(evicted.lock().is_empty());
    }

    #[test]
    fn test_evict_declines_pinned_slot() {
        let source = source();
        let (segment, evicted) = segment(&source);
        segment.put(&1, &"one".to_string()).unwrap();
        let index = segment.get_eviction_index().expect("candidate");

        // pinned between selection and eviction
        segment.put_pinned(&1, &"one".to_string()).unwrap();
        assert!(!segment.evict(index, false).unwrap());
        assert!(segment.contains_key(&1));
        assert!(evicted.lock().is_empty());
    }

    #[test]
    fn test_destroy_returns_pages() {
        let source = source();
        let (segment, evicted) = segment(&source);
        for key in 0..10 {
            segment.put(&key, &"x".repeat(1000)).unwrap();
        }
        assert!(source.used_pages() > 0);

        segment.destroy();
        assert_eq!(source.used_pages(), 0);
        assert!(evicted.lock().is_empty());
    }

    #[test]
    fn test_drop_returns_pages() {
        let source = source();
        {
            let (segment, _) = segment(&source);
            segment.put(&1, &"one".to_string()).unwrap();
            assert_eq!(source.used_pages(), 1);
        }
        assert_eq!(source.used_pages(), 0);
    }
}
