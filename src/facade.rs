//! Typed adapter over a byte-level storage engine.

use std::sync::Arc;

use crate::engine::StorageEngine;
use crate::error::SegmentResult;
use crate::metadata::Metadata;
use crate::serializer::Serializer;

/// Exposes a [`StorageEngine`] in terms of typed keys and values.
///
/// Keys and values pass through their serializers on every call; the engine
/// only ever sees bytes.
pub struct StorageFacade<K, V> {
    engine: Box<dyn StorageEngine>,
    keys: Arc<dyn Serializer<K>>,
    values: Arc<dyn Serializer<V>>,
}

impl<K, V> StorageFacade<K, V> {
    pub fn new(
        engine: Box<dyn StorageEngine>,
        keys: Arc<dyn Serializer<K>>,
        values: Arc<dyn Serializer<V>>,
    ) -> Self {
        Self {
            engine,
            keys,
            values,
        }
    }

    fn encode_key(&self, key: &K) -> Vec<u8> {
        let mut buf = Vec::new();
        self.keys.encode(key, &mut buf);
        buf
    }

    fn encode_value(&self, value: &V) -> Vec<u8> {
        let mut buf = Vec::new();
        self.values.encode(value, &mut buf);
        buf
    }

    /// Decode the entry for `key`. Counts as an access.
    pub fn lookup(&mut self, key: &K) -> SegmentResult<Option<(V, Metadata)>> {
        let key = self.encode_key(key);
        match self.engine.get(&key) {
            Some(entry) => Ok(Some((self.values.decode(entry.value)?, entry.metadata))),
            None => Ok(None),
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.engine.metadata(&self.encode_key(key)).is_some()
    }

    /// Install `value` for `key`, overwriting any existing entry.
    pub fn insert(&mut self, key: &K, value: &V, metadata: Metadata) -> SegmentResult<Option<Metadata>> {
        let key = self.encode_key(key);
        let value = self.encode_value(value);
        self.engine.insert(&key, &value, metadata)
    }

    pub fn delete(&mut self, key: &K) -> SegmentResult<Option<(V, Metadata)>> {
        let key = self.encode_key(key);
        match self.engine.remove(&key) {
            Some((value, metadata)) => Ok(Some((self.values.decode(&value)?, metadata))),
            None => Ok(None),
        }
    }

    /// Remove `key` without decoding its value.
    pub fn discard(&mut self, key: &K) -> bool {
        let key = self.encode_key(key);
        self.engine.remove(&key).is_some()
    }

    pub fn read_metadata(&self, key: &K) -> Option<Metadata> {
        self.engine.metadata(&self.encode_key(key))
    }

    /// Returns `false` if `key` is absent.
    pub fn write_metadata(&mut self, key: &K, metadata: Metadata) -> bool {
        let key = self.encode_key(key);
        self.engine.set_metadata(&key, metadata)
    }

    pub fn pick_eviction_candidate(&mut self, accept: &dyn Fn(Metadata) -> bool) -> Option<usize> {
        self.engine.eviction_candidate(accept)
    }

    /// Decode the entry in slot `index`. A vacant slot reads as `None`.
    pub fn read_at(&self, index: usize) -> SegmentResult<Option<(K, V, Metadata)>> {
        match self.engine.entry_at(index) {
            Some(entry) => Ok(Some((
                self.keys.decode(entry.key)?,
                self.values.decode(entry.value)?,
                entry.metadata,
            ))),
            None => Ok(None),
        }
    }

    pub fn delete_at(&mut self, index: usize, compact: bool) -> bool {
        self.engine.remove_at(index, compact)
    }

    pub fn clear(&mut self) {
        self.engine.clear();
    }

    pub fn release_all(&mut self) {
        self.engine.release();
    }

    pub fn len(&self) -> usize {
        self.engine.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engine.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PagedEngine;
    use crate::page_source::PageSource;
    use crate::region::HugepageSize;
    use crate::serializer::{StringSerializer, U64Serializer};

    fn facade() -> StorageFacade<u64, String> {
        let source = PageSource::new(4 * 4096, 4096, HugepageSize::None).unwrap();
        let engine = PagedEngine::new(Arc::new(source), 64);
        StorageFacade::new(
            Box::new(engine),
            Arc::new(U64Serializer),
            Arc::new(StringSerializer),
        )
    }

    #[test]
    fn test_typed_round_trip() {
        let mut facade = facade();
        assert!(facade.lookup(&7).unwrap().is_none());

        facade.insert(&7, &"seven".to_string(), Metadata::PINNED).unwrap();
        let (value, md) = facade.lookup(&7).unwrap().expect("present");
        assert_eq!(value, "seven");
        assert!(md.is_pinned());
        assert!(facade.contains_key(&7));
        assert_eq!(facade.len(), 1);

        let (value, _) = facade.delete(&7).unwrap().expect("removed");
        assert_eq!(value, "seven");
        assert!(facade.is_empty());
        assert!(facade.delete(&7).unwrap().is_none());
    }

    #[test]
    fn test_metadata_access() {
        let mut facade = facade();
        assert!(facade.read_metadata(&1).is_none());
        assert!(!facade.write_metadata(&1, Metadata::VETOED));

        facade.insert(&1, &"one".to_string(), Metadata::EMPTY).unwrap();
        assert!(facade.write_metadata(&1, Metadata::VETOED));
        assert_eq!(facade.read_metadata(&1), Some(Metadata::VETOED));
    }

    #[test]
    fn test_read_and_delete_at() {
        let mut facade = facade();
        facade.insert(&3, &"three".to_string(), Metadata::EMPTY).unwrap();

        let index = facade.pick_eviction_candidate(&|_| true).expect("candidate");
        let (key, value, _) = facade.read_at(index).unwrap().expect("occupied");
        assert_eq!(key, 3);
        assert_eq!(value, "three");

        assert!(facade.delete_at(index, false));
        assert!(facade.read_at(index).unwrap().is_none());
        assert!(!facade.delete_at(index, false));
    }
}
