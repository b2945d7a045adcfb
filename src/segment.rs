//! A single lock-protected shard of an off-heap cache.
//!
//! A [`Segment`] owns one storage engine (and through it a share of the pages
//! of a [`PageSource`](crate::PageSource)), one exclusive lock, one veto
//! predicate and one eviction listener. The owning cache hashes keys to
//! segments and drives eviction; the segment only guarantees that each call is
//! atomic with respect to every other call on the same segment.
//!
//! # Thread Safety
//!
//! Every operation, reads included, takes the segment lock for its whole
//! duration. Mapping functions, the veto predicate and the eviction listener
//! all run while the lock is held:
//!
//! - no other thread can observe a half-applied compute, and an entry cannot
//!   be evicted while a compute for it is in flight;
//! - a slow callback stalls every other caller of this segment;
//! - callbacks must not call back into the same segment. The lock is not
//!   reentrant and doing so deadlocks.
//!
//! A panicking callback unwinds through the lock guard, which releases the
//! lock. Callbacks run before any write is made, so the entry is left as it
//! was.
//!
//! # Pin Preservation
//!
//! Mapping functions report what they did through [`Computed`]. Returning
//! [`Computed::Unchanged`] means "keep the stored value"; the pin can then
//! only be added. Returning [`Computed::Value`] is an authoritative new
//! assignment, even when the new value is equal to the old one, and the pin
//! is taken verbatim from the request.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::StorageEngine;
use crate::error::SegmentResult;
use crate::eviction::{EvictionListener, EvictionVeto};
use crate::facade::StorageFacade;
use crate::metadata::Metadata;
use crate::serializer::Serializer;

/// Outcome of a mapping function passed to the compute family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Computed<V> {
    /// Keep the currently stored value instance.
    Unchanged,
    /// Store this value.
    Value(V),
    /// Remove the mapping.
    Remove,
}

impl<V> From<Option<V>> for Computed<V> {
    fn from(value: Option<V>) -> Self {
        match value {
            Some(value) => Computed::Value(value),
            None => Computed::Remove,
        }
    }
}

/// One shard of an off-heap cache.
pub struct Segment<K, V> {
    pub(crate) id: usize,
    pub(crate) storage: Mutex<StorageFacade<K, V>>,
    pub(crate) veto: Arc<dyn EvictionVeto<K, V>>,
    pub(crate) listener: Arc<dyn EvictionListener<K, V>>,
}

impl<K: 'static, V: 'static> Segment<K, V> {
    /// Start building a segment over `engine`.
    pub fn builder<E, KS, VS>(engine: E, keys: KS, values: VS) -> SegmentBuilder<K, V>
    where
        E: StorageEngine + 'static,
        KS: Serializer<K> + 'static,
        VS: Serializer<V> + 'static,
    {
        SegmentBuilder {
            id: 0,
            engine: Box::new(engine),
            keys: Arc::new(keys),
            values: Arc::new(values),
            veto: None,
            listener: None,
        }
    }
}

impl<K, V> Segment<K, V> {
    /// Ordinal the owning cache addresses this segment by.
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    fn vetoed(&self, key: &K, value: &V) -> bool {
        (self.veto)(key, value)
    }

    /// Install `value` for `key`. The entry is unpinned afterwards.
    pub fn put(&self, key: &K, value: &V) -> SegmentResult<()> {
        self.install(key, value, false)
    }

    /// Install `value` for `key` and pin it.
    pub fn put_pinned(&self, key: &K, value: &V) -> SegmentResult<()> {
        self.install(key, value, true)
    }

    fn install(&self, key: &K, value: &V, pinned: bool) -> SegmentResult<()> {
        let mut storage = self.storage.lock();
        let metadata = Metadata::EMPTY
            .set(Metadata::PINNED, pinned)
            .set(Metadata::VETOED, self.vetoed(key, value));
        storage
            .insert(key, value, metadata)
            .inspect_err(|e| tracing::debug!(segment = self.id, error = %e, "put failed"))?;
        Ok(())
    }

    pub fn get(&self, key: &K) -> SegmentResult<Option<V>> {
        let mut storage = self.storage.lock();
        Ok(storage.lookup(key)?.map(|(value, _)| value))
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.storage.lock().contains_key(key)
    }

    /// Remove `key`, returning the value it held.
    pub fn remove(&self, key: &K) -> SegmentResult<Option<V>> {
        let mut storage = self.storage.lock();
        Ok(storage.delete(key)?.map(|(value, _)| value))
    }

    /// `false` for absent keys.
    pub fn is_pinned(&self, key: &K) -> bool {
        self.storage
            .lock()
            .read_metadata(key)
            .is_some_and(Metadata::is_pinned)
    }

    /// The bits of `key`'s metadata selected by `mask`.
    ///
    /// An absent key reads as [`Metadata::EMPTY`].
    pub fn get_metadata(&self, key: &K, mask: Metadata) -> Metadata {
        self.storage
            .lock()
            .read_metadata(key)
            .unwrap_or(Metadata::EMPTY)
            .masked(mask)
    }

    /// Atomically compute a new mapping for `key`.
    ///
    /// `f` sees the current value, or `None` if the key is absent, and runs
    /// under the segment lock. The pin rule:
    ///
    /// - [`Computed::Unchanged`]: pinned if it was pinned or `pin` is set.
    ///   On an absent key nothing is stored and `None` is returned.
    /// - [`Computed::Value`]: pinned iff `pin`.
    /// - [`Computed::Remove`]: the entry is deleted.
    ///
    /// The veto bit is recomputed for every surviving entry.
    pub fn compute<F>(&self, key: &K, f: F, pin: bool) -> SegmentResult<Option<V>>
    where
        F: FnOnce(&K, Option<&V>) -> Computed<V>,
    {
        let mut storage = self.storage.lock();
        let current = storage.lookup(key)?;

        match (f(key, current.as_ref().map(|(value, _)| value)), current) {
            (Computed::Remove, Some(_)) => {
                storage.discard(key);
                Ok(None)
            }
            (Computed::Remove | Computed::Unchanged, None) => Ok(None),
            (Computed::Unchanged, Some((value, metadata))) => {
                let metadata = metadata
                    .set(Metadata::PINNED, metadata.is_pinned() || pin)
                    .set(Metadata::VETOED, self.vetoed(key, &value));
                storage.write_metadata(key, metadata);
                Ok(Some(value))
            }
            (Computed::Value(value), current) => {
                let metadata = current
                    .map_or(Metadata::EMPTY, |(_, metadata)| metadata)
                    .set(Metadata::PINNED, pin)
                    .set(Metadata::VETOED, self.vetoed(key, &value));
                storage
                    .insert(key, &value, metadata)
                    .inspect_err(|e| tracing::debug!(segment = self.id, error = %e, "compute failed"))?;
                Ok(Some(value))
            }
        }
    }

    /// Like [`compute`](Self::compute), but only for a present key. `f` is
    /// never called for an absent key. Pin state is left as it was.
    pub fn compute_if_present<F>(&self, key: &K, f: F) -> SegmentResult<Option<V>>
    where
        F: FnOnce(&K, &V) -> Computed<V>,
    {
        self.compute_present(key, f, false)
    }

    /// Like [`compute_if_present`](Self::compute_if_present), but a surviving
    /// entry ends up pinned.
    pub fn compute_if_present_and_pin<F>(&self, key: &K, f: F) -> SegmentResult<Option<V>>
    where
        F: FnOnce(&K, &V) -> Computed<V>,
    {
        self.compute_present(key, f, true)
    }

    fn compute_present<F>(&self, key: &K, f: F, pin: bool) -> SegmentResult<Option<V>>
    where
        F: FnOnce(&K, &V) -> Computed<V>,
    {
        let mut storage = self.storage.lock();
        let Some((current, metadata)) = storage.lookup(key)? else {
            return Ok(None);
        };
        let metadata = metadata.set(Metadata::PINNED, metadata.is_pinned() || pin);

        match f(key, &current) {
            Computed::Remove => {
                storage.discard(key);
                Ok(None)
            }
            Computed::Unchanged => {
                let metadata = metadata.set(Metadata::VETOED, self.vetoed(key, &current));
                storage.write_metadata(key, metadata);
                Ok(Some(current))
            }
            Computed::Value(value) => {
                let metadata = metadata.set(Metadata::VETOED, self.vetoed(key, &value));
                storage.insert(key, &value, metadata)?;
                Ok(Some(value))
            }
        }
    }

    /// Recompute a pinned entry and decide whether to release its pin.
    ///
    /// Does nothing and returns `false` unless `key` is present and pinned.
    /// Otherwise `f` computes the new mapping and `unpin` inspects the current
    /// value to decide whether the pin is dropped. Returns that decision.
    pub fn compute_if_pinned<F, U>(&self, key: &K, f: F, unpin: U) -> SegmentResult<bool>
    where
        F: FnOnce(&K, &V) -> Computed<V>,
        U: FnOnce(&V) -> bool,
    {
        let mut storage = self.storage.lock();
        let Some((current, metadata)) = storage.lookup(key)? else {
            return Ok(false);
        };
        if !metadata.is_pinned() {
            return Ok(false);
        }

        let computed = f(key, &current);
        let unpin = unpin(&current);
        let metadata = metadata.set(Metadata::PINNED, !unpin);

        match computed {
            Computed::Remove => {
                storage.discard(key);
            }
            Computed::Unchanged => {
                let metadata = metadata.set(Metadata::VETOED, self.vetoed(key, &current));
                storage.write_metadata(key, metadata);
            }
            Computed::Value(value) => {
                let metadata = metadata.set(Metadata::VETOED, self.vetoed(key, &value));
                storage.insert(key, &value, metadata)?;
            }
        }
        Ok(unpin)
    }

    /// Remove every entry without notifying the eviction listener.
    pub fn clear(&self) {
        self.storage.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.storage.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.lock().is_empty()
    }
}

impl<K, V> std::fmt::Debug for Segment<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment").field("id", &self.id).finish()
    }
}

/// Builder for [`Segment`].
pub struct SegmentBuilder<K, V> {
    id: usize,
    engine: Box<dyn StorageEngine>,
    keys: Arc<dyn Serializer<K>>,
    values: Arc<dyn Serializer<V>>,
    veto: Option<Arc<dyn EvictionVeto<K, V>>>,
    listener: Option<Arc<dyn EvictionListener<K, V>>>,
}

impl<K: 'static, V: 'static> SegmentBuilder<K, V> {
    /// Set the segment ordinal (default: 0).
    pub fn id(mut self, id: usize) -> Self {
        self.id = id;
        self
    }

    /// Set the predicate that marks entries as never evictable.
    ///
    /// Default: nothing is vetoed.
    pub fn veto(mut self, veto: impl EvictionVeto<K, V>) -> Self {
        self.veto = Some(Arc::new(veto));
        self
    }

    /// Set the callback invoked once for every evicted entry.
    ///
    /// Default: evictions are silent.
    pub fn listener(mut self, listener: impl EvictionListener<K, V> + 'static) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    pub fn build(self) -> Segment<K, V> {
        let veto: Arc<dyn EvictionVeto<K, V>> = match self.veto {
            Some(veto) => veto,
            None => Arc::new(|_: &K, _: &V| false),
        };
        let listener: Arc<dyn EvictionListener<K, V>> = match self.listener {
            Some(listener) => listener,
            None => Arc::new(|_: K, _: V| {}),
        };

        tracing::debug!(segment = self.id, "created segment");

        Segment {
            id: self.id,
            storage: Mutex::new(StorageFacade::new(self.engine, self.keys, self.values)),
            veto,
            listener,
        }
    }
}
