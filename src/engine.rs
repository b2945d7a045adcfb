//! Byte-level storage engine.
//!
//! [`StorageEngine`] is the contract the segment programs against: keys and
//! values are opaque byte strings, each paired with a [`Metadata`] word.
//! [`PagedEngine`] is the bundled implementation.
//!
//! # Paged Engine Layout
//!
//! ```text
//!   slot table (fixed capacity, linear probing)
//!  +-------+-------+-------+-------+-------+
//!  | Empty | Entry |Removed| Entry | Empty |  ...
//!  +-------+---+---+-------+---+---+-------+
//!              |               |
//!              v               v
//!  +-----------+---------------+----------+
//!  | key|value | key|value     |   free   |   page (from PageSource)
//!  +-----------+---------------+----------+
//!                               ^ top
//! ```
//!
//! Entry bytes are bump-allocated inside the active page. Each page counts
//! its live entries; once that count reaches zero the page is reset, kept as
//! a spare, or handed back to the page source.
//!
//! Dead bytes in a page that still holds live entries are reclaimed lazily:
//! when no page can be taken from the source, the held page with the most
//! free space is compacted in place and becomes the active page.
//!
//! Reads and inserts set the [`Metadata::ACCESSED`] reference bit, which the
//! clock sweep in [`StorageEngine::eviction_candidate`] clears.
//!
//! The slot table never grows. Tombstones are reused by inserts and purged on
//! shrinking removals.

use std::sync::Arc;

use rand::Rng;

use crate::error::{SegmentError, SegmentResult};
use crate::metadata::Metadata;
use crate::page_source::{Page, PageSource};

/// A borrowed view of a stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryRef<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
    pub metadata: Metadata,
}

/// Byte-level key/value storage with per-entry metadata.
///
/// Implementations are driven from behind the segment lock and need not be
/// thread-safe themselves.
pub trait StorageEngine: Send {
    /// Look up the value and metadata stored for `key`, recording the access.
    fn get(&mut self, key: &[u8]) -> Option<EntryRef<'_>>;

    /// Store `value` under `key`, replacing any existing entry. Returns the
    /// previous metadata if the key was present.
    ///
    /// On error the engine is left unchanged.
    fn insert(&mut self, key: &[u8], value: &[u8], metadata: Metadata)
    -> SegmentResult<Option<Metadata>>;

    /// Remove `key`, returning a copy of its value and its metadata.
    fn remove(&mut self, key: &[u8]) -> Option<(Vec<u8>, Metadata)>;

    /// Metadata of `key`. Does not count as an access.
    fn metadata(&self, key: &[u8]) -> Option<Metadata>;

    /// Overwrite the metadata of `key`. Returns `false` if the key is absent.
    fn set_metadata(&mut self, key: &[u8], metadata: Metadata) -> bool;

    /// Pick an occupied slot whose metadata passes `accept`.
    ///
    /// No ordering is promised beyond "currently occupied".
    fn eviction_candidate(&mut self, accept: &dyn Fn(Metadata) -> bool) -> Option<usize>;

    /// Read the entry in slot `index`, or `None` if the slot is vacant.
    fn entry_at(&self, index: usize) -> Option<EntryRef<'_>>;

    /// Vacate slot `index`. With `shrink`, storage freed by the removal is
    /// returned to the page source right away.
    fn remove_at(&mut self, index: usize, shrink: bool) -> bool;

    /// Drop every entry and return all pages.
    fn clear(&mut self);

    /// Return all backing pages. The engine is unusable afterwards.
    fn release(&mut self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots.
    fn capacity(&self) -> usize;
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    hash: u64,
    page: u32,
    offset: u32,
    key_len: u32,
    value_len: u32,
    metadata: Metadata,
}

impl Entry {
    #[inline]
    fn len(&self) -> usize {
        (self.key_len + self.value_len) as usize
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Empty,
    Removed,
    Occupied(Entry),
}

struct PageState {
    page: Page,
    /// Bump offset of the next free byte.
    top: usize,
    /// Entries whose bytes live in this page.
    live: u32,
    /// Bytes held by those entries.
    used: usize,
}

/// Storage engine keeping entry bytes in pages from a shared [`PageSource`].
pub struct PagedEngine {
    source: Arc<PageSource>,
    slots: Box<[Slot]>,
    mask: usize,
    occupied: usize,
    removed: usize,
    pages: Vec<Option<PageState>>,
    active: Option<u32>,
    spare: Vec<u32>,
    hand: usize,
    hasher: ahash::RandomState,
    released: bool,
}

impl PagedEngine {
    /// Create an engine with room for `capacity` entries, rounded up to a
    /// power of two.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(source: Arc<PageSource>, capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be positive");
        let capacity = capacity.next_power_of_two();
        let hand = rand::thread_rng().gen_range(0..capacity);

        Self {
            source,
            slots: vec![Slot::Empty; capacity].into_boxed_slice(),
            mask: capacity - 1,
            occupied: 0,
            removed: 0,
            pages: Vec::new(),
            active: None,
            spare: Vec::new(),
            hand,
            hasher: ahash::RandomState::new(),
            released: false,
        }
    }

    /// Pages currently held, including the active page and spares.
    pub fn held_pages(&self) -> usize {
        self.pages.iter().filter(|p| p.is_some()).count()
    }

    /// Empty pages kept for reuse.
    pub fn spare_pages(&self) -> usize {
        self.spare.len()
    }

    pub fn page_source(&self) -> &Arc<PageSource> {
        &self.source
    }

    #[inline]
    fn check_live(&self) {
        assert!(!self.released, "storage engine used after release");
    }

    #[inline]
    fn hash(&self, key: &[u8]) -> u64 {
        self.hasher.hash_one(key)
    }

    fn page(&self, id: u32) -> &Page {
        &self.pages[id as usize]
            .as_ref()
            .expect("entry references a released page")
            .page
    }

    fn key_of(&self, entry: &Entry) -> &[u8] {
        self.page(entry.page)
            .bytes(entry.offset as usize, entry.key_len as usize)
    }

    fn value_of(&self, entry: &Entry) -> &[u8] {
        self.page(entry.page).bytes(
            (entry.offset + entry.key_len) as usize,
            entry.value_len as usize,
        )
    }

    fn view(&self, entry: &Entry) -> EntryRef<'_> {
        EntryRef {
            key: self.key_of(entry),
            value: self.value_of(entry),
            metadata: entry.metadata,
        }
    }

    fn find(&self, key: &[u8]) -> Option<usize> {
        let hash = self.hash(key);
        let mut idx = hash as usize & self.mask;
        for _ in 0..self.slots.len() {
            match &self.slots[idx] {
                Slot::Empty => return None,
                Slot::Removed => {}
                Slot::Occupied(entry) => {
                    if entry.hash == hash && self.key_of(entry) == key {
                        return Some(idx);
                    }
                }
            }
            idx = (idx + 1) & self.mask;
        }
        None
    }

    /// Locate the slot for an insert: the existing entry for `key`, or the
    /// first reusable slot along its search path.
    fn find_insert_slot(&self, hash: u64, key: &[u8]) -> SegmentResult<(usize, bool)> {
        let mut idx = hash as usize & self.mask;
        let mut tombstone = None;
        for _ in 0..self.slots.len() {
            match &self.slots[idx] {
                Slot::Empty => return Ok((tombstone.unwrap_or(idx), false)),
                Slot::Removed => {
                    tombstone.get_or_insert(idx);
                }
                Slot::Occupied(entry) => {
                    if entry.hash == hash && self.key_of(entry) == key {
                        return Ok((idx, true));
                    }
                }
            }
            idx = (idx + 1) & self.mask;
        }
        tombstone
            .map(|idx| (idx, false))
            .ok_or(SegmentError::TableFull {
                capacity: self.slots.len(),
            })
    }

    /// Reserve `size` contiguous bytes, returning `(page, offset)`.
    fn allocate(&mut self, size: usize) -> SegmentResult<(u32, u32)> {
        let page_size = self.source.page_size();
        if size > page_size {
            return Err(SegmentError::EntryTooLarge { size, page_size });
        }

        if let Some(id) = self.active {
            let state = self.pages[id as usize]
                .as_ref()
                .expect("active page is held");
            if state.top + size <= page_size {
                return Ok(self.bump(id, size));
            }
        }

        let id = match self.spare.pop() {
            Some(id) => id,
            None => match self.source.allocate() {
                Some(page) => self.adopt(page),
                None => self
                    .compact_for(size)
                    .ok_or(SegmentError::OutOfMemory { size })?,
            },
        };

        self.active = Some(id);
        Ok(self.bump(id, size))
    }

    fn bump(&mut self, id: u32, size: usize) -> (u32, u32) {
        let state = self.pages[id as usize].as_mut().expect("page is held");
        let offset = state.top;
        state.top += size;
        state.used += size;
        state.live += 1;
        (id, offset as u32)
    }

    /// Compact the held page with the most free space, if that frees at
    /// least `size` bytes at its end.
    fn compact_for(&mut self, size: usize) -> Option<u32> {
        let page_size = self.source.page_size();
        let (id, _) = self
            .pages
            .iter()
            .enumerate()
            .filter_map(|(id, state)| state.as_ref().map(|state| (id, state.used)))
            .filter(|&(_, used)| used + size <= page_size)
            .min_by_key(|&(_, used)| used)?;

        self.compact(id as u32);
        Some(id as u32)
    }

    /// Slide the live entries of page `id` to its start, in offset order.
    fn compact(&mut self, id: u32) {
        let mut entries: Vec<(u32, usize)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| match slot {
                Slot::Occupied(entry) if entry.page == id => Some((entry.offset, idx)),
                _ => None,
            })
            .collect();
        entries.sort_unstable();

        let state = self.pages[id as usize].as_mut().expect("page is held");
        let reclaimed = state.top - state.used;
        let mut top = 0;
        for (offset, idx) in entries {
            let Slot::Occupied(entry) = &mut self.slots[idx] else {
                continue;
            };
            let len = entry.len();
            if offset as usize != top {
                state.page.copy_within(offset as usize, top, len);
                entry.offset = top as u32;
            }
            top += len;
        }
        debug_assert_eq!(top, state.used);
        state.top = top;

        tracing::trace!(page = id, reclaimed, "compacted page");
    }

    fn adopt(&mut self, page: Page) -> u32 {
        let state = PageState {
            page,
            top: 0,
            live: 0,
            used: 0,
        };
        match self.pages.iter().position(|p| p.is_none()) {
            Some(id) => {
                self.pages[id] = Some(state);
                id as u32
            }
            None => {
                self.pages.push(Some(state));
                (self.pages.len() - 1) as u32
            }
        }
    }

    /// Drop one live entry of `size` bytes from page `id`.
    fn free_bytes(&mut self, id: u32, size: usize, shrink: bool) {
        let state = self.pages[id as usize]
            .as_mut()
            .expect("entry references a held page");
        state.live -= 1;
        state.used -= size;
        if state.live > 0 {
            return;
        }

        state.top = 0;
        if self.active == Some(id) {
            if shrink {
                self.active = None;
                self.return_page(id);
            }
        } else if shrink {
            self.return_page(id);
        } else {
            self.spare.push(id);
        }
    }

    fn return_page(&mut self, id: u32) {
        if let Some(state) = self.pages[id as usize].take() {
            self.source.free(state.page);
        }
    }

    fn release_spares(&mut self) {
        while let Some(id) = self.spare.pop() {
            self.return_page(id);
        }
    }

    /// Mark slot `idx` removed and free its bytes.
    fn vacate(&mut self, idx: usize, shrink: bool) -> Option<Entry> {
        let Slot::Occupied(entry) = self.slots[idx] else {
            return None;
        };

        self.slots[idx] = Slot::Removed;
        self.occupied -= 1;
        self.removed += 1;
        self.free_bytes(entry.page, entry.len(), shrink);

        if self.occupied == 0 {
            self.slots.fill(Slot::Empty);
            self.removed = 0;
        } else if shrink {
            self.release_spares();
            if self.removed > self.slots.len() / 4 {
                self.purge_tombstones();
            }
        }

        Some(entry)
    }

    /// Reinsert every live entry into a fresh slot array.
    fn purge_tombstones(&mut self) {
        let old = std::mem::replace(
            &mut self.slots,
            vec![Slot::Empty; self.mask + 1].into_boxed_slice(),
        );
        for slot in old.iter() {
            if let Slot::Occupied(entry) = slot {
                let mut idx = entry.hash as usize & self.mask;
                while !matches!(self.slots[idx], Slot::Empty) {
                    idx = (idx + 1) & self.mask;
                }
                self.slots[idx] = *slot;
            }
        }
        tracing::trace!(purged = self.removed, "purged slot tombstones");
        self.removed = 0;
    }
}

impl StorageEngine for PagedEngine {
    fn get(&mut self, key: &[u8]) -> Option<EntryRef<'_>> {
        self.check_live();
        let idx = self.find(key)?;
        match &mut self.slots[idx] {
            Slot::Occupied(entry) => {
                entry.metadata = entry.metadata.with(Metadata::ACCESSED);
                let entry = *entry;
                Some(self.view(&entry))
            }
            _ => None,
        }
    }

    fn insert(
        &mut self,
        key: &[u8],
        value: &[u8],
        metadata: Metadata,
    ) -> SegmentResult<Option<Metadata>> {
        self.check_live();
        let hash = self.hash(key);
        let (idx, existing) = self.find_insert_slot(hash, key)?;

        let (page, offset) = self.allocate(key.len() + value.len())?;
        {
            let state = self.pages[page as usize].as_mut().expect("page is held");
            state.page.write(offset as usize, key);
            state.page.write(offset as usize + key.len(), value);
        }

        let previous = match self.slots[idx] {
            Slot::Occupied(old) if existing => {
                self.free_bytes(old.page, old.len(), false);
                Some(old.metadata)
            }
            Slot::Removed => {
                self.removed -= 1;
                self.occupied += 1;
                None
            }
            _ => {
                self.occupied += 1;
                None
            }
        };

        self.slots[idx] = Slot::Occupied(Entry {
            hash,
            page,
            offset,
            key_len: key.len() as u32,
            value_len: value.len() as u32,
            metadata: metadata.with(Metadata::ACCESSED),
        });

        Ok(previous)
    }

    fn remove(&mut self, key: &[u8]) -> Option<(Vec<u8>, Metadata)> {
        self.check_live();
        let idx = self.find(key)?;
        let value = match &self.slots[idx] {
            Slot::Occupied(entry) => self.value_of(entry).to_vec(),
            _ => return None,
        };
        self.vacate(idx, true)
            .map(|entry| (value, entry.metadata))
    }

    fn metadata(&self, key: &[u8]) -> Option<Metadata> {
        self.check_live();
        match self.slots[self.find(key)?] {
            Slot::Occupied(entry) => Some(entry.metadata),
            _ => None,
        }
    }

    fn set_metadata(&mut self, key: &[u8], metadata: Metadata) -> bool {
        self.check_live();
        let Some(idx) = self.find(key) else {
            return false;
        };
        match &mut self.slots[idx] {
            Slot::Occupied(entry) => {
                entry.metadata = metadata;
                true
            }
            _ => false,
        }
    }

    fn eviction_candidate(&mut self, accept: &dyn Fn(Metadata) -> bool) -> Option<usize> {
        self.check_live();
        if self.occupied == 0 {
            return None;
        }

        // Two full sweeps: the first may only clear reference bits.
        for _ in 0..2 * self.slots.len() {
            let idx = self.hand;
            self.hand = (self.hand + 1) & self.mask;

            if let Slot::Occupied(entry) = &mut self.slots[idx] {
                if entry.metadata.has(Metadata::ACCESSED) {
                    entry.metadata = entry.metadata.without(Metadata::ACCESSED);
                    continue;
                }
                if accept(entry.metadata) {
                    return Some(idx);
                }
            }
        }
        None
    }

    fn entry_at(&self, index: usize) -> Option<EntryRef<'_>> {
        self.check_live();
        match self.slots.get(index)? {
            Slot::Occupied(entry) => Some(self.view(entry)),
            _ => None,
        }
    }

    fn remove_at(&mut self, index: usize, shrink: bool) -> bool {
        self.check_live();
        if index >= self.slots.len() {
            return false;
        }
        self.vacate(index, shrink).is_some()
    }

    fn clear(&mut self) {
        self.check_live();
        self.slots.fill(Slot::Empty);
        self.occupied = 0;
        self.removed = 0;
        self.active = None;
        self.spare.clear();
        for id in 0..self.pages.len() {
            self.return_page(id as u32);
        }
        self.pages.clear();
    }

    fn release(&mut self) {
        self.check_live();
        let pages = self.held_pages();
        self.clear();
        self.released = true;
        tracing::debug!(pages, "released engine pages");
    }

    fn len(&self) -> usize {
        self.occupied
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl Drop for PagedEngine {
    fn drop(&mut self) {
        if !self.released {
            self.release();
        }
    }
}
