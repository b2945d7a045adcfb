//! Shared, upfront-allocating page source.
//!
//! The whole byte budget is mapped once at construction and carved into
//! fixed-size pages. Segments borrow pages as they need room for entries and
//! hand them back when the pages empty out or the segment is destroyed.
//!
//! # Thread Safety
//!
//! The free list is a lock-free injector queue, so segments on different
//! threads can allocate and free pages without coordinating.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_deque::{Injector, Steal};

use crate::region::{HugepageSize, Region};

/// A fixed-size page of off-heap memory.
///
/// Pages are deliberately not `Clone`: the holder owns the memory until it is
/// passed back through [`PageSource::free`].
#[derive(Debug)]
pub struct Page {
    index: u32,
    ptr: NonNull<u8>,
    len: usize,
}

// A page is exclusively owned by whoever holds it.
unsafe impl Send for Page {}

impl Page {
    /// Index of this page within its source.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read `len` bytes starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range falls outside the page.
    #[inline]
    pub fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= self.len, "read past end of page");
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) }
    }

    /// Copy `data` into the page at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range falls outside the page.
    #[inline]
    pub fn write(&mut self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.len, "write past end of page");
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
    }

    /// Copy `len` bytes from `src` to `dst` within the page. The ranges may
    /// overlap.
    ///
    /// # Panics
    ///
    /// Panics if either range falls outside the page.
    #[inline]
    pub fn copy_within(&mut self, src: usize, dst: usize, len: usize) {
        assert!(
            src.max(dst) + len <= self.len,
            "copy past end of page"
        );
        unsafe {
            std::ptr::copy(self.ptr.as_ptr().add(src), self.ptr.as_ptr().add(dst), len);
        }
    }
}

/// Hands out fixed-size pages carved from a single [`Region`].
pub struct PageSource {
    region: Region,
    page_size: usize,
    page_count: u32,
    free: Injector<u32>,
    used: AtomicUsize,
}

impl PageSource {
    /// Map `max_size` bytes and split them into `page_size` pages.
    ///
    /// Any tail smaller than a page is left unused.
    pub fn new(
        max_size: usize,
        page_size: usize,
        hugepage: HugepageSize,
    ) -> Result<Self, std::io::Error> {
        if page_size == 0 || page_size > max_size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("page size {page_size} does not fit in {max_size} bytes"),
            ));
        }
        if page_size > u32::MAX as usize {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "page size exceeds 4GB",
            ));
        }

        let page_count = max_size / page_size;
        let page_count = u32::try_from(page_count).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "too many pages")
        })?;

        let region = Region::map(page_count as usize * page_size, hugepage)?;

        let free = Injector::new();
        for index in 0..page_count {
            free.push(index);
        }

        tracing::debug!(page_size, page_count, "created page source");

        Ok(Self {
            region,
            page_size,
            page_count,
            free,
            used: AtomicUsize::new(0),
        })
    }

    /// Take a page off the free list, or `None` if every page is in use.
    pub fn allocate(&self) -> Option<Page> {
        loop {
            match self.free.steal() {
                Steal::Success(index) => {
                    self.used.fetch_add(1, Ordering::Relaxed);
                    let ptr = unsafe { self.region.as_ptr().add(index as usize * self.page_size) };
                    tracing::trace!(index, "allocated page");
                    return Some(Page {
                        index,
                        // SAFETY: derived from a non-null mapping
                        ptr: unsafe { NonNull::new_unchecked(ptr) },
                        len: self.page_size,
                    });
                }
                Steal::Retry => continue,
                Steal::Empty => return None,
            }
        }
    }

    /// Return a page to the free list.
    ///
    /// # Panics
    ///
    /// Panics if the page was not handed out by this source.
    pub fn free(&self, page: Page) {
        assert!(
            page.index < self.page_count && self.region.contains(page.ptr.as_ptr(), page.len),
            "page {} does not belong to this source",
            page.index
        );
        tracing::trace!(index = page.index, "freed page");
        self.used.fetch_sub(1, Ordering::Relaxed);
        self.free.push(page.index);
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn page_count(&self) -> usize {
        self.page_count as usize
    }

    /// Pages currently held by segments.
    #[inline]
    pub fn used_pages(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn free_pages(&self) -> usize {
        self.page_count() - self.used_pages()
    }

    #[inline]
    pub fn uses_hugepages(&self) -> bool {
        self.region.uses_hugepages()
    }
}

impl std::fmt::Debug for PageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageSource")
            .field("page_size", &self.page_size)
            .field("page_count", &self.page_count)
            .field("used", &self.used_pages())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(pages: usize) -> PageSource {
        PageSource::new(pages * 4096, 4096, HugepageSize::None).expect("page source")
    }

    #[test]
    fn test_allocate_until_exhausted() {
        let source = source(4);
        assert_eq!(source.page_count(), 4);

        let pages: Vec<Page> = (0..4).map(|_| source.allocate().expect("page")).collect();
        assert!(source.allocate().is_none());
        assert_eq!(source.used_pages(), 4);
        assert_eq!(source.free_pages(), 0);

        for page in pages {
            source.free(page);
        }
        assert_eq!(source.used_pages(), 0);
        assert!(source.allocate().is_some());
    }

    #[test]
    fn test_pages_do_not_overlap() {
        let source = source(2);
        let mut a = source.allocate().unwrap();
        let mut b = source.allocate().unwrap();
        assert_ne!(a.index(), b.index());

        a.write(0, &[1u8; 4096]);
        b.write(0, &[2u8; 4096]);
        assert!(a.bytes(0, 4096).iter().all(|&x| x == 1));
        assert!(b.bytes(0, 4096).iter().all(|&x| x == 2));

        source.free(a);
        source.free(b);
    }

    #[test]
    fn test_tail_is_unused() {
        let source = PageSource::new(3 * 4096 + 100, 4096, HugepageSize::None).unwrap();
        assert_eq!(source.page_count(), 3);
    }

    #[test]
    fn test_invalid_page_size() {
        assert!(PageSource::new(4096, 0, HugepageSize::None).is_err());
        assert!(PageSource::new(4096, 8192, HugepageSize::None).is_err());
    }

    #[test]
    #[should_panic(expected = "does not belong")]
    fn test_free_foreign_page() {
        let a = source(1);
        let b = source(1);
        let page = a.allocate().unwrap();
        b.free(page);
    }

    #[test]
    fn test_copy_within_overlapping() {
        let source = source(1);
        let mut page = source.allocate().unwrap();
        page.write(0, b"..abcdef");
        page.copy_within(2, 0, 6);
        assert_eq!(page.bytes(0, 6), b"abcdef");

        page.copy_within(0, 4090, 6);
        assert_eq!(page.bytes(4090, 6), b"abcdef");
        source.free(page);
    }

    #[test]
    #[should_panic(expected = "write past end")]
    fn test_write_past_end() {
        let source = source(1);
        let mut page = source.allocate().unwrap();
        page.write(4090, &[0u8; 10]);
    }
}
