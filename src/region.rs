//! Anonymous memory mappings backing the page source.
//!
//! A [`Region`] is a single `mmap` reservation that lives outside the Rust
//! heap. Explicit hugepages are attempted when requested and fall back to
//! regular pages with a transparent hugepage hint.

use serde::Deserialize;
use std::ptr::NonNull;

const KB: usize = 1024;
const MB: usize = 1024 * KB;
const GB: usize = 1024 * MB;

const REGULAR_PAGE: usize = 4 * KB;

/// Hugepage preference for a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum HugepageSize {
    /// Regular pages. The OS may still apply THP.
    #[default]
    #[serde(rename = "none")]
    None,
    /// 2MB hugepages, falling back to regular pages.
    #[serde(rename = "2mb")]
    TwoMegabyte,
    /// 1GB hugepages, falling back to regular pages.
    #[serde(rename = "1gb")]
    OneGigabyte,
}

impl HugepageSize {
    fn bytes(self) -> usize {
        match self {
            HugepageSize::None => REGULAR_PAGE,
            HugepageSize::TwoMegabyte => 2 * MB,
            HugepageSize::OneGigabyte => GB,
        }
    }
}

/// An anonymous memory mapping, unmapped on drop.
#[derive(Debug)]
pub struct Region {
    ptr: NonNull<u8>,
    len: usize,
    hugepages: bool,
}

// The mapping is plain memory; access is coordinated by the page source.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Map at least `size` bytes with the given hugepage preference.
    pub fn map(size: usize, hugepage: HugepageSize) -> Result<Self, std::io::Error> {
        if size == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "cannot map zero bytes",
            ));
        }

        if hugepage != HugepageSize::None {
            let len = round_up(size, hugepage.bytes());
            match mmap_anonymous(len, huge_flags(hugepage)) {
                Ok(ptr) => {
                    tracing::debug!(len, ?hugepage, "mapped region with hugepages");
                    return Ok(Self {
                        ptr,
                        len,
                        hugepages: true,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        ?hugepage,
                        error = %e,
                        "hugepage mapping failed, falling back to regular pages"
                    );
                }
            }
        }

        let len = round_up(size, REGULAR_PAGE);
        let ptr = mmap_anonymous(len, 0)?;
        advise_thp(ptr, len);
        tracing::debug!(len, "mapped region");
        Ok(Self {
            ptr,
            len,
            hugepages: false,
        })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Mapped length, rounded up from the requested size.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn uses_hugepages(&self) -> bool {
        self.hugepages
    }

    /// Returns `true` if `ptr..ptr + len` lies inside this region.
    pub fn contains(&self, ptr: *const u8, len: usize) -> bool {
        let start = self.ptr.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= start && addr + len <= start + self.len
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        let result = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        debug_assert_eq!(result, 0, "munmap failed");
    }
}

#[inline]
fn round_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

#[cfg(target_os = "linux")]
fn huge_flags(hugepage: HugepageSize) -> libc::c_int {
    const MAP_HUGE_SHIFT: libc::c_int = 26;
    match hugepage {
        HugepageSize::None => 0,
        HugepageSize::TwoMegabyte => libc::MAP_HUGETLB | (21 << MAP_HUGE_SHIFT),
        HugepageSize::OneGigabyte => libc::MAP_HUGETLB | (30 << MAP_HUGE_SHIFT),
    }
}

#[cfg(not(target_os = "linux"))]
fn huge_flags(_hugepage: HugepageSize) -> libc::c_int {
    0
}

fn mmap_anonymous(len: usize, extra_flags: libc::c_int) -> Result<NonNull<u8>, std::io::Error> {
    #[cfg(not(target_os = "linux"))]
    if extra_flags != 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "hugepages not supported on this platform",
        ));
    }

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra_flags,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }

    NonNull::new(ptr.cast::<u8>())
        .ok_or_else(|| std::io::Error::other("mmap returned a null mapping"))
}

#[cfg(target_os = "linux")]
fn advise_thp(ptr: NonNull<u8>, len: usize) {
    // best effort
    unsafe {
        let _ = libc::madvise(ptr.as_ptr().cast(), len, libc::MADV_HUGEPAGE);
    }
}

#[cfg(not(target_os = "linux"))]
fn advise_thp(_ptr: NonNull<u8>, _len: usize) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(1, REGULAR_PAGE), REGULAR_PAGE);
        assert_eq!(round_up(REGULAR_PAGE, REGULAR_PAGE), REGULAR_PAGE);
        assert_eq!(round_up(REGULAR_PAGE + 1, REGULAR_PAGE), 2 * REGULAR_PAGE);
        assert_eq!(round_up(2 * MB + 1, 2 * MB), 4 * MB);
    }

    #[test]
    fn test_map_regular() {
        let region = Region::map(MB, HugepageSize::None).expect("map failed");
        assert_eq!(region.len(), MB);
        assert!(!region.uses_hugepages());

        unsafe {
            std::ptr::write_volatile(region.as_ptr().add(MB - 1), 7);
            assert_eq!(std::ptr::read_volatile(region.as_ptr().add(MB - 1)), 7);
        }
    }

    #[test]
    fn test_map_rounds_up() {
        let region = Region::map(100, HugepageSize::None).expect("map failed");
        assert_eq!(region.len(), REGULAR_PAGE);
    }

    #[test]
    fn test_map_zero_rejected() {
        let err = Region::map(0, HugepageSize::None).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_hugepage_preference_always_maps() {
        // Falls back to regular pages when no hugepages are reserved.
        let region = Region::map(MB, HugepageSize::TwoMegabyte).expect("map failed");
        assert!(region.len() >= MB);
    }

    #[test]
    fn test_contains() {
        let region = Region::map(REGULAR_PAGE, HugepageSize::None).expect("map failed");
        assert!(region.contains(region.as_ptr(), REGULAR_PAGE));
        assert!(!region.contains(region.as_ptr(), REGULAR_PAGE + 1));
    }
}
