//! Error types for segment operations.

/// Errors that can occur during segment operations.
#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    /// The page source has no page left for the entry.
    /// The owning cache is expected to evict and retry.
    #[error("out of memory: no page available for a {size} byte entry")]
    OutOfMemory { size: usize },

    /// The encoded key and value do not fit in a single page.
    #[error("entry of {size} bytes exceeds page size of {page_size} bytes")]
    EntryTooLarge { size: usize, page_size: usize },

    /// Every slot in the table is occupied.
    #[error("slot table full ({capacity} slots)")]
    TableFull { capacity: usize },

    /// Stored bytes could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] SerializerError),

    /// The backing memory region could not be mapped.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SegmentError {
    /// Returns `true` if the error means the segment could not find room for
    /// a write. These are the failures an owning cache answers with eviction.
    pub fn is_allocation_failure(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory { .. } | Self::EntryTooLarge { .. } | Self::TableFull { .. }
        )
    }
}

/// Errors produced while decoding stored bytes.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SerializerError {
    #[error("invalid utf-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("expected {expected} bytes, found {actual}")]
    Length { expected: usize, actual: usize },
}

/// Result type for segment operations.
pub type SegmentResult<T> = Result<T, SegmentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            SegmentError::OutOfMemory { size: 42 }.to_string(),
            "out of memory: no page available for a 42 byte entry"
        );
        assert_eq!(
            SegmentError::EntryTooLarge {
                size: 10,
                page_size: 4
            }
            .to_string(),
            "entry of 10 bytes exceeds page size of 4 bytes"
        );
        assert_eq!(
            SegmentError::TableFull { capacity: 64 }.to_string(),
            "slot table full (64 slots)"
        );
        assert_eq!(
            SerializerError::Length {
                expected: 8,
                actual: 3
            }
            .to_string(),
            "expected 8 bytes, found 3"
        );
    }

    #[test]
    fn test_allocation_failures() {
        assert!(SegmentError::OutOfMemory { size: 1 }.is_allocation_failure());
        assert!(
            SegmentError::EntryTooLarge {
                size: 2,
                page_size: 1
            }
            .is_allocation_failure()
        );
        assert!(SegmentError::TableFull { capacity: 1 }.is_allocation_failure());

        let decode = SegmentError::from(SerializerError::Length {
            expected: 8,
            actual: 0,
        });
        assert!(!decode.is_allocation_failure());
    }

    #[test]
    fn test_error_is_error_trait() {
        fn assert_error<E: std::error::Error + Send + Sync + 'static>() {}
        assert_error::<SegmentError>();
        assert_error::<SerializerError>();
    }
}
