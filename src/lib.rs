//! A single shard of a segmented off-heap cache.
//!
//! A [`Segment`] stores serialized keys and values in pages drawn from a
//! shared [`PageSource`]. Every entry carries a small [`Metadata`] word whose
//! top two bits record whether the entry is pinned (held in place until
//! explicitly unpinned) or vetoed (matched the eviction veto predicate at its
//! last write). The owning cache routes keys to segments and asks them to give
//! up entries when it needs room.
//!
//! # Architecture
//!
//! ```text
//! +------------------------------------------+
//! |             Segment<K, V>                |
//! |  veto predicate, eviction listener       |
//! |                                          |
//! |  +------------------------------------+  |
//! |  | Mutex<StorageFacade<K, V>>         |  |
//! |  | - key / value serializers          |  |
//! |  +------------------------------------+  |
//! |        |                                 |
//! |        v                                 |
//! |  +------------------------------------+  |
//! |  | PagedEngine (StorageEngine)        |  |
//! |  | - slot table (ahash, probing)      |  |
//! |  | - [key][value] bump-allocated      |  |
//! |  +------------------------------------+  |
//! +--------|---------------------------------+
//!          v
//!  +-----------------------------------+
//!  | PageSource (shared via Arc)       |
//!  | - one mmap Region, fixed pages    |
//!  +-----------------------------------+
//! ```
//!
//! # Pinning
//!
//! A pinned entry is never chosen for eviction. `put` clears the pin,
//! `put_pinned` sets it. The compute family keeps an existing pin when the
//! mapping function leaves the value [`Computed::Unchanged`] and takes the
//! pin from the request when it supplies a new value.
//!
//! # Example
//!
//! ```
//! use offheap_segment::{Computed, SegmentConfig, Segment, StringSerializer};
//!
//! let config = SegmentConfig::for_size(1024 * 1024);
//! let source = config.page_source().unwrap();
//!
//! let segment: Segment<String, String> =
//!     Segment::builder(config.engine(&source), StringSerializer, StringSerializer)
//!         .veto(|key: &String, _: &String| key.starts_with("session:"))
//!         .build();
//!
//! segment.put_pinned(&"config".to_string(), &"v1".to_string()).unwrap();
//! segment
//!     .compute(&"config".to_string(), |_, _| Computed::Unchanged, false)
//!     .unwrap();
//! assert!(segment.is_pinned(&"config".to_string()));
//!
//! // nothing here may be evicted
//! assert_eq!(segment.get_eviction_index(), None);
//!
//! segment.destroy();
//! assert_eq!(source.used_pages(), 0);
//! ```

#![warn(clippy::all)]

pub mod config;
mod engine;
mod error;
mod eviction;
mod facade;
pub mod logging;
mod metadata;
mod page_source;
mod region;
mod segment;
mod serializer;

pub use config::{ConfigError, LogFormat, LoggingConfig, SegmentConfig};
pub use engine::{EntryRef, PagedEngine, StorageEngine};
pub use error::{SegmentError, SegmentResult, SerializerError};
pub use eviction::{EvictionListener, EvictionVeto};
pub use facade::StorageFacade;
pub use metadata::Metadata;
pub use page_source::{Page, PageSource};
pub use region::{HugepageSize, Region};
pub use segment::{Computed, Segment, SegmentBuilder};
pub use serializer::{BytesSerializer, Serializer, StringSerializer, U64Serializer, VecSerializer};
