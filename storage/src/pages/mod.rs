//! A fixed-capacity pool of fixed-size pages shared by cooperating processes.
//!
//! [PagePool] carves a shared [shoal_runtime::shm::Region] into equally sized pages. One
//! (coordinating) process creates the pool with [PagePool::init] and other processes map it with
//! [PagePool::attach]. Every process can then [PagePool::get] and [PagePool::put] pages without
//! taking a lock.
//!
//! # Format
//!
//! ```text
//! +--------------------+------------------------+------------------------+-----+---------------+
//! | Header (128 bytes) | Next links (u32 * cap) | Page states (u32 * cap) | pad | Pages         |
//! +--------------------+------------------------+------------------------+-----+---------------+
//! ```
//!
//! The header holds the pool identity (magic, version, pool id, page size, capacity), the head of
//! the free list, and the per-[Purpose] levels and soft limits. Free pages form a lock-free stack
//! threaded through the next links. The head word packs `tag << 32 | index`, where the tag is
//! bumped on every change so a concurrent pop cannot mistake a recycled head for the one it read.
//!
//! Each page state word packs `generation << 1 | busy`. Releasing a page bumps its generation, so a
//! [PageId] held after its page was returned (or returned twice) is detected with a single
//! compare-and-swap instead of silently aliasing whatever the page holds next.
//!
//! # Limits
//!
//! Each [Purpose] has a soft limit raised with [PagePool::note_need]. A purpose nobody noted a
//! need for is limited only by the pool capacity, which is always the hard ceiling.
//!
//! # Example
//!
//! ```rust
//! use prometheus_client::registry::Registry;
//! use shoal_storage::pages::{Config, PagePool, Purpose};
//! use shoal_utils::{NZUsize, NZU64};
//!
//! let mut registry = Registry::default();
//! let pool = PagePool::init(
//!     Config {
//!         name: "pages".into(),
//!         directory: None,
//!         page_size: NZUsize!(4096),
//!         capacity_bytes: NZU64!(16 * 4096),
//!     },
//!     &mut registry,
//! )
//! .unwrap();
//!
//! let page = pool.get(Purpose::Transient).unwrap();
//! pool.write(page, 0, b"hello");
//! let mut buf = [0u8; 5];
//! pool.read(page, 0, &mut buf);
//! assert_eq!(&buf, b"hello");
//! pool.put(page);
//! ```

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use std::{
    fmt,
    num::{NonZeroU64, NonZeroUsize},
    path::PathBuf,
};
use thiserror::Error;

mod pool;
pub use pool::PagePool;

/// Largest number of pages a pool may hold (page numbers are packed in 24 bits).
pub const MAX_CAPACITY: u32 = 1 << 24;

/// Page size of a pool configured with [Config::new].
pub const DEFAULT_PAGE_SIZE: NonZeroUsize = match NonZeroUsize::new(32 * 1024) {
    Some(size) => size,
    None => panic!("page size must be non-zero"),
};

/// Errors that can occur when interacting with a [PagePool].
#[derive(Debug, Error)]
pub enum Error {
    #[error("runtime error: {0}")]
    Runtime(#[from] shoal_runtime::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("corrupt pool header: {0}")]
    Corrupt(&'static str),
}

/// Configuration for a [PagePool].
#[derive(Clone, Debug)]
pub struct Config {
    /// Name of the shared region.
    pub name: String,

    /// Directory holding the shared region (usually `/dev/shm`).
    ///
    /// If `None`, the pool lives in anonymous memory private to this process and cannot be
    /// attached by others.
    pub directory: Option<PathBuf>,

    /// Size of each page in bytes.
    pub page_size: NonZeroUsize,

    /// Total bytes of pages the pool holds (rounded down to a whole number of pages).
    pub capacity_bytes: NonZeroU64,
}

impl Config {
    /// A pool of [DEFAULT_PAGE_SIZE] pages named `name` in `directory`.
    pub fn new(name: &str, directory: Option<PathBuf>, capacity_bytes: NonZeroU64) -> Self {
        Self {
            name: name.into(),
            directory,
            page_size: DEFAULT_PAGE_SIZE,
            capacity_bytes,
        }
    }
}

/// What a page is used for.
///
/// Each purpose has its own level and soft limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, EncodeLabelValue)]
#[repr(u8)]
pub enum Purpose {
    /// Bytes of objects still being fetched, shared with collapsed readers.
    Transient = 0,
    /// Objects held by the shared memory cache.
    MemoryCache = 1,
    /// Buffers for disk reads and writes.
    DiskIo = 2,
}

impl Purpose {
    /// Number of purposes.
    pub const COUNT: usize = 3;

    /// Every purpose, in numbering order.
    pub const ALL: [Purpose; Self::COUNT] =
        [Purpose::Transient, Purpose::MemoryCache, Purpose::DiskIo];

    /// Parse a purpose from its number.
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Purpose::Transient => "transient",
            Purpose::MemoryCache => "memory_cache",
            Purpose::DiskIo => "disk_io",
        };
        f.write_str(name)
    }
}

/// Label attached to per-purpose pool metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub(crate) struct PurposeLabel {
    purpose: Purpose,
}

impl From<Purpose> for PurposeLabel {
    fn from(purpose: Purpose) -> Self {
        Self { purpose }
    }
}

/// Identifies an allocated page.
///
/// A [PageId] is only meaningful to the pool that issued it (identified by `pool`) and only until
/// the page is returned (after which `generation` no longer matches).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PageId {
    /// Identity of the issuing pool.
    pub pool: u32,
    /// What the page was requested for.
    pub purpose: Purpose,
    /// Index of the page within the pool.
    pub number: u32,
    /// Generation of the page when it was handed out.
    pub generation: u32,
}

impl PageId {
    /// Pack into a word that can be stored in shared memory (the pool id is implied).
    ///
    /// Layout: `purpose (8 bits) | number (24 bits) | generation (32 bits)`.
    pub fn pack(&self) -> u64 {
        ((self.purpose as u64) << 56) | ((self.number as u64) << 32) | self.generation as u64
    }

    /// Unpack a word produced by [PageId::pack] for the pool `pool`.
    pub fn unpack(pool: u32, packed: u64) -> Option<Self> {
        let purpose = Purpose::from_u8((packed >> 56) as u8)?;
        Some(Self {
            pool,
            purpose,
            number: ((packed >> 32) as u32) & (MAX_CAPACITY - 1),
            generation: packed as u32,
        })
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}#{}({})",
            self.pool, self.number, self.generation, self.purpose
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Purpose::Transient, 0, 0; "first page")]
    #[test_case(Purpose::MemoryCache, 12345, 7; "middle page")]
    #[test_case(Purpose::DiskIo, MAX_CAPACITY - 1, u32::MAX >> 1; "largest values")]
    fn test_page_id_pack(purpose: Purpose, number: u32, generation: u32) {
        let id = PageId {
            pool: 99,
            purpose,
            number,
            generation,
        };
        assert_eq!(PageId::unpack(99, id.pack()), Some(id));
    }

    #[test]
    fn test_page_id_unpack_unknown_purpose() {
        assert_eq!(PageId::unpack(1, 7u64 << 56), None);
    }

    #[test]
    fn test_purpose_numbering() {
        for purpose in Purpose::ALL {
            assert_eq!(Purpose::from_u8(purpose as u8), Some(purpose));
        }
        assert_eq!(Purpose::from_u8(3), None);
        assert_eq!(Purpose::DiskIo.to_string(), "disk_io");
    }
}
