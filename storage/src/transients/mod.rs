//! Coordinate in-flight cache entries across cooperating processes.
//!
//! When several clients ask for the same uncached object at once, only one of them (the writer)
//! should fetch it while the others (readers) wait for, or stream, the same bytes. [Transients]
//! is the shared index that makes this possible: a writer announces the object with
//! [Transients::start_writing], readers find it with [Transients::get_async], and the writer
//! ends the transfer with [Transients::complete_writing] or [Transients::abandon].
//!
//! # Format
//!
//! The table lives in a [shoal_runtime::shm::Region] so every process sees the same entries:
//!
//! ```text
//! +-------------------+-----------+-----------+-----+-----------+
//! | Header (64 bytes) |  Slot 0   |  Slot 1   | ... | Slot N-1  |
//! +-------------------+-----------+-----------+-----+-----------+
//!
//! Slot:
//! +-------+-------+---------+--------+-------+-----------+--------+---------+
//! | State | Epoch | Readers | Writer | Flags | Req flags | Method | URL len |
//! +-------+-------+---------+--------+-------+-----------+--------+---------+
//! | Staged size (u64) | Page count | Key (16) | Pages (u64 * 32) | URL (1024) |
//! +-------------------+------------+----------+------------------+------------+
//! ```
//!
//! An entry for key `k` lives within [Config::window] slots of `k`'s home slot. Slot mutations and
//! keyed lookups happen while holding a lock word in the table header, so two processes can
//! never both become the writer of the same key.
//!
//! # Lifecycle
//!
//! An entry is `Writing` until the writer completes or abandons it. Terminal entries stay
//! visible while anyone is attached; once the last writer or reader disconnects the slot (and
//! any staged pages) is reclaimed. Starting a new writer for a key whose previous entry is
//! terminal but still has readers retires the old entry: it disappears from lookups but stays
//! intact for the readers still using it.
//!
//! # Staging
//!
//! With a [crate::pages::PagePool], the writer can [Transients::stage] response bytes into
//! shared pages as they arrive and readers [Transients::read] them before the object reaches
//! disk. The staged size is published with release ordering after the bytes are copied, so a
//! reader never observes a size covering bytes it cannot yet see.
//!
//! # Notifications
//!
//! Readers waiting on a `Writing` entry hold a [Subscription], a future resolving exactly once to
//! a [Notice]. Transitions made in this process notify waiters immediately; transitions made by
//! other processes are picked up by [Transients::poll].
//!
//! # Example
//!
//! ```rust
//! use futures::executor::block_on;
//! use prometheus_client::registry::Registry;
//! use shoal_storage::transients::{Config, Lookup, Method, Notice, RequestFlags, Transients};
//! use shoal_utils::{CacheKey, NZU32};
//!
//! let mut registry = Registry::default();
//! let transients = Transients::init(
//!     Config {
//!         name: "transients".into(),
//!         directory: None,
//!         entries: NZU32!(64),
//!         window: NZU32!(8),
//!     },
//!     None,
//!     &mut registry,
//! )
//! .unwrap();
//!
//! let url = "http://example.com/";
//! let key = CacheKey::from_request(b"GET", url.as_bytes());
//! let writer = transients
//!     .start_writing(key, url, RequestFlags::CACHABLE, Method::Get)
//!     .unwrap();
//!
//! let Lookup::Pending(subscription) = transients.get_async(&key) else {
//!     panic!("entry should be pending");
//! };
//! transients.complete_writing(&writer);
//! let (_reader, notice) = block_on(subscription);
//! assert_eq!(notice, Notice::Available);
//! ```

use bitflags::bitflags;
use bytes::Bytes;
use shoal_utils::CacheKey;
use std::{fmt, num::NonZeroU32, path::PathBuf};
use thiserror::Error;

mod handles;
mod table;
pub use handles::{Participant, Reader, Subscription, Writer};
pub use table::Transients;

/// Longest URL (in bytes) an entry can hold.
pub const MAX_URL_LEN: usize = 1024;

/// Most pages a single entry can stage.
pub const MAX_PAGES: usize = 32;

/// Errors that can occur when interacting with [Transients].
#[derive(Debug, Error)]
pub enum Error {
    #[error("runtime error: {0}")]
    Runtime(#[from] shoal_runtime::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("corrupt table header: {0}")]
    Corrupt(&'static str),
    #[error("entry already has a writer: {0}")]
    Busy(CacheKey),
    #[error("no free slot near: {0}")]
    Full(CacheKey),
    #[error("url too long: {0} bytes")]
    UrlTooLong(usize),
    #[error("entry is not being written")]
    NotWriting,
    #[error("entry is not staged in shared memory")]
    Unstaged,
}

/// Configuration for [Transients].
#[derive(Clone, Debug)]
pub struct Config {
    /// Name of the shared region.
    pub name: String,

    /// Directory holding the shared region (usually `/dev/shm`).
    ///
    /// If `None`, the table lives in anonymous memory private to this process.
    pub directory: Option<PathBuf>,

    /// Number of slots in the table.
    pub entries: NonZeroU32,

    /// Number of consecutive slots searched for a key (capped at `entries`).
    pub window: NonZeroU32,
}

/// State of an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// A writer is fetching the object.
    Writing,
    /// The object was fully received.
    Completed,
    /// The writer gave up; readers must fetch the object on their own.
    Abandoned,
}

impl State {
    pub(crate) fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Writing),
            2 => Some(Self::Completed),
            3 => Some(Self::Abandoned),
            _ => None,
        }
    }

    pub(crate) fn to_u32(self) -> u32 {
        match self {
            Self::Writing => 1,
            Self::Completed => 2,
            Self::Abandoned => 3,
        }
    }

    /// Returns true if the writer is done with the entry.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Writing)
    }
}

/// Outcome delivered to a [Subscription].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Notice {
    /// The object is complete and can be read.
    Available,
    /// The writer abandoned the object.
    Abandoned,
}

/// Request method of the entry (passed through from the HTTP layer).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Method {
    Get = 0,
    Head = 1,
    Post = 2,
    Put = 3,
    Delete = 4,
    Options = 5,
    Trace = 6,
    Connect = 7,
    Patch = 8,
    Other = 255,
}

impl Method {
    /// Canonical (upper case) name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Trace => "TRACE",
            Self::Connect => "CONNECT",
            Self::Patch => "PATCH",
            Self::Other => "OTHER",
        }
    }

    /// Parse a method name (case sensitive, unknown names map to [Method::Other]).
    pub fn parse(name: &str) -> Self {
        match name {
            "GET" => Self::Get,
            "HEAD" => Self::Head,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "OPTIONS" => Self::Options,
            "TRACE" => Self::Trace,
            "CONNECT" => Self::Connect,
            "PATCH" => Self::Patch,
            _ => Self::Other,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Get,
            1 => Self::Head,
            2 => Self::Post,
            3 => Self::Put,
            4 => Self::Delete,
            5 => Self::Options,
            6 => Self::Trace,
            7 => Self::Connect,
            8 => Self::Patch,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// Request properties recorded with an entry so that any process can rebuild the store
    /// entry from the table alone.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct RequestFlags: u32 {
        const CACHABLE = 1 << 0;
        const HIERARCHICAL = 1 << 1;
        const NO_CACHE = 1 << 2;
        const RELOAD_INTO_IMS = 1 << 3;
        const NEED_VALIDATION = 1 << 4;
        const IMS = 1 << 5;
        const AUTH = 1 << 6;
        const RANGE = 1 << 7;
        const LOOP_DETECTED = 1 << 8;
    }
}

bitflags! {
    /// Slot bookkeeping flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub(crate) struct SlotFlags: u32 {
        /// Replaced by a newer entry for the same key; invisible to lookups.
        const RETIRED = 1 << 0;
        /// Staging stopped; readers must wait for the disk copy.
        const UNSTAGED = 1 << 1;
    }
}

/// Point-in-time copy of an entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub key: CacheKey,
    pub url: Bytes,
    pub method: Method,
    pub flags: RequestFlags,
    pub state: State,
    /// Bytes staged in shared pages so far.
    pub size: u64,
    /// Number of attached readers.
    pub readers: u32,
    /// Whether a writer is attached.
    pub writer: bool,
    /// Whether the staged bytes are usable (staging never stopped early).
    pub staged: bool,
}

/// Outcome of [Transients::get_async].
pub enum Lookup {
    /// No usable entry (none exists or it was abandoned).
    Missing,
    /// The entry is complete.
    Ready(Reader),
    /// The entry is still being written.
    Pending(Subscription),
}

impl fmt::Debug for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lookup::Missing => f.write_str("Missing"),
            Lookup::Ready(_) => f.write_str("Ready"),
            Lookup::Pending(_) => f.write_str("Pending"),
        }
    }
}
