//! Persist cached objects to disk and find them again after a restart.
//!
//! A cache directory stores each object in a numbered slot (its "fileno") as a
//! [crate::swapmeta::Header] followed by the body. The index mapping cache keys to slots is kept
//! in memory and rebuilt from the slots themselves on startup ([SwapDir::rebuild]), so the disk
//! is the only source of truth.
//!
//! Two kinds of directories are available:
//!
//! - [rock]: a single database blob split into fixed-size slots (cheap to scan, bounded object
//!   size).
//! - [ufs]: one blob per object (unbounded object size, one file per slot).
//!
//! Both implement [SwapDir] through [Dir]; [Directory] selects one from [Config::kind].
//!
//! # Writing
//!
//! ```text
//! create ──> write* ──> commit
//!   │          │
//!   └──────────┴──> discard
//! ```
//!
//! [SwapDir::create] reserves a slot and invalidates whatever it held before (so a crash
//! mid-write never resurrects the previous object). Body bytes are written after the space
//! reserved for the header; [SwapDir::commit] writes the header last and syncs, making the object
//! visible to a future rebuild only once it is complete.
//!
//! When a [crate::transients::Transients] table is configured, [SwapDir::create] also becomes the
//! entry's writer there so concurrent requests for the same object can collapse onto this
//! transfer; committing completes the transient entry and discarding abandons it.
//!
//! # Eviction
//!
//! A directory is [SwapDir::full] once used slots or bytes exceed the high-water mark.
//! [SwapDir::maintain] then evicts objects in [Policy] order until usage drops below the
//! low-water mark. Objects pinned with [SwapDir::reference] are never evicted, and unlinking a
//! pinned object is deferred until its last [SwapDir::dereference].
//!
//! # Example
//!
//! ```rust
//! use prometheus_client::registry::Registry;
//! use shoal_runtime::memory::Storage;
//! use shoal_storage::{
//!     swapdir::{Config, Directory, Found, StoreEntry, SwapDir},
//!     transients::Method,
//! };
//! use shoal_utils::NZU64;
//!
//! # futures::executor::block_on(async {
//! let mut registry = Registry::default();
//! let cfg = Config::rock("cache", NZU64!(1 << 20), NZU64!(16 * 1024));
//! let mut dir = Directory::init(Storage::default(), cfg, None, &mut registry)
//!     .await
//!     .unwrap();
//!
//! let entry = StoreEntry::new(Method::Get, "http://example.com/");
//! let key = entry.key;
//! dir.put(entry, b"hello world").await.unwrap();
//! assert!(matches!(dir.get(&key), Some(Found::Disk(_))));
//!
//! let object = dir.read(&key).await.unwrap().unwrap();
//! assert_eq!(&object.body[..], b"hello world");
//! # });
//! ```

use crate::transients::{self, Method, RequestFlags, Writer};
use bitflags::bitflags;
use bytes::Bytes;
use prometheus_client::registry::Registry;
use shoal_runtime::Storage;
use shoal_utils::CacheKey;
use std::{
    fmt,
    future::Future,
    num::NonZeroU64,
    sync::{Arc, Mutex},
};
use thiserror::Error;
use tracing::debug;

mod dir;
mod index;
pub mod rock;
pub mod ufs;
pub use dir::{Dir, Layout};

/// Errors that can occur when interacting with a cache directory.
#[derive(Debug, Error)]
pub enum Error {
    #[error("runtime error: {0}")]
    Runtime(#[from] shoal_runtime::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("corrupt directory: {0}")]
    Corrupt(&'static str),
    #[error("directory geometry changed: stored {stored_slots} slots of {stored_slot_size} bytes")]
    GeometryMismatch {
        stored_slots: u32,
        stored_slot_size: u64,
    },
    #[error("no free slot")]
    NoSpace,
    #[error("object too large: {0} bytes")]
    TooLarge(u64),
}

/// Which kind of directory to run, with its kind-specific geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    /// One database blob of `max_size / slot_size` fixed slots.
    Rock { slot_size: NonZeroU64 },
    /// One blob per object, `max_size / average_object_size` slots.
    Ufs { average_object_size: NonZeroU64 },
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Rock { .. } => f.write_str("rock"),
            Kind::Ufs { .. } => f.write_str("ufs"),
        }
    }
}

/// Order in which objects are evicted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Policy {
    /// Least recently referenced first.
    #[default]
    Lru,
    /// Oldest stored first.
    Fifo,
}

/// Configuration for a cache directory.
#[derive(Clone, Debug)]
pub struct Config {
    /// Kind and geometry of the directory.
    pub kind: Kind,

    /// Storage partition holding the directory.
    pub partition: String,

    /// Bytes of storage the directory may use.
    pub max_size: NonZeroU64,

    /// Largest object (body) accepted, if smaller than what a slot can hold.
    pub max_object_size: Option<NonZeroU64>,

    /// Usage percentage above which the directory reports itself full.
    pub high_water: u8,

    /// Usage percentage [SwapDir::maintain] evicts down to.
    pub low_water: u8,

    /// Eviction order.
    pub policy: Policy,
}

impl Config {
    /// Default high-water mark (percent).
    pub const HIGH_WATER: u8 = 95;

    /// Default low-water mark (percent).
    pub const LOW_WATER: u8 = 90;

    /// Configuration of a [rock] directory with default limits.
    pub fn rock(partition: &str, max_size: NonZeroU64, slot_size: NonZeroU64) -> Self {
        Self::new(Kind::Rock { slot_size }, partition, max_size)
    }

    /// Configuration of a [ufs] directory with default limits.
    pub fn ufs(partition: &str, max_size: NonZeroU64, average_object_size: NonZeroU64) -> Self {
        Self::new(Kind::Ufs { average_object_size }, partition, max_size)
    }

    fn new(kind: Kind, partition: &str, max_size: NonZeroU64) -> Self {
        Self {
            kind,
            partition: partition.into(),
            max_size,
            max_object_size: None,
            high_water: Self::HIGH_WATER,
            low_water: Self::LOW_WATER,
            policy: Policy::default(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.low_water > self.high_water || self.high_water > 100 {
            return Err(Error::InvalidConfig(
                "water marks must satisfy low <= high <= 100",
            ));
        }
        Ok(())
    }
}

bitflags! {
    /// Properties of a stored object (persisted in the swap header).
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct EntryFlags: u16 {
        const SPECIAL = 1 << 0;
        const REVALIDATE_ALWAYS = 1 << 1;
        const DELAY_SENDING = 1 << 2;
        const RELEASE_REQUEST = 1 << 3;
        const REFRESH_REQUEST = 1 << 4;
        const KEY_PRIVATE = 1 << 5;
        const NEGATIVE_CACHED = 1 << 6;
        const VALIDATED = 1 << 7;
        const BAD_LENGTH = 1 << 8;
        const ABORTED = 1 << 9;
    }
}

/// An object handed to the directory by the cache manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreEntry {
    pub key: CacheKey,
    pub url: Bytes,
    pub method: Method,
    pub request_flags: RequestFlags,
    /// Seconds since the Unix epoch (negative when unknown).
    pub timestamp: i64,
    pub lastref: i64,
    pub expires: i64,
    pub lastmod: i64,
    pub refcount: u16,
    pub flags: EntryFlags,
}

impl StoreEntry {
    /// Entry for a `method` request of `url`, keyed accordingly, with unknown timestamps.
    pub fn new(method: Method, url: &str) -> Self {
        Self {
            key: CacheKey::from_request(method.as_str().as_bytes(), url.as_bytes()),
            url: Bytes::copy_from_slice(url.as_bytes()),
            method,
            request_flags: RequestFlags::CACHABLE,
            timestamp: -1,
            lastref: -1,
            expires: -1,
            lastmod: -1,
            refcount: 0,
            flags: EntryFlags::empty(),
        }
    }

    /// Whether concurrent requests may share this entry's transfer.
    pub fn collapsible(&self) -> bool {
        !self
            .flags
            .intersects(EntryFlags::KEY_PRIVATE | EntryFlags::RELEASE_REQUEST)
    }
}

/// What the index knows about a stored object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub key: CacheKey,
    pub fileno: u32,
    pub header_len: u64,
    pub object_size: u64,
    pub timestamp: i64,
    pub lastref: i64,
    pub expires: i64,
    pub lastmod: i64,
    pub refcount: u16,
    pub flags: EntryFlags,
}

impl Record {
    /// Bytes the object occupies on disk (header and body).
    pub fn swap_file_size(&self) -> u64 {
        self.header_len + self.object_size
    }
}

/// An object read back from disk.
#[derive(Clone, Debug)]
pub struct Object {
    pub record: Record,
    pub header: crate::swapmeta::Header,
    pub body: Bytes,
}

/// Result of [SwapDir::get].
#[derive(Debug)]
pub enum Found {
    /// The object is stored in this directory.
    Disk(Record),
    /// The object is still being fetched (by this or another process).
    InTransit(transients::Entry),
}

/// An object being written (see [SwapDir::create]).
///
/// Dropping it without [SwapDir::commit] or [SwapDir::discard] abandons its transient entry, and
/// the directory releases its slot on its next mutation.
pub struct Pending {
    entry: StoreEntry,
    fileno: u32,
    header_len: u64,
    written: u64,
    writer: Option<Writer>,
    staging: bool,
    orphans: Arc<Mutex<Vec<u32>>>,
    finished: bool,
}

impl Drop for Pending {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // The directory releases the slot on its next mutation
        debug!(key = %self.entry.key, fileno = self.fileno, "dropped unfinished object");
        self.orphans.lock().unwrap().push(self.fileno);
    }
}

impl Pending {
    /// Key of the object.
    pub fn key(&self) -> &CacheKey {
        &self.entry.key
    }

    /// Slot reserved for the object.
    pub fn fileno(&self) -> u32 {
        self.fileno
    }

    /// Body bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Whether concurrent readers are attached through the transient table.
    pub fn collapsed(&self) -> bool {
        self.writer.is_some()
    }
}

/// Outcome of [SwapDir::rebuild].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RebuildStats {
    /// Slots (or blobs) inspected.
    pub scanned: u64,
    /// Objects added to the index.
    pub loaded: u64,
    /// Slots never written or invalidated.
    pub zeroed: u64,
    /// Slots holding an unusable header or a size that does not fit.
    pub invalid: u64,
    /// Slots holding a key already loaded from an earlier slot.
    pub duplicates: u64,
}

impl fmt::Display for RebuildStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scanned={} loaded={} zeroed={} invalid={} duplicates={}",
            self.scanned, self.loaded, self.zeroed, self.invalid, self.duplicates
        )
    }
}

/// Usage report of a directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stat {
    pub kind: Kind,
    pub partition: String,
    pub slots: u32,
    pub used: u32,
    pub bytes: u64,
    pub max_size: u64,
    pub max_object_size: u64,
    pub high_water: u8,
    pub low_water: u8,
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} directory {}", self.kind, self.partition)?;
        writeln!(
            f,
            "  slots: {} used of {} ({:.1}%)",
            self.used,
            self.slots,
            percent(self.used as u64, self.slots as u64)
        )?;
        writeln!(
            f,
            "  bytes: {} used of {} ({:.1}%)",
            self.bytes,
            self.max_size,
            percent(self.bytes, self.max_size)
        )?;
        writeln!(f, "  max object size: {}", self.max_object_size)?;
        write!(
            f,
            "  water marks: low {}% high {}%",
            self.low_water, self.high_water
        )
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 * 100.0 / whole as f64
}

/// Capabilities of a cache directory.
pub trait SwapDir: Send {
    /// Rebuild the index by scanning every slot.
    ///
    /// Unusable and duplicate slots are counted and invalidated so they stay free. The scan never
    /// aborts on bad data.
    fn rebuild(&mut self) -> impl Future<Output = Result<RebuildStats, Error>> + Send;

    /// Reserve a slot for `entry`.
    fn create(&mut self, entry: StoreEntry) -> impl Future<Output = Result<Pending, Error>> + Send;

    /// Append body bytes to a pending object.
    fn write(
        &mut self,
        pending: &mut Pending,
        data: &[u8],
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Write the header, sync, and index the object.
    ///
    /// On failure the slot is released and the object discarded.
    fn commit(&mut self, pending: Pending) -> impl Future<Output = Result<Record, Error>> + Send;

    /// Give up on a pending object, releasing its slot.
    fn discard(&mut self, pending: Pending) -> impl Future<Output = Result<(), Error>> + Send;

    /// Store a complete object.
    fn put(
        &mut self,
        entry: StoreEntry,
        body: &[u8],
    ) -> impl Future<Output = Result<Record, Error>> + Send
    where
        Self: Sized,
    {
        async move {
            let mut pending = self.create(entry).await?;
            if let Err(err) = self.write(&mut pending, body).await {
                self.discard(pending).await?;
                return Err(err);
            }
            self.commit(pending).await
        }
    }

    /// Where `key` can be found, if anywhere.
    fn get(&mut self, key: &CacheKey) -> Option<Found>;

    /// Load the object stored under `key`.
    ///
    /// An object whose header no longer matches its record is unlinked and reported missing.
    fn read(
        &mut self,
        key: &CacheKey,
    ) -> impl Future<Output = Result<Option<Object>, Error>> + Send;

    /// Remove `key` from the directory (deferred while the object is referenced).
    ///
    /// Returns false if the key was not stored.
    fn unlink(&mut self, key: &CacheKey) -> impl Future<Output = Result<bool, Error>> + Send;

    /// Pin `key` against eviction (and refresh its position under [Policy::Lru]).
    ///
    /// Returns false if the key is not stored.
    fn reference(&mut self, key: &CacheKey) -> bool;

    /// Release a pin taken with [SwapDir::reference].
    ///
    /// Returns whether the object is still stored (it is not if it was unlinked while pinned).
    fn dereference(&mut self, key: &CacheKey)
        -> impl Future<Output = Result<bool, Error>> + Send;

    /// Evict objects until usage is below the low-water mark, returning how many were evicted.
    fn maintain(&mut self) -> impl Future<Output = Result<usize, Error>> + Send;

    /// Whether usage is above the high-water mark.
    fn full(&self) -> bool;

    /// Whether an object with a body of `size` bytes could be stored now.
    fn can_store(&self, size: u64) -> bool;

    /// Usage report.
    fn stat(&self) -> Stat;
}

/// A cache directory of any [Kind].
pub enum Directory<S: Storage> {
    Rock(Dir<rock::Rock<S>>),
    Ufs(Dir<ufs::Ufs<S>>),
}

impl<S: Storage> Directory<S> {
    /// Open (or create) the directory described by `cfg`.
    ///
    /// The index starts empty; call [SwapDir::rebuild] to load stored objects.
    pub async fn init(
        storage: S,
        cfg: Config,
        transients: Option<transients::Transients>,
        registry: &mut Registry,
    ) -> Result<Self, Error> {
        cfg.validate()?;
        match cfg.kind {
            Kind::Rock { slot_size } => {
                let layout = rock::Rock::init(storage, &cfg.partition, cfg.max_size, slot_size)
                    .await?;
                Ok(Self::Rock(Dir::new(layout, cfg, transients, registry)))
            }
            Kind::Ufs {
                average_object_size,
            } => {
                let layout = ufs::Ufs::new(
                    storage,
                    &cfg.partition,
                    cfg.max_size,
                    average_object_size,
                )?;
                Ok(Self::Ufs(Dir::new(layout, cfg, transients, registry)))
            }
        }
    }
}

impl<S: Storage> SwapDir for Directory<S> {
    async fn rebuild(&mut self) -> Result<RebuildStats, Error> {
        match self {
            Self::Rock(dir) => dir.rebuild().await,
            Self::Ufs(dir) => dir.rebuild().await,
        }
    }

    async fn create(&mut self, entry: StoreEntry) -> Result<Pending, Error> {
        match self {
            Self::Rock(dir) => dir.create(entry).await,
            Self::Ufs(dir) => dir.create(entry).await,
        }
    }

    async fn write(&mut self, pending: &mut Pending, data: &[u8]) -> Result<(), Error> {
        match self {
            Self::Rock(dir) => dir.write(pending, data).await,
            Self::Ufs(dir) => dir.write(pending, data).await,
        }
    }

    async fn commit(&mut self, pending: Pending) -> Result<Record, Error> {
        match self {
            Self::Rock(dir) => dir.commit(pending).await,
            Self::Ufs(dir) => dir.commit(pending).await,
        }
    }

    async fn discard(&mut self, pending: Pending) -> Result<(), Error> {
        match self {
            Self::Rock(dir) => dir.discard(pending).await,
            Self::Ufs(dir) => dir.discard(pending).await,
        }
    }

    fn get(&mut self, key: &CacheKey) -> Option<Found> {
        match self {
            Self::Rock(dir) => dir.get(key),
            Self::Ufs(dir) => dir.get(key),
        }
    }

    async fn read(&mut self, key: &CacheKey) -> Result<Option<Object>, Error> {
        match self {
            Self::Rock(dir) => dir.read(key).await,
            Self::Ufs(dir) => dir.read(key).await,
        }
    }

    async fn unlink(&mut self, key: &CacheKey) -> Result<bool, Error> {
        match self {
            Self::Rock(dir) => dir.unlink(key).await,
            Self::Ufs(dir) => dir.unlink(key).await,
        }
    }

    fn reference(&mut self, key: &CacheKey) -> bool {
        match self {
            Self::Rock(dir) => dir.reference(key),
            Self::Ufs(dir) => dir.reference(key),
        }
    }

    async fn dereference(&mut self, key: &CacheKey) -> Result<bool, Error> {
        match self {
            Self::Rock(dir) => dir.dereference(key).await,
            Self::Ufs(dir) => dir.dereference(key).await,
        }
    }

    async fn maintain(&mut self) -> Result<usize, Error> {
        match self {
            Self::Rock(dir) => dir.maintain().await,
            Self::Ufs(dir) => dir.maintain().await,
        }
    }

    fn full(&self) -> bool {
        match self {
            Self::Rock(dir) => dir.full(),
            Self::Ufs(dir) => dir.full(),
        }
    }

    fn can_store(&self, size: u64) -> bool {
        match self {
            Self::Rock(dir) => dir.can_store(size),
            Self::Ufs(dir) => dir.can_store(size),
        }
    }

    fn stat(&self) -> Stat {
        match self {
            Self::Rock(dir) => dir.stat(),
            Self::Ufs(dir) => dir.stat(),
        }
    }
}
