use super::{Config, Error, PageId, Purpose, PurposeLabel, MAX_CAPACITY};
use prometheus_client::{
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use shoal_runtime::shm::Region;
use shoal_utils::align_up;
use std::{
    collections::hash_map::RandomState,
    hash::BuildHasher,
    ptr::NonNull,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, error, info};

const MAGIC: u32 = 0x5348_5050; // "SHPP"
const VERSION: u32 = 1;

/// Marks the end of the free list.
const NIL: u32 = u32::MAX;

const HEADER_SIZE: usize = 128;
const OFFSET_MAGIC: usize = 0;
const OFFSET_VERSION: usize = 4;
const OFFSET_POOL: usize = 8;
const OFFSET_PAGE_SIZE: usize = 12;
const OFFSET_CAPACITY: usize = 16;
const OFFSET_HEAD: usize = 24;
const OFFSET_LEVEL: usize = 32;
const OFFSET_LEVELS: usize = 36;
const OFFSET_LIMITS: usize = 48;

/// Where each part of the pool lives within its region.
#[derive(Clone, Copy, Debug)]
struct Layout {
    capacity: u32,
    page_size: usize,
    links: usize,
    states: usize,
    pages: usize,
    len: usize,
}

impl Layout {
    fn new(capacity: u32, page_size: usize) -> Option<Self> {
        let links = HEADER_SIZE;
        let states = links.checked_add(4 * capacity as usize)?;
        let end_states = states.checked_add(4 * capacity as usize)?;
        let pages = align_up(end_states, page_size.min(4096));
        let len = (capacity as usize)
            .checked_mul(page_size)?
            .checked_add(pages)?;
        Some(Self {
            capacity,
            page_size,
            links,
            states,
            pages,
            len,
        })
    }
}

struct Metrics {
    gets: Family<PurposeLabel, Counter>,
    puts: Family<PurposeLabel, Counter>,
    exhausted: Family<PurposeLabel, Counter>,
    in_use: Family<PurposeLabel, Gauge>,
}

impl Metrics {
    fn init(registry: &mut Registry) -> Self {
        let metrics = Self {
            gets: Family::default(),
            puts: Family::default(),
            exhausted: Family::default(),
            in_use: Family::default(),
        };
        registry.register(
            "pages_gets",
            "Number of pages handed out",
            metrics.gets.clone(),
        );
        registry.register(
            "pages_puts",
            "Number of pages returned",
            metrics.puts.clone(),
        );
        registry.register(
            "pages_exhausted",
            "Number of page requests refused by a limit or an empty pool",
            metrics.exhausted.clone(),
        );
        registry.register(
            "pages_in_use",
            "Number of pages currently out of the pool (all processes)",
            metrics.in_use.clone(),
        );
        metrics
    }
}

struct Inner {
    region: Region,
    layout: Layout,
    pool: u32,
    created: bool,
    metrics: Metrics,
}

/// A handle to a shared page pool.
///
/// Handles are cheap to clone; every clone (and every attached process) operates on the same
/// pages.
#[derive(Clone)]
pub struct PagePool {
    inner: Arc<Inner>,
}

impl PagePool {
    /// Create the pool (coordinating process).
    ///
    /// Any stale region with the same name is replaced.
    pub fn init(cfg: Config, registry: &mut Registry) -> Result<Self, Error> {
        let page_size = cfg.page_size.get();
        if page_size < 8 || !page_size.is_power_of_two() {
            return Err(Error::InvalidConfig("page size must be a power of two >= 8"));
        }
        let capacity = cfg.capacity_bytes.get() / page_size as u64;
        if capacity == 0 {
            return Err(Error::InvalidConfig("capacity smaller than one page"));
        }
        if capacity > MAX_CAPACITY as u64 {
            return Err(Error::InvalidConfig("capacity exceeds 2^24 pages"));
        }
        let capacity = capacity as u32;
        let layout = Layout::new(capacity, page_size)
            .ok_or(Error::InvalidConfig("pool does not fit in memory"))?;

        let region = match &cfg.directory {
            Some(directory) => Region::create(directory, &cfg.name, layout.len)?,
            None => Region::anonymous(layout.len)?,
        };
        let pool = RandomState::new().hash_one(&cfg.name) as u32;

        // Build the free list (every page free, generation zero)
        for index in 0..capacity {
            let next = if index + 1 == capacity { NIL } else { index + 1 };
            region
                .atomic_u32(layout.links + 4 * index as usize)
                .store(next, Ordering::Relaxed);
        }
        region.atomic_u64(OFFSET_HEAD).store(0, Ordering::Relaxed);

        // Publish the header (magic last, so attachers never see a partial pool)
        region.atomic_u32(OFFSET_VERSION).store(VERSION, Ordering::Relaxed);
        region.atomic_u32(OFFSET_POOL).store(pool, Ordering::Relaxed);
        region
            .atomic_u32(OFFSET_PAGE_SIZE)
            .store(page_size as u32, Ordering::Relaxed);
        region
            .atomic_u32(OFFSET_CAPACITY)
            .store(capacity, Ordering::Relaxed);
        region.atomic_u32(OFFSET_MAGIC).store(MAGIC, Ordering::Release);

        info!(
            name = %cfg.name,
            pool, capacity, page_size, "created page pool"
        );
        Ok(Self::new(region, layout, pool, true, registry))
    }

    /// Map a pool created by another process.
    pub fn attach(cfg: Config, registry: &mut Registry) -> Result<Self, Error> {
        let directory = cfg
            .directory
            .as_ref()
            .ok_or(Error::InvalidConfig("anonymous pools cannot be attached"))?;
        let region = Region::open(directory, &cfg.name)?;
        region.require(HEADER_SIZE)?;
        if region.atomic_u32(OFFSET_MAGIC).load(Ordering::Acquire) != MAGIC {
            return Err(Error::Corrupt("magic"));
        }
        if region.atomic_u32(OFFSET_VERSION).load(Ordering::Relaxed) != VERSION {
            return Err(Error::Corrupt("version"));
        }
        let pool = region.atomic_u32(OFFSET_POOL).load(Ordering::Relaxed);
        let page_size = region.atomic_u32(OFFSET_PAGE_SIZE).load(Ordering::Relaxed) as usize;
        let capacity = region.atomic_u32(OFFSET_CAPACITY).load(Ordering::Relaxed);
        if page_size != cfg.page_size.get() {
            return Err(Error::Corrupt("page size differs from config"));
        }
        if capacity == 0 || capacity > MAX_CAPACITY {
            return Err(Error::Corrupt("capacity"));
        }
        let layout = Layout::new(capacity, page_size).ok_or(Error::Corrupt("capacity"))?;
        region.require(layout.len)?;

        debug!(name = %cfg.name, pool, capacity, "attached page pool");
        Ok(Self::new(region, layout, pool, false, registry))
    }

    fn new(
        region: Region,
        layout: Layout,
        pool: u32,
        created: bool,
        registry: &mut Registry,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                region,
                layout,
                pool,
                created,
                metrics: Metrics::init(registry),
            }),
        }
    }

    /// Release this handle, removing the named region if this process created it.
    ///
    /// Processes that still map the pool keep working with their mapping.
    pub fn shutdown(self) -> Result<(), Error> {
        let inner = &self.inner;
        if inner.created {
            if let Some(path) = inner.region.path() {
                if let Some(directory) = path.parent() {
                    Region::remove(directory, inner.region.name())?;
                    info!(name = inner.region.name(), "removed page pool");
                }
            }
        }
        Ok(())
    }

    /// Identity of this pool (embedded in every [PageId] it issues).
    pub fn id(&self) -> u32 {
        self.inner.pool
    }

    /// Number of pages in the pool.
    pub fn capacity(&self) -> u32 {
        self.inner.layout.capacity
    }

    /// Size of each page in bytes.
    pub fn page_size(&self) -> usize {
        self.inner.layout.page_size
    }

    /// Number of pages currently out of the pool (across all purposes and processes).
    pub fn level(&self) -> u32 {
        self.header(OFFSET_LEVEL).load(Ordering::Acquire)
    }

    /// Number of pages currently out of the pool for `purpose`.
    pub fn level_of(&self, purpose: Purpose) -> u32 {
        self.purpose_level(purpose).load(Ordering::Acquire)
    }

    /// Soft limit of `purpose` (the capacity if no need was ever noted).
    pub fn limit_of(&self, purpose: Purpose) -> u32 {
        match self.purpose_limit(purpose).load(Ordering::Acquire) {
            0 => self.capacity(),
            limit => limit.min(self.capacity()),
        }
    }

    /// Number of pages `purpose` could get right now.
    pub fn available(&self, purpose: Purpose) -> u32 {
        let by_limit = self.limit_of(purpose).saturating_sub(self.level_of(purpose));
        let free = self.capacity().saturating_sub(self.level());
        by_limit.min(free)
    }

    /// Raise the soft limit of `purpose` by `count` pages.
    pub fn note_need(&self, purpose: Purpose, count: u32) {
        let limit = self.purpose_limit(purpose);
        let _ = limit.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            Some(current.saturating_add(count))
        });
        debug!(%purpose, count, limit = self.limit_of(purpose), "noted page need");
    }

    /// Take a free page for `purpose`.
    ///
    /// Returns `None` when the purpose reached its limit or no page is free.
    pub fn get(&self, purpose: Purpose) -> Option<PageId> {
        let label = PurposeLabel::from(purpose);

        // Reserve room under the purpose limit
        let limit = self.limit_of(purpose);
        let level = self.purpose_level(purpose);
        if level.fetch_add(1, Ordering::AcqRel) >= limit {
            level.fetch_sub(1, Ordering::AcqRel);
            self.inner.metrics.exhausted.get_or_create(&label).inc();
            debug!(%purpose, limit, "page limit reached");
            return None;
        }

        // Pop a free page
        let Some(number) = self.pop() else {
            level.fetch_sub(1, Ordering::AcqRel);
            self.inner.metrics.exhausted.get_or_create(&label).inc();
            debug!(%purpose, "page pool exhausted");
            return None;
        };
        self.header(OFFSET_LEVEL).fetch_add(1, Ordering::AcqRel);

        // Mark the page busy
        let state = self.state(number);
        let previous = state.fetch_or(1, Ordering::AcqRel);
        assert!(previous & 1 == 0, "free list yielded busy page {number}");

        self.inner.metrics.gets.get_or_create(&label).inc();
        self.inner
            .metrics
            .in_use
            .get_or_create(&label)
            .set(self.level_of(purpose) as i64);
        Some(PageId {
            pool: self.inner.pool,
            purpose,
            number,
            generation: previous >> 1,
        })
    }

    /// Return a page to the pool.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not issued by this pool, is out of range, or was already returned.
    pub fn put(&self, id: PageId) {
        self.validate(&id);
        let state = self.state(id.number);
        let busy = (id.generation << 1) | 1;
        let free = (id.generation.wrapping_add(1) & (u32::MAX >> 1)) << 1;
        if state
            .compare_exchange(busy, free, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            error!(%id, "page returned twice or with a stale generation");
            panic!("stale or double release of page {id}");
        }

        self.purpose_level(id.purpose)
            .fetch_sub(1, Ordering::AcqRel);
        self.header(OFFSET_LEVEL).fetch_sub(1, Ordering::AcqRel);
        self.push(id.number);

        let label = PurposeLabel::from(id.purpose);
        self.inner.metrics.puts.get_or_create(&label).inc();
        self.inner
            .metrics
            .in_use
            .get_or_create(&label)
            .set(self.level_of(id.purpose) as i64);
    }

    /// Returns true if `id` refers to a page that is still out under that generation.
    pub fn is_current(&self, id: &PageId) -> bool {
        id.pool == self.inner.pool
            && id.number < self.capacity()
            && self.state(id.number).load(Ordering::Acquire) == (id.generation << 1) | 1
    }

    /// Process-local address of a page.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not a page currently out of this pool.
    pub fn page_ptr(&self, id: PageId) -> NonNull<u8> {
        self.validate(&id);
        assert!(self.is_current(&id), "page {id} is not allocated");
        let ptr = self.inner.region.ptr(self.page_offset(id.number));
        // SAFETY: pointers into a live mapping are never null.
        unsafe { NonNull::new_unchecked(ptr) }
    }

    /// Copy bytes out of a page starting at `offset`.
    ///
    /// Bytes being written concurrently by the page holder read as unspecified values, so
    /// readers only read ranges the holder has already published.
    ///
    /// # Panics
    ///
    /// Panics if `id` is invalid or the range does not fit in a page.
    pub fn read(&self, id: PageId, offset: usize, buf: &mut [u8]) {
        let start = self.page_range(&id, offset, buf.len());
        // SAFETY: the range lies inside an allocated page; the holder does not rewrite
        // published bytes.
        unsafe { self.inner.region.read(start, buf) };
    }

    /// Copy `data` into a page starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is invalid or the range does not fit in a page.
    pub fn write(&self, id: PageId, offset: usize, data: &[u8]) {
        let start = self.page_range(&id, offset, data.len());
        // SAFETY: the range lies inside a page owned by the caller and not yet published.
        unsafe { self.inner.region.write(start, data) };
    }

    fn page_range(&self, id: &PageId, offset: usize, len: usize) -> usize {
        self.validate(id);
        assert!(self.is_current(id), "page {id} is not allocated");
        assert!(
            offset
                .checked_add(len)
                .is_some_and(|end| end <= self.page_size()),
            "range {offset}+{len} exceeds page size {}",
            self.page_size()
        );
        self.page_offset(id.number) + offset
    }

    fn validate(&self, id: &PageId) {
        if id.pool != self.inner.pool {
            error!(%id, pool = self.inner.pool, "page from another pool");
            panic!("page {id} does not belong to pool {}", self.inner.pool);
        }
        if id.number >= self.capacity() {
            error!(%id, capacity = self.capacity(), "page number out of range");
            panic!("page {id} out of range");
        }
    }

    fn pop(&self) -> Option<u32> {
        let head = self.header64(OFFSET_HEAD);
        let mut current = head.load(Ordering::Acquire);
        loop {
            let index = current as u32;
            if index == NIL {
                return None;
            }
            let next = self.link(index).load(Ordering::Acquire);
            let tag = ((current >> 32) as u32).wrapping_add(1);
            let new = ((tag as u64) << 32) | next as u64;
            match head.compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Some(index),
                Err(observed) => current = observed,
            }
        }
    }

    fn push(&self, index: u32) {
        let head = self.header64(OFFSET_HEAD);
        let mut current = head.load(Ordering::Acquire);
        loop {
            self.link(index).store(current as u32, Ordering::Release);
            let tag = ((current >> 32) as u32).wrapping_add(1);
            let new = ((tag as u64) << 32) | index as u64;
            match head.compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    fn header(&self, offset: usize) -> &AtomicU32 {
        self.inner.region.atomic_u32(offset)
    }

    fn header64(&self, offset: usize) -> &AtomicU64 {
        self.inner.region.atomic_u64(offset)
    }

    fn purpose_level(&self, purpose: Purpose) -> &AtomicU32 {
        self.header(OFFSET_LEVELS + 4 * purpose.index())
    }

    fn purpose_limit(&self, purpose: Purpose) -> &AtomicU32 {
        self.header(OFFSET_LIMITS + 4 * purpose.index())
    }

    fn link(&self, index: u32) -> &AtomicU32 {
        self.inner
            .region
            .atomic_u32(self.inner.layout.links + 4 * index as usize)
    }

    fn state(&self, index: u32) -> &AtomicU32 {
        self.inner
            .region
            .atomic_u32(self.inner.layout.states + 4 * index as usize)
    }

    fn page_offset(&self, number: u32) -> usize {
        self.inner.layout.pages + number as usize * self.inner.layout.page_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use shoal_utils::{NZUsize, NZU64};
    use std::{collections::HashSet, env, num::NonZeroU64, path::PathBuf, thread};

    fn config(pages: u64) -> Config {
        Config {
            name: "pages".into(),
            directory: None,
            page_size: NZUsize!(256),
            capacity_bytes: NonZeroU64::new(256 * pages).unwrap(),
        }
    }

    fn directory() -> PathBuf {
        let mut rng = StdRng::from_entropy();
        env::temp_dir().join(format!("pages_{}", rng.gen::<u64>()))
    }

    #[test]
    fn test_get_until_exhausted() {
        let mut registry = Registry::default();
        let pool = PagePool::init(config(8), &mut registry).unwrap();
        assert_eq!(pool.capacity(), 8);

        let mut pages = Vec::new();
        while let Some(page) = pool.get(Purpose::Transient) {
            pages.push(page);
        }
        assert_eq!(pages.len(), 8);
        assert_eq!(pool.level(), 8);
        assert_eq!(pool.available(Purpose::DiskIo), 0);

        // Every page is distinct
        let numbers: HashSet<u32> = pages.iter().map(|p| p.number).collect();
        assert_eq!(numbers.len(), 8);

        for page in pages {
            pool.put(page);
        }
        assert_eq!(pool.level(), 0);
        assert_eq!(pool.level_of(Purpose::Transient), 0);
    }

    #[test]
    fn test_put_then_get_reuses_page() {
        let mut registry = Registry::default();
        let pool = PagePool::init(config(4), &mut registry).unwrap();
        let first = pool.get(Purpose::MemoryCache).unwrap();
        pool.put(first);
        let second = pool.get(Purpose::MemoryCache).unwrap();
        assert_eq!(second.number, first.number);
        assert_eq!(second.generation, first.generation + 1);
        assert!(!pool.is_current(&first));
        assert!(pool.is_current(&second));
    }

    #[test]
    #[should_panic(expected = "stale or double release")]
    fn test_double_put_panics() {
        let mut registry = Registry::default();
        let pool = PagePool::init(config(4), &mut registry).unwrap();
        let page = pool.get(Purpose::Transient).unwrap();
        pool.put(page);
        pool.put(page);
    }

    #[test]
    #[should_panic(expected = "does not belong")]
    fn test_foreign_page_panics() {
        let mut registry = Registry::default();
        let pool = PagePool::init(config(4), &mut registry).unwrap();
        let mut page = pool.get(Purpose::Transient).unwrap();
        page.pool = page.pool.wrapping_add(1);
        pool.put(page);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_out_of_range_page_panics() {
        let mut registry = Registry::default();
        let pool = PagePool::init(config(4), &mut registry).unwrap();
        let mut page = pool.get(Purpose::Transient).unwrap();
        page.number = 4;
        pool.put(page);
    }

    #[test]
    #[should_panic(expected = "not allocated")]
    fn test_stale_page_ptr_panics() {
        let mut registry = Registry::default();
        let pool = PagePool::init(config(4), &mut registry).unwrap();
        let page = pool.get(Purpose::Transient).unwrap();
        pool.put(page);
        pool.page_ptr(page);
    }

    #[test]
    fn test_purpose_limits() {
        let mut registry = Registry::default();
        let pool = PagePool::init(config(8), &mut registry).unwrap();

        // Without a noted need, a purpose may take the whole pool
        assert_eq!(pool.limit_of(Purpose::DiskIo), 8);

        // With a noted need, it is capped
        pool.note_need(Purpose::Transient, 2);
        assert_eq!(pool.limit_of(Purpose::Transient), 2);
        let a = pool.get(Purpose::Transient).unwrap();
        let b = pool.get(Purpose::Transient).unwrap();
        assert!(pool.get(Purpose::Transient).is_none());
        assert_eq!(pool.available(Purpose::Transient), 0);

        // Other purposes are unaffected
        assert_eq!(pool.available(Purpose::MemoryCache), 6);
        let c = pool.get(Purpose::MemoryCache).unwrap();

        // Raising the need admits more
        pool.note_need(Purpose::Transient, 1);
        let d = pool.get(Purpose::Transient).unwrap();
        assert_eq!(pool.level_of(Purpose::Transient), 3);
        assert_eq!(pool.level(), 4);

        for page in [a, b, c, d] {
            pool.put(page);
        }
        assert_eq!(pool.level(), 0);
    }

    #[test]
    fn test_read_write_page() {
        let mut registry = Registry::default();
        let pool = PagePool::init(config(2), &mut registry).unwrap();
        let a = pool.get(Purpose::Transient).unwrap();
        let b = pool.get(Purpose::Transient).unwrap();
        pool.write(a, 0, &[1u8; 256]);
        pool.write(b, 250, b"edge!!");

        let mut buf = [0u8; 256];
        pool.read(a, 0, &mut buf);
        assert!(buf.iter().all(|x| *x == 1));
        let mut edge = [0u8; 6];
        pool.read(b, 250, &mut edge);
        assert_eq!(&edge, b"edge!!");
    }

    #[test]
    #[should_panic(expected = "exceeds page size")]
    fn test_write_past_page_panics() {
        let mut registry = Registry::default();
        let pool = PagePool::init(config(2), &mut registry).unwrap();
        let page = pool.get(Purpose::Transient).unwrap();
        pool.write(page, 255, b"xx");
    }

    #[test]
    fn test_invalid_config() {
        let mut registry = Registry::default();
        let mut cfg = config(4);
        cfg.page_size = NZUsize!(100);
        assert!(matches!(
            PagePool::init(cfg, &mut registry),
            Err(Error::InvalidConfig(_))
        ));

        let mut cfg = config(4);
        cfg.capacity_bytes = NZU64!(255);
        assert!(matches!(
            PagePool::init(cfg, &mut registry),
            Err(Error::InvalidConfig(_))
        ));

        let cfg = config(4);
        assert!(matches!(
            PagePool::attach(cfg, &mut registry),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_default_page_size() {
        let mut registry = Registry::default();
        let cfg = Config::new("pages", None, NZU64!(1 << 20));
        let pool = PagePool::init(cfg, &mut registry).unwrap();
        assert_eq!(pool.page_size(), 32 * 1024);
        assert_eq!(pool.capacity(), 32);
    }

    #[test]
    fn test_conservation_under_concurrency() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 2_000;

        let mut registry = Registry::default();
        let pool = PagePool::init(config(16), &mut registry).unwrap();
        let mut handles = Vec::new();
        for seed in 0..THREADS {
            let pool = pool.clone();
            handles.push(thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed as u64);
                let mut held = Vec::new();
                for _ in 0..ROUNDS {
                    if rng.gen_bool(0.6) {
                        if let Some(page) = pool.get(Purpose::ALL[rng.gen_range(0..3)]) {
                            // Stamp the page with a marker only this holder writes
                            pool.write(page, 0, &(seed as u64).to_le_bytes());
                            held.push(page);
                        }
                    } else if let Some(page) = held.pop() {
                        let mut marker = [0u8; 8];
                        pool.read(page, 0, &mut marker);
                        assert_eq!(u64::from_le_bytes(marker), seed as u64);
                        pool.put(page);
                    }
                    assert!(pool.level() <= pool.capacity());
                }
                for page in held {
                    pool.put(page);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.level(), 0);
        for purpose in Purpose::ALL {
            assert_eq!(pool.level_of(purpose), 0);
        }

        // All pages are free again
        let mut pages = Vec::new();
        while let Some(page) = pool.get(Purpose::DiskIo) {
            pages.push(page);
        }
        assert_eq!(pages.len(), 16);
    }

    #[test]
    fn test_attach_shares_pages() {
        let directory = directory();
        let mut cfg = config(4);
        cfg.directory = Some(directory.clone());

        let mut registry = Registry::default();
        let creator = PagePool::init(cfg.clone(), &mut registry).unwrap();
        let mut registry = Registry::default();
        let attached = PagePool::attach(cfg.clone(), &mut registry).unwrap();
        assert_eq!(attached.id(), creator.id());
        assert_eq!(attached.capacity(), 4);

        // A page taken in one mapping is visible (and returnable) in the other
        let page = creator.get(Purpose::Transient).unwrap();
        creator.write(page, 0, b"shared");
        let mut buf = [0u8; 6];
        attached.read(page, 0, &mut buf);
        assert_eq!(&buf, b"shared");
        assert_eq!(attached.level(), 1);
        attached.put(page);
        assert_eq!(creator.level(), 0);

        // Limits are shared
        attached.note_need(Purpose::DiskIo, 1);
        assert_eq!(creator.limit_of(Purpose::DiskIo), 1);

        // Shutdown removes the region name
        attached.shutdown().unwrap();
        creator.shutdown().unwrap();
        let mut registry = Registry::default();
        assert!(matches!(
            PagePool::attach(cfg, &mut registry),
            Err(Error::Runtime(shoal_runtime::Error::RegionMissing(_)))
        ));
        std::fs::remove_dir_all(directory).unwrap();
    }

    #[test]
    fn test_attach_rejects_mismatched_page_size() {
        let directory = directory();
        let mut cfg = config(4);
        cfg.directory = Some(directory.clone());
        let mut registry = Registry::default();
        let creator = PagePool::init(cfg.clone(), &mut registry).unwrap();

        cfg.page_size = NZUsize!(512);
        let mut registry = Registry::default();
        assert!(matches!(
            PagePool::attach(cfg, &mut registry),
            Err(Error::Corrupt(_))
        ));
        creator.shutdown().unwrap();
        std::fs::remove_dir_all(directory).unwrap();
    }

    #[test]
    fn test_metrics() {
        let mut registry = Registry::default();
        let pool = PagePool::init(config(1), &mut registry).unwrap();
        let page = pool.get(Purpose::Transient).unwrap();
        assert!(pool.get(Purpose::Transient).is_none());
        pool.put(page);

        let mut buffer = String::new();
        encode(&mut buffer, &registry).unwrap();
        assert!(buffer.contains("pages_gets_total{purpose=\"Transient\"} 1"));
        assert!(buffer.contains("pages_puts_total{purpose=\"Transient\"} 1"));
        assert!(buffer.contains("pages_exhausted_total{purpose=\"Transient\"} 1"));
        assert!(buffer.contains("pages_in_use{purpose=\"Transient\"} 0"));
    }
}
