use super::{
    handles::{Reader, Subscription, Writer},
    Config, Entry, Error, Lookup, Method, Notice, RequestFlags, SlotFlags, State, MAX_PAGES,
    MAX_URL_LEN,
};
use crate::pages::{PageId, PagePool, Purpose};
use bytes::Bytes;
use futures::channel::oneshot;
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use shoal_runtime::shm::{Lock, Region};
use shoal_utils::CacheKey;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tracing::{debug, info, warn};

const MAGIC: u32 = 0x5348_5452; // "SHTR"
const VERSION: u32 = 1;

const HEADER_SIZE: usize = 64;
const OFFSET_MAGIC: usize = 0;
const OFFSET_VERSION: usize = 4;
const OFFSET_ENTRIES: usize = 8;
const OFFSET_WINDOW: usize = 12;
const OFFSET_LOCK: usize = 16;
const OFFSET_POOL: usize = 20;
const OFFSET_PAGE_SIZE: usize = 24;
const OFFSET_HAS_POOL: usize = 28;

const SLOT_STATE: usize = 0;
const SLOT_EPOCH: usize = 4;
const SLOT_READERS: usize = 8;
const SLOT_WRITER: usize = 12;
const SLOT_FLAGS: usize = 16;
const SLOT_REQ_FLAGS: usize = 20;
const SLOT_METHOD: usize = 24;
const SLOT_URL_LEN: usize = 28;
const SLOT_SIZE: usize = 32;
const SLOT_PAGE_COUNT: usize = 40;
const SLOT_KEY: usize = 48;
const SLOT_PAGES: usize = SLOT_KEY + CacheKey::SIZE;
const SLOT_URL: usize = SLOT_PAGES + 8 * MAX_PAGES;
const SLOT_LEN: usize = SLOT_URL + MAX_URL_LEN;

const EMPTY: u32 = 0;

/// A waiter registered by this process for a slot incarnation.
struct Waiter {
    epoch: u32,
    sender: oneshot::Sender<Notice>,
}

struct Metrics {
    started: Counter,
    completed: Counter,
    abandoned: Counter,
    busy: Counter,
}

impl Metrics {
    fn init(registry: &mut Registry) -> Self {
        let metrics = Self {
            started: Counter::default(),
            completed: Counter::default(),
            abandoned: Counter::default(),
            busy: Counter::default(),
        };
        registry.register(
            "transients_started",
            "Number of writers started",
            metrics.started.clone(),
        );
        registry.register(
            "transients_completed",
            "Number of entries completed",
            metrics.completed.clone(),
        );
        registry.register(
            "transients_abandoned",
            "Number of entries abandoned",
            metrics.abandoned.clone(),
        );
        registry.register(
            "transients_busy",
            "Number of writers refused because the key already had one",
            metrics.busy.clone(),
        );
        metrics
    }
}

pub(super) struct Inner {
    region: Region,
    entries: u32,
    window: u32,
    pool: Option<PagePool>,
    created: bool,
    waiters: Mutex<HashMap<u32, Vec<Waiter>>>,
    metrics: Metrics,
}

/// A handle to a shared table of in-flight entries.
///
/// Handles are cheap to clone.
#[derive(Clone)]
pub struct Transients {
    inner: Arc<Inner>,
}

impl Transients {
    /// Create the table (coordinating process).
    ///
    /// If `pool` is provided, writers can stage bytes into its pages.
    pub fn init(
        cfg: Config,
        pool: Option<PagePool>,
        registry: &mut Registry,
    ) -> Result<Self, Error> {
        let entries = cfg.entries.get();
        let window = cfg.window.get().min(entries);
        let len = (entries as usize)
            .checked_mul(SLOT_LEN)
            .and_then(|len| len.checked_add(HEADER_SIZE))
            .ok_or(Error::InvalidConfig("table does not fit in memory"))?;
        let region = match &cfg.directory {
            Some(directory) => Region::create(directory, &cfg.name, len)?,
            None => Region::anonymous(len)?,
        };

        region.atomic_u32(OFFSET_VERSION).store(VERSION, Ordering::Relaxed);
        region.atomic_u32(OFFSET_ENTRIES).store(entries, Ordering::Relaxed);
        region.atomic_u32(OFFSET_WINDOW).store(window, Ordering::Relaxed);
        if let Some(pool) = &pool {
            region.atomic_u32(OFFSET_POOL).store(pool.id(), Ordering::Relaxed);
            region
                .atomic_u32(OFFSET_PAGE_SIZE)
                .store(pool.page_size() as u32, Ordering::Relaxed);
            region.atomic_u32(OFFSET_HAS_POOL).store(1, Ordering::Relaxed);
        }
        region.atomic_u32(OFFSET_MAGIC).store(MAGIC, Ordering::Release);

        info!(name = %cfg.name, entries, window, staged = pool.is_some(), "created transients table");
        Ok(Self::new(region, entries, window, pool, true, registry))
    }

    /// Map a table created by another process.
    ///
    /// `pool` must be the pool the table was created with (or `None` if it was created without
    /// one).
    pub fn attach(
        cfg: Config,
        pool: Option<PagePool>,
        registry: &mut Registry,
    ) -> Result<Self, Error> {
        let directory = cfg
            .directory
            .as_ref()
            .ok_or(Error::InvalidConfig("anonymous tables cannot be attached"))?;
        let region = Region::open(directory, &cfg.name)?;
        region.require(HEADER_SIZE)?;
        if region.atomic_u32(OFFSET_MAGIC).load(Ordering::Acquire) != MAGIC {
            return Err(Error::Corrupt("magic"));
        }
        if region.atomic_u32(OFFSET_VERSION).load(Ordering::Relaxed) != VERSION {
            return Err(Error::Corrupt("version"));
        }
        let entries = region.atomic_u32(OFFSET_ENTRIES).load(Ordering::Relaxed);
        let window = region.atomic_u32(OFFSET_WINDOW).load(Ordering::Relaxed);
        if entries == 0 || window == 0 || window > entries {
            return Err(Error::Corrupt("geometry"));
        }
        region.require(HEADER_SIZE + entries as usize * SLOT_LEN)?;

        let has_pool = region.atomic_u32(OFFSET_HAS_POOL).load(Ordering::Relaxed) == 1;
        match &pool {
            Some(pool) => {
                if !has_pool
                    || region.atomic_u32(OFFSET_POOL).load(Ordering::Relaxed) != pool.id()
                    || region.atomic_u32(OFFSET_PAGE_SIZE).load(Ordering::Relaxed)
                        != pool.page_size() as u32
                {
                    return Err(Error::InvalidConfig("pool differs from the table's pool"));
                }
            }
            None if has_pool => {
                return Err(Error::InvalidConfig("table was created with a pool"));
            }
            None => {}
        }

        debug!(name = %cfg.name, entries, window, "attached transients table");
        Ok(Self::new(region, entries, window, pool, false, registry))
    }

    fn new(
        region: Region,
        entries: u32,
        window: u32,
        pool: Option<PagePool>,
        created: bool,
        registry: &mut Registry,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                region,
                entries,
                window,
                pool,
                created,
                waiters: Mutex::new(HashMap::new()),
                metrics: Metrics::init(registry),
            }),
        }
    }

    /// Release this handle, removing the named region if this process created it.
    pub fn shutdown(self) -> Result<(), Error> {
        let region = &self.inner.region;
        if self.inner.created {
            if let Some(directory) = region.path().and_then(|path| path.parent()) {
                Region::remove(directory, region.name())?;
                info!(name = region.name(), "removed transients table");
            }
        }
        Ok(())
    }

    /// Number of slots in the table.
    pub fn entries(&self) -> u32 {
        self.inner.entries
    }

    /// Become the writer of `key`.
    ///
    /// Fails with [Error::Busy] if another writer is already attached to the key.
    pub fn start_writing(
        &self,
        key: CacheKey,
        url: impl AsRef<[u8]>,
        flags: RequestFlags,
        method: Method,
    ) -> Result<Writer, Error> {
        let url = url.as_ref();
        if url.len() > MAX_URL_LEN {
            return Err(Error::UrlTooLong(url.len()));
        }
        let inner = &self.inner;
        let _guard = inner.lock().lock();

        // Deal with any previous entry for the key
        let mut retire = None;
        if let Some(slot) = inner.find(&key) {
            match inner.state(slot) {
                Some(State::Writing) => {
                    inner.metrics.busy.inc();
                    debug!(%key, slot, "entry already has a writer");
                    return Err(Error::Busy(key));
                }
                _ if inner.participants(slot) > 0 => retire = Some(slot),
                _ => inner.reclaim(slot),
            }
        }

        // Claim a free slot near the key's home
        let Some(slot) = inner.free_slot(&key) else {
            warn!(%key, window = inner.window, "no free transient slot");
            return Err(Error::Full(key));
        };

        // The previous entry stays visible until its replacement is secured
        if let Some(old) = retire {
            inner
                .word(old, SLOT_FLAGS)
                .fetch_or(SlotFlags::RETIRED.bits(), Ordering::AcqRel);
            debug!(%key, slot = old, "retired terminal entry");
        }
        let epoch = inner
            .word(slot, SLOT_EPOCH)
            .fetch_add(1, Ordering::AcqRel)
            .wrapping_add(1);
        let base = inner.slot_offset(slot);
        // SAFETY: empty slots are only touched while holding the table lock.
        unsafe {
            inner.region.write(base + SLOT_KEY, key.as_ref());
            inner.region.write(base + SLOT_URL, url);
        }
        inner
            .word(slot, SLOT_URL_LEN)
            .store(url.len() as u32, Ordering::Relaxed);
        inner
            .word(slot, SLOT_METHOD)
            .store(method as u32, Ordering::Relaxed);
        inner
            .word(slot, SLOT_REQ_FLAGS)
            .store(flags.bits(), Ordering::Relaxed);
        inner.word(slot, SLOT_FLAGS).store(0, Ordering::Relaxed);
        inner.word(slot, SLOT_READERS).store(0, Ordering::Relaxed);
        inner.word(slot, SLOT_WRITER).store(1, Ordering::Relaxed);
        inner.word(slot, SLOT_PAGE_COUNT).store(0, Ordering::Relaxed);
        inner.size(slot).store(0, Ordering::Relaxed);
        inner
            .word(slot, SLOT_STATE)
            .store(State::Writing.to_u32(), Ordering::Release);

        inner.metrics.started.inc();
        debug!(%key, slot, epoch, "started writing");
        Ok(Writer::new(self.inner.clone(), key, slot, epoch))
    }

    /// Mark the writer's entry complete and notify waiting readers.
    ///
    /// Does nothing if the entry is already terminal.
    pub fn complete_writing(&self, writer: &Writer) {
        self.inner
            .finish(writer.slot(), writer.epoch(), State::Completed);
    }

    /// Mark the writer's entry abandoned and notify waiting readers.
    ///
    /// Does nothing if the entry is already terminal.
    pub fn abandon(&self, writer: &Writer) {
        self.inner
            .finish(writer.slot(), writer.epoch(), State::Abandoned);
    }

    /// Returns true if the visible entry for `key` was abandoned.
    pub fn abandoned(&self, key: &CacheKey) -> bool {
        let inner = &self.inner;
        let _guard = inner.lock().lock();
        inner
            .find(key)
            .is_some_and(|slot| inner.state(slot) == Some(State::Abandoned))
    }

    /// Detach a writer or reader (equivalent to dropping it).
    ///
    /// A writer detaching from an entry it is still writing abandons the entry first.
    pub fn disconnect(&self, participant: impl Into<super::Participant>) {
        drop(participant.into());
    }

    /// Copy of the visible entry for `key`.
    pub fn get(&self, key: &CacheKey) -> Option<Entry> {
        let inner = &self.inner;
        let _guard = inner.lock().lock();
        let slot = inner.find(key)?;
        Some(inner.snapshot(slot, *key))
    }

    /// Look up `key`, attaching as a reader if an entry exists.
    pub fn get_async(&self, key: &CacheKey) -> Lookup {
        let inner = &self.inner;
        let _guard = inner.lock().lock();
        let Some(slot) = inner.find(key) else {
            return Lookup::Missing;
        };
        match inner.state(slot) {
            Some(State::Completed) => Lookup::Ready(self.attach_reader(slot, *key)),
            Some(State::Writing) => {
                let reader = self.attach_reader(slot, *key);
                let (sender, receiver) = oneshot::channel();
                inner
                    .waiters
                    .lock()
                    .unwrap()
                    .entry(slot)
                    .or_default()
                    .push(Waiter {
                        epoch: reader.epoch(),
                        sender,
                    });
                Lookup::Pending(Subscription::new(reader, receiver))
            }
            Some(State::Abandoned) | None => Lookup::Missing,
        }
    }

    /// Attach as a reader of `key` without waiting for the writer.
    ///
    /// Returns `None` if there is no entry or it was abandoned.
    pub fn open_reader(&self, key: &CacheKey) -> Option<Reader> {
        let inner = &self.inner;
        let _guard = inner.lock().lock();
        let slot = inner.find(key)?;
        match inner.state(slot) {
            Some(State::Writing) | Some(State::Completed) => Some(self.attach_reader(slot, *key)),
            _ => None,
        }
    }

    /// Deliver notices for entries finished by other processes.
    ///
    /// Returns the number of waiters notified.
    pub fn poll(&self) -> usize {
        let inner = &self.inner;
        let _guard = inner.lock().lock();
        let mut waiters = inner.waiters.lock().unwrap();
        let mut delivered = 0;
        waiters.retain(|slot, list| {
            let epoch = inner.word(*slot, SLOT_EPOCH).load(Ordering::Acquire);
            let notice = match inner.state(*slot) {
                Some(State::Completed) => Notice::Available,
                Some(State::Writing) => {
                    // Only waiters of a reused slot are stale
                    let before = list.len();
                    list.retain(|waiter| waiter.epoch == epoch);
                    if list.len() != before {
                        debug!(slot, dropped = before - list.len(), "dropped stale waiters");
                    }
                    return !list.is_empty();
                }
                Some(State::Abandoned) | None => Notice::Abandoned,
            };
            for waiter in list.drain(..) {
                let notice = if waiter.epoch == epoch {
                    notice
                } else {
                    Notice::Abandoned
                };
                if waiter.sender.send(notice).is_ok() {
                    delivered += 1;
                }
            }
            false
        });
        delivered
    }

    /// Append `data` to the writer's staged bytes.
    ///
    /// Returns [Error::Unstaged] (and stops staging for good) if the table has no pool, the pool
    /// has no page to spare, or the entry reached its page limit. Readers of an unstaged entry
    /// must wait for the disk copy.
    pub fn stage(&self, writer: &Writer, data: &[u8]) -> Result<(), Error> {
        let inner = &self.inner;
        let slot = writer.slot();
        if inner.word(slot, SLOT_EPOCH).load(Ordering::Acquire) != writer.epoch()
            || inner.state(slot) != Some(State::Writing)
        {
            return Err(Error::NotWriting);
        }
        if inner.flags(slot).contains(SlotFlags::UNSTAGED) {
            return Err(Error::Unstaged);
        }
        let Some(pool) = &inner.pool else {
            inner.unstage(slot, writer.key(), "no page pool");
            return Err(Error::Unstaged);
        };

        let page_size = pool.page_size() as u64;
        let mut size = inner.size(slot).load(Ordering::Relaxed);
        let mut data = data;
        while !data.is_empty() {
            let index = (size / page_size) as usize;
            let offset = (size % page_size) as usize;
            let count = inner.word(slot, SLOT_PAGE_COUNT);
            let page = if index < count.load(Ordering::Relaxed) as usize {
                inner.page(slot, index)
            } else {
                if index >= MAX_PAGES {
                    inner.size(slot).store(size, Ordering::Release);
                    inner.unstage(slot, writer.key(), "entry page limit");
                    return Err(Error::Unstaged);
                }
                let Some(page) = pool.get(Purpose::Transient) else {
                    inner.size(slot).store(size, Ordering::Release);
                    inner.unstage(slot, writer.key(), "page pool exhausted");
                    return Err(Error::Unstaged);
                };
                inner
                    .page_word(slot, index)
                    .store(page.pack(), Ordering::Release);
                count.store(index as u32 + 1, Ordering::Release);
                Some(page)
            };
            let Some(page) = page else {
                return Err(Error::Unstaged);
            };
            let len = data.len().min(page_size as usize - offset);
            pool.write(page, offset, &data[..len]);
            data = &data[len..];
            size += len as u64;
        }
        inner.size(slot).store(size, Ordering::Release);
        Ok(())
    }

    /// Copy staged bytes starting at `offset` into `buf`, returning how many were copied.
    ///
    /// Returns `Ok(0)` when no staged bytes exist at `offset` yet (check the entry state to tell
    /// whether more will come) and [Error::Unstaged] if none ever will.
    pub fn read(&self, reader: &Reader, offset: u64, buf: &mut [u8]) -> Result<usize, Error> {
        let inner = &self.inner;
        let slot = reader.slot();
        let size = inner.size(slot).load(Ordering::Acquire);
        if offset >= size {
            if inner.flags(slot).contains(SlotFlags::UNSTAGED) {
                return Err(Error::Unstaged);
            }
            return Ok(0);
        }
        let Some(pool) = &inner.pool else {
            return Err(Error::Unstaged);
        };

        let page_size = pool.page_size() as u64;
        let total = buf.len().min((size - offset) as usize);
        let mut copied = 0;
        while copied < total {
            let position = offset + copied as u64;
            let index = (position / page_size) as usize;
            let within = (position % page_size) as usize;
            let Some(page) = inner.page(slot, index) else {
                return Err(Error::Unstaged);
            };
            let len = (total - copied).min(page_size as usize - within);
            pool.read(page, within, &mut buf[copied..copied + len]);
            copied += len;
        }
        Ok(copied)
    }

    fn attach_reader(&self, slot: u32, key: CacheKey) -> Reader {
        let inner = &self.inner;
        inner.word(slot, SLOT_READERS).fetch_add(1, Ordering::AcqRel);
        let epoch = inner.word(slot, SLOT_EPOCH).load(Ordering::Acquire);
        Reader::new(self.inner.clone(), key, slot, epoch)
    }
}

impl Inner {
    fn lock(&self) -> Lock<'_> {
        Lock::new(self.region.atomic_u32(OFFSET_LOCK))
    }

    fn slot_offset(&self, slot: u32) -> usize {
        HEADER_SIZE + slot as usize * SLOT_LEN
    }

    fn word(&self, slot: u32, field: usize) -> &AtomicU32 {
        self.region.atomic_u32(self.slot_offset(slot) + field)
    }

    fn size(&self, slot: u32) -> &AtomicU64 {
        self.region.atomic_u64(self.slot_offset(slot) + SLOT_SIZE)
    }

    fn page_word(&self, slot: u32, index: usize) -> &AtomicU64 {
        self.region
            .atomic_u64(self.slot_offset(slot) + SLOT_PAGES + 8 * index)
    }

    fn page(&self, slot: u32, index: usize) -> Option<PageId> {
        let pool = self.pool.as_ref()?;
        if index >= self.word(slot, SLOT_PAGE_COUNT).load(Ordering::Acquire) as usize {
            return None;
        }
        PageId::unpack(pool.id(), self.page_word(slot, index).load(Ordering::Acquire))
    }

    fn state(&self, slot: u32) -> Option<State> {
        State::from_u32(self.word(slot, SLOT_STATE).load(Ordering::Acquire))
    }

    fn flags(&self, slot: u32) -> SlotFlags {
        SlotFlags::from_bits_truncate(self.word(slot, SLOT_FLAGS).load(Ordering::Acquire))
    }

    fn participants(&self, slot: u32) -> u32 {
        self.word(slot, SLOT_READERS).load(Ordering::Acquire)
            + self.word(slot, SLOT_WRITER).load(Ordering::Acquire)
    }

    fn key(&self, slot: u32) -> CacheKey {
        let mut key = [0u8; CacheKey::SIZE];
        // SAFETY: keys are only written while holding the table lock, which the caller holds.
        unsafe { self.region.read(self.slot_offset(slot) + SLOT_KEY, &mut key) };
        CacheKey::new(key)
    }

    /// Slots within the window of `key`, starting at its home slot.
    fn window(&self, key: &CacheKey) -> impl Iterator<Item = u32> + '_ {
        let home = key.anchor(self.entries);
        (0..self.window).map(move |step| ((home as u64 + step as u64) % self.entries as u64) as u32)
    }

    /// Visible (occupied, not retired) slot holding `key`. Caller holds the lock.
    fn find(&self, key: &CacheKey) -> Option<u32> {
        self.window(key).find(|slot| {
            self.state(*slot).is_some()
                && !self.flags(*slot).contains(SlotFlags::RETIRED)
                && self.key(*slot) == *key
        })
    }

    /// Empty slot in the window of `key`. Caller holds the lock.
    fn free_slot(&self, key: &CacheKey) -> Option<u32> {
        self.window(key).find(|slot| self.state(*slot).is_none())
    }

    /// Return the slot's pages and mark it empty. Caller holds the lock.
    fn reclaim(&self, slot: u32) {
        if let Some(pool) = &self.pool {
            let count = self.word(slot, SLOT_PAGE_COUNT).load(Ordering::Acquire) as usize;
            for index in 0..count {
                if let Some(page) = self.page(slot, index) {
                    pool.put(page);
                }
            }
        }
        self.word(slot, SLOT_PAGE_COUNT).store(0, Ordering::Relaxed);
        self.size(slot).store(0, Ordering::Relaxed);
        self.word(slot, SLOT_FLAGS).store(0, Ordering::Relaxed);
        self.word(slot, SLOT_STATE).store(EMPTY, Ordering::Release);
        debug!(slot, "reclaimed transient slot");
    }

    /// Reclaim the slot if it is terminal and nobody is attached. Caller holds the lock.
    fn reclaim_if_idle(&self, slot: u32) {
        let terminal = self.state(slot).is_some_and(State::is_terminal);
        if terminal && self.participants(slot) == 0 {
            self.reclaim(slot);
        }
    }

    fn unstage(&self, slot: u32, key: &CacheKey, reason: &'static str) {
        self.word(slot, SLOT_FLAGS)
            .fetch_or(SlotFlags::UNSTAGED.bits(), Ordering::AcqRel);
        debug!(%key, slot, reason, "stopped staging entry");
    }

    fn snapshot(&self, slot: u32, key: CacheKey) -> Entry {
        let url_len = (self.word(slot, SLOT_URL_LEN).load(Ordering::Relaxed) as usize)
            .min(MAX_URL_LEN);
        let mut url = vec![0u8; url_len];
        // SAFETY: URLs are only written while holding the table lock, which the caller holds.
        unsafe { self.region.read(self.slot_offset(slot) + SLOT_URL, &mut url) };
        Entry {
            key,
            url: Bytes::from(url),
            method: Method::from_u8(self.word(slot, SLOT_METHOD).load(Ordering::Relaxed) as u8),
            flags: RequestFlags::from_bits_truncate(
                self.word(slot, SLOT_REQ_FLAGS).load(Ordering::Relaxed),
            ),
            state: self.state(slot).unwrap_or(State::Abandoned),
            size: self.size(slot).load(Ordering::Acquire),
            readers: self.word(slot, SLOT_READERS).load(Ordering::Acquire),
            writer: self.word(slot, SLOT_WRITER).load(Ordering::Acquire) == 1,
            staged: !self.flags(slot).contains(SlotFlags::UNSTAGED),
        }
    }

    /// Move a writing entry to `state` and notify this process's waiters.
    pub(super) fn finish(&self, slot: u32, epoch: u32, state: State) {
        let _guard = self.lock().lock();
        self.finish_locked(slot, epoch, state);
    }

    fn finish_locked(&self, slot: u32, epoch: u32, state: State) {
        if self.word(slot, SLOT_EPOCH).load(Ordering::Acquire) != epoch {
            return;
        }
        let transition = self.word(slot, SLOT_STATE).compare_exchange(
            State::Writing.to_u32(),
            state.to_u32(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if transition.is_err() {
            return;
        }
        let notice = match state {
            State::Completed => {
                self.metrics.completed.inc();
                Notice::Available
            }
            _ => {
                self.metrics.abandoned.inc();
                Notice::Abandoned
            }
        };
        debug!(slot, epoch, ?state, "finished writing");
        self.notify(slot, epoch, notice);
    }

    fn notify(&self, slot: u32, epoch: u32, notice: Notice) {
        let mut waiters = self.waiters.lock().unwrap();
        let Some(list) = waiters.remove(&slot) else {
            return;
        };
        for waiter in list {
            let notice = if waiter.epoch == epoch {
                notice
            } else {
                Notice::Abandoned
            };
            let _ = waiter.sender.send(notice);
        }
    }

    /// Detach the writer of a slot incarnation.
    pub(super) fn detach_writer(&self, slot: u32, epoch: u32) {
        let _guard = self.lock().lock();
        if self.word(slot, SLOT_EPOCH).load(Ordering::Acquire) != epoch {
            return;
        }
        self.finish_locked(slot, epoch, State::Abandoned);
        self.word(slot, SLOT_WRITER).store(0, Ordering::Release);
        self.reclaim_if_idle(slot);
    }

    /// Detach a reader of a slot incarnation.
    pub(super) fn detach_reader(&self, slot: u32, epoch: u32) {
        let _guard = self.lock().lock();
        if self.word(slot, SLOT_EPOCH).load(Ordering::Acquire) != epoch {
            return;
        }
        let readers = self.word(slot, SLOT_READERS);
        let _ = readers.fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
            count.checked_sub(1)
        });
        self.reclaim_if_idle(slot);
    }

    pub(super) fn state_of(&self, slot: u32, epoch: u32) -> Option<State> {
        if self.word(slot, SLOT_EPOCH).load(Ordering::Acquire) != epoch {
            return None;
        }
        self.state(slot)
    }

    pub(super) fn staged_size(&self, slot: u32) -> u64 {
        self.size(slot).load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pages;
    use futures::{executor::block_on, FutureExt};
    use prometheus_client::encoding::text::encode;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use shoal_utils::{NZUsize, NZU32};
    use std::{
        env,
        num::{NonZeroU32, NonZeroU64},
        path::PathBuf,
        sync::{Arc, Barrier},
        thread,
    };

    fn config(entries: u32, window: u32) -> Config {
        Config {
            name: "transients".into(),
            directory: None,
            entries: NonZeroU32::new(entries).unwrap(),
            window: NonZeroU32::new(window).unwrap(),
        }
    }

    fn table() -> Transients {
        let mut registry = Registry::default();
        Transients::init(config(64, 8), None, &mut registry).unwrap()
    }

    fn staged_table(pages: u64) -> (Transients, PagePool) {
        let mut registry = Registry::default();
        let pool = PagePool::init(
            pages::Config {
                name: "pages".into(),
                directory: None,
                page_size: NZUsize!(64),
                capacity_bytes: NonZeroU64::new(64 * pages).unwrap(),
            },
            &mut registry,
        )
        .unwrap();
        let transients =
            Transients::init(config(16, 4), Some(pool.clone()), &mut registry).unwrap();
        (transients, pool)
    }

    fn key(url: &str) -> CacheKey {
        CacheKey::from_request(b"GET", url.as_bytes())
    }

    fn start(transients: &Transients, url: &str) -> Result<Writer, Error> {
        transients.start_writing(key(url), url, RequestFlags::CACHABLE, Method::Get)
    }

    fn directory() -> PathBuf {
        let mut rng = StdRng::from_entropy();
        env::temp_dir().join(format!("transients_{}", rng.gen::<u64>()))
    }

    #[test]
    fn test_single_writer() {
        let transients = table();
        let writer = start(&transients, "http://a/").unwrap();
        assert!(matches!(
            start(&transients, "http://a/"),
            Err(Error::Busy(_))
        ));

        // Different keys are independent
        let _other = start(&transients, "http://b/").unwrap();

        // Once the writer leaves, the key can be written again
        drop(writer);
        assert!(transients.get(&key("http://a/")).is_none());
        let _writer = start(&transients, "http://a/").unwrap();
    }

    #[test]
    fn test_single_writer_across_threads() {
        const THREADS: usize = 8;

        let transients = table();
        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let transients = transients.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let result = start(&transients, "http://race/");
                    // Hold the writer until everyone tried
                    barrier.wait();
                    result.is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_collapsed_forwarding() {
        let transients = table();
        let url = "http://collapsed/";
        let writer = start(&transients, url).unwrap();

        // Two readers arrive while the object is being written
        let Lookup::Pending(first) = transients.get_async(&key(url)) else {
            panic!("expected pending lookup");
        };
        let Lookup::Pending(second) = transients.get_async(&key(url)) else {
            panic!("expected pending lookup");
        };
        assert_eq!(transients.get(&key(url)).unwrap().readers, 2);

        // Nothing is delivered before completion
        let mut first = first;
        assert!((&mut first).now_or_never().is_none());

        transients.complete_writing(&writer);
        let (first_reader, first_notice) = block_on(first);
        let (second_reader, second_notice) = block_on(second);
        assert_eq!(first_notice, Notice::Available);
        assert_eq!(second_notice, Notice::Available);
        assert_eq!(first_reader.state(), Some(State::Completed));

        // A third reader is answered synchronously
        let Lookup::Ready(third) = transients.get_async(&key(url)) else {
            panic!("expected ready lookup");
        };
        assert_eq!(third.key(), &key(url));

        // Completing again is a no-op
        transients.complete_writing(&writer);
        transients.abandon(&writer);
        assert_eq!(
            transients.get(&key(url)).unwrap().state,
            State::Completed
        );

        // The slot is reclaimed once everyone leaves
        transients.disconnect(writer);
        transients.disconnect(first_reader);
        transients.disconnect(second_reader);
        assert!(transients.get(&key(url)).is_some());
        transients.disconnect(third);
        assert!(transients.get(&key(url)).is_none());
    }

    #[test]
    fn test_abandonment() {
        let transients = table();
        let url = "http://abandoned/";
        let writer = start(&transients, url).unwrap();
        let Lookup::Pending(subscription) = transients.get_async(&key(url)) else {
            panic!("expected pending lookup");
        };

        transients.abandon(&writer);
        transients.abandon(&writer);
        let (reader, notice) = block_on(subscription);
        assert_eq!(notice, Notice::Abandoned);
        assert!(transients.abandoned(&key(url)));
        assert!(matches!(transients.get_async(&key(url)), Lookup::Missing));
        assert!(transients.open_reader(&key(url)).is_none());

        // A new writer succeeds even though the old entry still has a reader
        drop(writer);
        let replacement = start(&transients, url).unwrap();
        assert!(!transients.abandoned(&key(url)));
        assert_eq!(
            transients.get(&key(url)).unwrap().state,
            State::Writing
        );

        // The retired entry stays intact for its reader
        assert_eq!(reader.state(), Some(State::Abandoned));
        drop(reader);
        assert_eq!(
            transients.get(&key(url)).unwrap().state,
            State::Writing
        );
        drop(replacement);
    }

    #[test]
    fn test_writer_drop_abandons() {
        let transients = table();
        let url = "http://dropped/";
        let writer = start(&transients, url).unwrap();
        let Lookup::Pending(subscription) = transients.get_async(&key(url)) else {
            panic!("expected pending lookup");
        };
        drop(writer);
        let (_reader, notice) = block_on(subscription);
        assert_eq!(notice, Notice::Abandoned);
    }

    #[test]
    fn test_dropped_subscription_releases_slot() {
        let transients = table();
        let url = "http://cancelled/";
        let writer = start(&transients, url).unwrap();
        let Lookup::Pending(subscription) = transients.get_async(&key(url)) else {
            panic!("expected pending lookup");
        };
        drop(subscription);
        assert_eq!(transients.get(&key(url)).unwrap().readers, 0);
        transients.complete_writing(&writer);
        drop(writer);
        assert!(transients.get(&key(url)).is_none());
    }

    #[test]
    fn test_get_snapshot() {
        let transients = table();
        let url = "http://snapshot/index.html";
        let writer = transients
            .start_writing(
                key(url),
                url,
                RequestFlags::CACHABLE | RequestFlags::IMS,
                Method::Head,
            )
            .unwrap();
        let entry = transients.get(&key(url)).unwrap();
        assert_eq!(entry.url, Bytes::from_static(url.as_bytes()));
        assert_eq!(entry.method, Method::Head);
        assert_eq!(entry.flags, RequestFlags::CACHABLE | RequestFlags::IMS);
        assert_eq!(entry.state, State::Writing);
        assert!(entry.writer);
        assert_eq!(entry.readers, 0);
        drop(writer);
        assert!(transients.get(&key(url)).is_none());
    }

    #[test]
    fn test_url_too_long() {
        let transients = table();
        let url = format!("http://long/{}", "x".repeat(MAX_URL_LEN));
        assert!(matches!(
            start(&transients, &url),
            Err(Error::UrlTooLong(_))
        ));
    }

    #[test]
    fn test_full() {
        let mut registry = Registry::default();
        let transients = Transients::init(config(2, 2), None, &mut registry).unwrap();
        let _a = start(&transients, "http://1/").unwrap();
        let _b = start(&transients, "http://2/").unwrap();
        assert!(matches!(start(&transients, "http://3/"), Err(Error::Full(_))));
    }

    #[test]
    fn test_full_keeps_completed_entry() {
        let mut registry = Registry::default();
        let transients = Transients::init(config(1, 1), None, &mut registry).unwrap();
        let url = "http://kept/";
        let writer = start(&transients, url).unwrap();
        transients.complete_writing(&writer);
        drop(writer);
        let reader = transients.open_reader(&key(url)).unwrap();

        // No room for a second incarnation, so nothing changes
        assert!(matches!(start(&transients, url), Err(Error::Full(_))));
        assert!(matches!(
            transients.get_async(&key(url)),
            Lookup::Ready(_)
        ));
        assert_eq!(
            transients.get(&key(url)).unwrap().state,
            State::Completed
        );
        drop(reader);
    }

    #[test]
    fn test_stage_and_read() {
        let (transients, pool) = staged_table(8);
        let url = "http://staged/";
        let writer = start(&transients, url).unwrap();
        let reader = transients.open_reader(&key(url)).unwrap();

        // Nothing staged yet
        let mut buf = [0u8; 16];
        assert_eq!(transients.read(&reader, 0, &mut buf).unwrap(), 0);

        // Stage across page boundaries
        let mut rng = StdRng::seed_from_u64(7);
        let mut body = vec![0u8; 200];
        rng.fill(&mut body[..]);
        transients.stage(&writer, &body[..50]).unwrap();
        transients.stage(&writer, &body[50..]).unwrap();
        assert_eq!(reader.size(), 200);
        assert_eq!(pool.level_of(Purpose::Transient), 4);

        let mut read = vec![0u8; 200];
        let mut offset = 0;
        while offset < 200 {
            let n = transients
                .read(&reader, offset as u64, &mut read[offset..])
                .unwrap();
            assert!(n > 0);
            offset += n;
        }
        assert_eq!(read, body);

        // Reads past the staged size return nothing while writing
        assert_eq!(transients.read(&reader, 200, &mut buf).unwrap(), 0);

        // Pages return to the pool once everyone leaves
        transients.complete_writing(&writer);
        drop(writer);
        drop(reader);
        assert_eq!(pool.level(), 0);
    }

    #[test]
    fn test_stage_exhaustion_unstages() {
        let (transients, pool) = staged_table(2);
        let url = "http://big/";
        let writer = start(&transients, url).unwrap();
        let reader = transients.open_reader(&key(url)).unwrap();

        assert!(matches!(
            transients.stage(&writer, &[1u8; 200]),
            Err(Error::Unstaged)
        ));
        let entry = transients.get(&key(url)).unwrap();
        assert!(!entry.staged);
        assert_eq!(entry.size, 128);

        // The staged prefix is still readable, then the reader must go to disk
        let mut buf = [0u8; 128];
        assert_eq!(transients.read(&reader, 0, &mut buf).unwrap(), 128);
        assert!(matches!(
            transients.read(&reader, 128, &mut buf),
            Err(Error::Unstaged)
        ));
        assert!(matches!(
            transients.stage(&writer, b"more"),
            Err(Error::Unstaged)
        ));

        drop(writer);
        drop(reader);
        assert_eq!(pool.level(), 0);
    }

    #[test]
    fn test_stage_without_pool() {
        let transients = table();
        let writer = start(&transients, "http://nopool/").unwrap();
        assert!(matches!(
            transients.stage(&writer, b"data"),
            Err(Error::Unstaged)
        ));
    }

    #[test]
    fn test_stage_after_complete() {
        let (transients, _pool) = staged_table(2);
        let writer = start(&transients, "http://done/").unwrap();
        transients.complete_writing(&writer);
        assert!(matches!(
            transients.stage(&writer, b"late"),
            Err(Error::NotWriting)
        ));
    }

    #[test]
    fn test_cross_process_notification() {
        let directory = directory();
        let mut cfg = config(32, 4);
        cfg.directory = Some(directory.clone());

        let mut registry = Registry::default();
        let first = Transients::init(cfg.clone(), None, &mut registry).unwrap();
        let mut registry = Registry::default();
        let second = Transients::attach(cfg.clone(), None, &mut registry).unwrap();

        // The writer in one mapping blocks writers in the other
        let url = "http://shared/";
        let writer = start(&first, url).unwrap();
        assert!(matches!(start(&second, url), Err(Error::Busy(_))));

        // A reader in the other mapping learns of completion through poll
        let Lookup::Pending(mut subscription) = second.get_async(&key(url)) else {
            panic!("expected pending lookup");
        };
        first.complete_writing(&writer);
        assert!((&mut subscription).now_or_never().is_none());
        assert_eq!(second.poll(), 1);
        let (_reader, notice) = block_on(subscription);
        assert_eq!(notice, Notice::Available);
        assert_eq!(second.poll(), 0);

        drop(writer);
        second.shutdown().unwrap();
        first.shutdown().unwrap();
        let mut registry = Registry::default();
        assert!(matches!(
            Transients::attach(cfg, None, &mut registry),
            Err(Error::Runtime(shoal_runtime::Error::RegionMissing(_)))
        ));
        std::fs::remove_dir_all(directory).unwrap();
    }

    #[test]
    fn test_attach_requires_matching_pool() {
        let directory = directory();
        let mut cfg = config(8, 2);
        cfg.directory = Some(directory.clone());
        let (_, pool) = staged_table(2);

        let mut registry = Registry::default();
        let created = Transients::init(cfg.clone(), Some(pool.clone()), &mut registry).unwrap();
        assert!(matches!(
            Transients::attach(cfg.clone(), None, &mut registry),
            Err(Error::InvalidConfig(_))
        ));
        let mut registry = Registry::default();
        Transients::attach(cfg, Some(pool), &mut registry).unwrap();
        created.shutdown().unwrap();
        std::fs::remove_dir_all(directory).unwrap();
    }

    #[test]
    fn test_metrics() {
        let mut registry = Registry::default();
        let transients = Transients::init(config(16, 4), None, &mut registry).unwrap();
        let a = start(&transients, "http://a/").unwrap();
        let _ = start(&transients, "http://a/");
        let b = start(&transients, "http://b/").unwrap();
        transients.complete_writing(&a);
        transients.abandon(&b);

        let mut buffer = String::new();
        encode(&mut buffer, &registry).unwrap();
        assert!(buffer.contains("transients_started_total 2"));
        assert!(buffer.contains("transients_busy_total 1"));
        assert!(buffer.contains("transients_completed_total 1"));
        assert!(buffer.contains("transients_abandoned_total 1"));
    }

    #[test]
    fn test_window_capped_at_entries() {
        let cfg = Config {
            name: "t".into(),
            directory: None,
            entries: NZU32!(4),
            window: NZU32!(8),
        };
        let mut registry = Registry::default();
        let transients = Transients::init(cfg, None, &mut registry).unwrap();
        assert_eq!(transients.entries(), 4);

        // Every slot is reachable, none twice
        let writers: Vec<_> = (0..4)
            .map(|i| start(&transients, &format!("http://{i}/")).unwrap())
            .collect();
        assert!(matches!(start(&transients, "http://4/"), Err(Error::Full(_))));
        drop(writers);
        let _writer = start(&transients, "http://4/").unwrap();
    }
}
