use super::{
    index::Index, Config, EntryFlags, Error, Found, Object, Pending, RebuildStats, Record,
    Stat, StoreEntry, SwapDir,
};
use crate::{
    swapmeta::{self, Header, StdMeta},
    transients::{self, Method, Transients},
};
use bytes::Bytes;
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use shoal_utils::CacheKey;
use std::{
    borrow::Cow,
    future::Future,
    mem,
    sync::{Arc, Mutex},
};
use tracing::{debug, info, warn};

/// Bytes read from the front of a slot when looking for its header.
const PREFIX_READ: u64 = 4096;

/// Where a directory keeps its slots.
pub trait Layout: Send + Sync + 'static {
    /// Number of slots.
    fn slots(&self) -> u32;

    /// Most bytes (header and body) a single slot can hold.
    fn capacity(&self) -> u64;

    /// Whether an object must fill its slot exactly (one blob per object).
    fn exact(&self) -> bool;

    /// Slots that may hold an object, with the bytes stored in each.
    fn scan(&self) -> impl Future<Output = Result<Vec<(u32, u64)>, Error>> + Send;

    /// Read `len` bytes at `offset` within slot `fileno`.
    fn read(
        &self,
        fileno: u32,
        offset: u64,
        len: usize,
    ) -> impl Future<Output = Result<Vec<u8>, Error>> + Send;

    /// Write `data` at `offset` within slot `fileno`.
    fn write(
        &self,
        fileno: u32,
        offset: u64,
        data: Vec<u8>,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Make slot `fileno` read back as empty.
    fn invalidate(&self, fileno: u32) -> impl Future<Output = Result<(), Error>> + Send;

    /// Durably persist an object of `len` bytes written to slot `fileno`.
    fn seal(&self, fileno: u32, len: u64) -> impl Future<Output = Result<(), Error>> + Send;

    /// Durably persist earlier invalidations.
    fn sync(&self) -> impl Future<Output = Result<(), Error>> + Send;
}

struct Metrics {
    puts: Counter,
    hits: Counter,
    misses: Counter,
    evictions: Counter,
    loaded: Counter,
    invalid: Counter,
}

impl Metrics {
    fn init(registry: &mut Registry) -> Self {
        let metrics = Self {
            puts: Counter::default(),
            hits: Counter::default(),
            misses: Counter::default(),
            evictions: Counter::default(),
            loaded: Counter::default(),
            invalid: Counter::default(),
        };
        registry.register("puts", "Number of objects stored", metrics.puts.clone());
        registry.register(
            "hits",
            "Number of lookups served from disk",
            metrics.hits.clone(),
        );
        registry.register(
            "misses",
            "Number of lookups that found nothing",
            metrics.misses.clone(),
        );
        registry.register(
            "evictions",
            "Number of objects evicted",
            metrics.evictions.clone(),
        );
        registry.register(
            "rebuild_loaded",
            "Number of objects loaded by rebuilds",
            metrics.loaded.clone(),
        );
        registry.register(
            "rebuild_invalid",
            "Number of slots rejected by rebuilds",
            metrics.invalid.clone(),
        );
        metrics
    }
}

/// A cache directory over a [Layout].
pub struct Dir<L: Layout> {
    layout: L,
    cfg: Config,
    index: Index,
    transients: Option<Transients>,
    /// Slots of pending objects dropped before being committed or discarded.
    orphans: Arc<Mutex<Vec<u32>>>,
    metrics: Metrics,
}

impl<L: Layout> Dir<L> {
    /// Wrap `layout` with an empty index.
    ///
    /// Metrics are registered with a `partition` label.
    pub fn new(
        layout: L,
        cfg: Config,
        transients: Option<Transients>,
        registry: &mut Registry,
    ) -> Self {
        let registry = registry.sub_registry_with_label((
            Cow::Borrowed("partition"),
            Cow::Owned(cfg.partition.clone()),
        ));
        let metrics = Metrics::init(registry);
        let index = Index::new(layout.slots(), cfg.policy);
        Self {
            layout,
            cfg,
            index,
            transients,
            orphans: Arc::new(Mutex::new(Vec::new())),
            metrics,
        }
    }

    /// The underlying layout.
    pub fn layout(&self) -> &L {
        &self.layout
    }

    /// Largest body accepted (for an entry with an empty URL).
    fn max_object_size(&self) -> u64 {
        let limit = self.layout.capacity().saturating_sub(min_header_len());
        match self.cfg.max_object_size {
            Some(max) => max.get().min(limit),
            None => limit,
        }
    }

    /// Slots in use, not counting those of dropped pending objects.
    fn in_use(&self) -> u32 {
        let orphans = self.orphans.lock().unwrap().len() as u32;
        self.index.in_use().saturating_sub(orphans)
    }

    fn above(&self, percent: u8) -> bool {
        let percent = percent as u128;
        let slots = self.index.slots() as u128;
        let used = self.in_use() as u128;
        let max_size = self.cfg.max_size.get() as u128;
        let bytes = self.index.bytes() as u128;
        used * 100 > slots * percent || bytes * 100 > max_size * percent
    }

    async fn invalidate_all(&self, filenos: Vec<u32>) -> Result<(), Error> {
        if filenos.is_empty() {
            return Ok(());
        }
        for fileno in filenos {
            self.layout.invalidate(fileno).await?;
        }
        self.layout.sync().await
    }

    /// Release (and invalidate) the slots of pending objects dropped without being finished.
    async fn reclaim_orphans(&mut self) -> Result<(), Error> {
        let orphans = mem::take(&mut *self.orphans.lock().unwrap());
        if orphans.is_empty() {
            return Ok(());
        }
        for fileno in &orphans {
            self.index.release(*fileno);
        }
        debug!(partition = %self.cfg.partition, count = orphans.len(), "released orphaned slots");
        self.invalidate_all(orphans).await
    }

    /// Decode the header stored in slot `fileno` holding `stored` bytes.
    async fn load(
        &self,
        fileno: u32,
        stored: u64,
    ) -> Result<Result<swapmeta::Decoded, swapmeta::Error>, Error> {
        let prefix = stored.min(PREFIX_READ);
        let buf = self.layout.read(fileno, 0, prefix as usize).await?;
        match swapmeta::decode(&buf) {
            // The header is longer than the prefix but fits the slot
            Err(swapmeta::Error::InvalidLength(declared))
                if declared as u64 > prefix && declared as u64 <= stored =>
            {
                let buf = self.layout.read(fileno, 0, declared as usize).await?;
                Ok(swapmeta::decode(&buf))
            }
            result => Ok(result),
        }
    }

    fn record(&self, fileno: u32, stored: u64, decoded: swapmeta::Decoded) -> Option<Record> {
        if decoded.truncated {
            return None;
        }
        let header = decoded.header;
        let key = header.key?;
        let object_size = header.object_size?;
        let header_len = decoded.header_len as u64;
        let swap_file_size = header_len.checked_add(object_size)?;
        if swap_file_size > stored || (self.layout.exact() && swap_file_size != stored) {
            return None;
        }
        let std = header.std.unwrap_or(StdMeta {
            timestamp: -1,
            lastref: -1,
            expires: -1,
            lastmod: -1,
            ..StdMeta::default()
        });
        if header.std.is_some() && std.swap_file_size != swap_file_size {
            return None;
        }
        Some(Record {
            key,
            fileno,
            header_len,
            object_size,
            timestamp: std.timestamp,
            lastref: std.lastref,
            expires: std.expires,
            lastmod: std.lastmod,
            refcount: std.refcount,
            flags: EntryFlags::from_bits_retain(std.flags),
        })
    }
}

/// Length of the header written for an entry with an empty URL.
pub(super) fn min_header_len() -> u64 {
    header(&StoreEntry::new(Method::Get, ""), 0, 0).encoded_len() as u64
}

/// Swap header describing `entry` with a body of `object_size` bytes.
fn header(entry: &StoreEntry, header_len: u64, object_size: u64) -> Header {
    let mut header = Header::new(entry.key);
    header.url = Some(entry.url.clone());
    header.std = Some(StdMeta {
        timestamp: entry.timestamp,
        lastref: entry.lastref,
        expires: entry.expires,
        lastmod: entry.lastmod,
        swap_file_size: header_len + object_size,
        refcount: entry.refcount,
        flags: entry.flags.bits(),
    });
    header.object_size = Some(object_size);
    header
}

impl<L: Layout> SwapDir for Dir<L> {
    async fn rebuild(&mut self) -> Result<RebuildStats, Error> {
        self.reclaim_orphans().await?;
        let candidates = self.layout.scan().await?;
        let mut index = Index::new(self.layout.slots(), self.cfg.policy);
        let mut stats = RebuildStats::default();
        // Slots whose stale header must not be loaded by a later rebuild
        let mut stale = Vec::new();
        for (fileno, stored) in candidates {
            stats.scanned += 1;
            let loaded = match self.load(fileno, stored).await {
                Ok(loaded) => loaded,
                Err(err) => {
                    warn!(fileno, ?err, "failed to read slot");
                    stats.invalid += 1;
                    continue;
                }
            };
            let decoded = match loaded {
                Ok(decoded) => decoded,
                Err(swapmeta::Error::TooShort(_) | swapmeta::Error::Zeroed) => {
                    stats.zeroed += 1;
                    continue;
                }
                Err(err) => {
                    warn!(fileno, ?err, "invalid swap header");
                    stats.invalid += 1;
                    stale.push(fileno);
                    continue;
                }
            };
            let Some(record) = self.record(fileno, stored, decoded) else {
                warn!(fileno, stored, "swap header does not fit slot");
                stats.invalid += 1;
                stale.push(fileno);
                continue;
            };
            if index.contains(&record.key) {
                debug!(fileno, key = %record.key, "duplicate key");
                stats.duplicates += 1;
                stale.push(fileno);
                continue;
            }
            if !index.claim(fileno) {
                stats.invalid += 1;
                continue;
            }
            index.insert(record);
            stats.loaded += 1;
        }
        self.index = index;
        self.invalidate_all(stale).await?;

        self.metrics.loaded.inc_by(stats.loaded);
        self.metrics.invalid.inc_by(stats.invalid);
        info!(
            kind = %self.cfg.kind,
            partition = %self.cfg.partition,
            %stats,
            "rebuilt directory"
        );
        Ok(stats)
    }

    async fn create(&mut self, entry: StoreEntry) -> Result<Pending, Error> {
        self.reclaim_orphans().await?;
        let header_len = header(&entry, 0, 0).encoded_len() as u64;
        if header_len > self.layout.capacity() {
            return Err(Error::TooLarge(header_len));
        }
        let fileno = self.index.reserve().ok_or(Error::NoSpace)?;
        if let Err(err) = self.layout.invalidate(fileno).await {
            self.index.release(fileno);
            return Err(err);
        }

        let writer = match &self.transients {
            Some(transients) if entry.collapsible() => match transients.start_writing(
                entry.key,
                &entry.url,
                entry.request_flags,
                entry.method,
            ) {
                Ok(writer) => Some(writer),
                Err(err) => {
                    debug!(key = %entry.key, ?err, "storing without collapsing");
                    None
                }
            },
            _ => None,
        };
        debug!(key = %entry.key, fileno, "created");
        Ok(Pending {
            staging: writer.is_some(),
            entry,
            fileno,
            header_len,
            written: 0,
            writer,
            orphans: self.orphans.clone(),
            finished: false,
        })
    }

    async fn write(&mut self, pending: &mut Pending, data: &[u8]) -> Result<(), Error> {
        let written = pending.written + data.len() as u64;
        if written > self.max_object_size()
            || pending.header_len + written > self.layout.capacity()
        {
            return Err(Error::TooLarge(written));
        }
        self.layout
            .write(
                pending.fileno,
                pending.header_len + pending.written,
                data.to_vec(),
            )
            .await?;
        pending.written = written;

        if pending.staging {
            if let (Some(transients), Some(writer)) = (&self.transients, &pending.writer) {
                match transients.stage(writer, data) {
                    Ok(()) => {}
                    Err(transients::Error::Unstaged) => pending.staging = false,
                    Err(err) => {
                        debug!(key = %pending.entry.key, ?err, "stopped staging");
                        pending.staging = false;
                    }
                }
            }
        }
        Ok(())
    }

    async fn commit(&mut self, mut pending: Pending) -> Result<Record, Error> {
        let encoded = header(&pending.entry, pending.header_len, pending.written).encode();
        debug_assert_eq!(encoded.len() as u64, pending.header_len);
        let len = pending.header_len + pending.written;
        let stored = match self.layout.write(pending.fileno, 0, encoded).await {
            Ok(()) => self.layout.seal(pending.fileno, len).await,
            Err(err) => Err(err),
        };
        if let Err(err) = stored {
            warn!(key = %pending.entry.key, fileno = pending.fileno, ?err, "commit failed");
            self.discard(pending).await?;
            return Err(err);
        }

        let entry = &pending.entry;
        let record = Record {
            key: entry.key,
            fileno: pending.fileno,
            header_len: pending.header_len,
            object_size: pending.written,
            timestamp: entry.timestamp,
            lastref: entry.lastref,
            expires: entry.expires,
            lastmod: entry.lastmod,
            refcount: entry.refcount,
            flags: entry.flags,
        };
        let freed = self.index.insert(record.clone());
        pending.finished = true;
        if let (Some(transients), Some(writer)) = (&self.transients, pending.writer.take()) {
            transients.complete_writing(&writer);
        }
        self.invalidate_all(freed).await?;

        self.metrics.puts.inc();
        debug!(key = %record.key, fileno = record.fileno, size = record.object_size, "committed");
        Ok(record)
    }

    async fn discard(&mut self, mut pending: Pending) -> Result<(), Error> {
        if let (Some(transients), Some(writer)) = (&self.transients, pending.writer.take()) {
            transients.abandon(&writer);
        }
        self.index.release(pending.fileno);
        pending.finished = true;
        debug!(key = %pending.entry.key, fileno = pending.fileno, "discarded");
        self.layout.invalidate(pending.fileno).await
    }

    fn get(&mut self, key: &CacheKey) -> Option<Found> {
        if let Some(record) = self.index.get(key) {
            self.metrics.hits.inc();
            return Some(Found::Disk(record.clone()));
        }
        let found = self
            .transients
            .as_ref()
            .and_then(|transients| transients.get(key))
            .filter(|entry| entry.state != transients::State::Abandoned)
            .map(Found::InTransit);
        if found.is_none() {
            self.metrics.misses.inc();
        }
        found
    }

    async fn read(&mut self, key: &CacheKey) -> Result<Option<Object>, Error> {
        let Some(record) = self.index.get(key).cloned() else {
            return Ok(None);
        };
        let buf = self
            .layout
            .read(record.fileno, 0, record.swap_file_size() as usize)
            .await?;
        let checked = swapmeta::decode(&buf).and_then(|decoded| {
            decoded.header.check_key(key)?;
            let body = buf.len() as u64 - decoded.header_len as u64;
            decoded.header.check_object_size(body)?;
            if decoded.header_len as u64 != record.header_len {
                return Err(swapmeta::Error::InvalidLength(decoded.header_len as u32));
            }
            Ok(decoded)
        });
        match checked {
            Ok(decoded) => {
                let body = Bytes::from(buf).slice(decoded.header_len..);
                Ok(Some(Object {
                    record,
                    header: decoded.header,
                    body,
                }))
            }
            Err(err) => {
                warn!(%key, fileno = record.fileno, ?err, "stored object does not match index");
                self.unlink(key).await?;
                Ok(None)
            }
        }
    }

    async fn unlink(&mut self, key: &CacheKey) -> Result<bool, Error> {
        self.reclaim_orphans().await?;
        let Some(freed) = self.index.unlink(key) else {
            return Ok(false);
        };
        debug!(%key, deferred = freed.is_empty(), "unlinked");
        self.invalidate_all(freed).await?;
        Ok(true)
    }

    fn reference(&mut self, key: &CacheKey) -> bool {
        self.index.reference(key)
    }

    async fn dereference(&mut self, key: &CacheKey) -> Result<bool, Error> {
        self.reclaim_orphans().await?;
        let (indexed, freed) = self.index.dereference(key);
        self.invalidate_all(freed).await?;
        Ok(indexed)
    }

    async fn maintain(&mut self) -> Result<usize, Error> {
        self.reclaim_orphans().await?;
        let mut evicted = 0;
        while self.above(self.cfg.low_water) {
            let Some((key, freed)) = self.index.evict() else {
                warn!(partition = %self.cfg.partition, "nothing left to evict");
                break;
            };
            self.invalidate_all(freed).await?;
            self.metrics.evictions.inc();
            debug!(%key, "evicted");
            evicted += 1;
        }
        Ok(evicted)
    }

    fn full(&self) -> bool {
        self.above(self.cfg.high_water)
    }

    fn can_store(&self, size: u64) -> bool {
        size <= self.max_object_size()
            && self.in_use() < self.index.slots()
            && !self.full()
    }

    fn stat(&self) -> Stat {
        Stat {
            kind: self.cfg.kind,
            partition: self.cfg.partition.clone(),
            slots: self.index.slots(),
            used: self.in_use(),
            bytes: self.index.bytes(),
            max_size: self.cfg.max_size.get(),
            max_object_size: self.max_object_size(),
            high_water: self.cfg.high_water,
            low_water: self.cfg.low_water,
        }
    }
}
