//! Fixed-size memory regions shared by cooperating processes.
//!
//! A [Region] is created once by a coordinating process ([Region::create]) and mapped by any
//! number of other processes ([Region::open]) using a well-known name. Named regions are backed
//! by a file in a caller-chosen directory (on Linux, `/dev/shm` keeps the file in memory). An
//! [Region::anonymous] region is private to the calling process and is useful when no other
//! process needs to attach (for example, in tests).
//!
//! # Access
//!
//! Regions expose raw memory. Structures stored in a region must be built from
//! fixed-layout words accessed through [Region::atomic_u32]/[Region::atomic_u64] (which are
//! safe to use concurrently from every process that maps the region) or copied in and out with
//! [Region::read]/[Region::write] while some protocol (such as holding a [Lock]) guarantees no
//! concurrent writer.

use crate::Error;
use memmap2::MmapMut;
use std::{
    fs::{self, OpenOptions},
    io::ErrorKind,
    path::{Path, PathBuf},
    ptr,
    sync::atomic::{AtomicU32, AtomicU64},
};
use tracing::{debug, info};

mod lock;
pub use lock::{Guard, Lock};

/// A mapped region of shared memory.
pub struct Region {
    name: String,
    path: Option<PathBuf>,
    base: *mut u8,
    len: usize,

    // Keeps the mapping alive for as long as `base` is used.
    _map: MmapMut,
}

// SAFETY: `base` points into `_map`, which lives as long as the region. All concurrent access
// goes through atomics or through the `unsafe` copy methods, whose callers must provide mutual
// exclusion.
unsafe impl Send for Region {}
// SAFETY: see above.
unsafe impl Sync for Region {}

impl Region {
    /// Create (or recreate) the named region with `len` zeroed bytes.
    ///
    /// A stale region left behind by a previous run is truncated and reused.
    pub fn create(directory: &Path, name: &str, len: usize) -> Result<Self, Error> {
        crate::storage::validate_partition_name(name)?;
        fs::create_dir_all(directory)
            .map_err(|e| Error::RegionCreateFailed(name.into(), e))?;
        let path = directory.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::RegionCreateFailed(name.into(), e))?;
        file.set_len(len as u64)
            .map_err(|e| Error::RegionCreateFailed(name.into(), e))?;

        // SAFETY: the file was just sized to `len` and is only resized through this module.
        let map =
            unsafe { MmapMut::map_mut(&file) }.map_err(|e| Error::RegionMapFailed(name.into(), e))?;
        info!(name, len, path = ?path, "created shared region");
        Ok(Self::new(name.into(), Some(path), map))
    }

    /// Map an existing named region.
    pub fn open(directory: &Path, name: &str) -> Result<Self, Error> {
        crate::storage::validate_partition_name(name)?;
        let path = directory.join(name);
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::RegionMissing(name.into()))
            }
            Err(e) => return Err(Error::RegionMapFailed(name.into(), e)),
        };

        // SAFETY: the creator sized the file before publishing it under this name.
        let map =
            unsafe { MmapMut::map_mut(&file) }.map_err(|e| Error::RegionMapFailed(name.into(), e))?;
        debug!(name, len = map.len(), "attached shared region");
        Ok(Self::new(name.into(), None, map))
    }

    /// Create a zeroed region visible only to the calling process.
    pub fn anonymous(len: usize) -> Result<Self, Error> {
        let map = MmapMut::map_anon(len).map_err(|e| Error::RegionMapFailed("anon".into(), e))?;
        Ok(Self::new("anon".into(), None, map))
    }

    /// Remove the named region from `directory`.
    ///
    /// Processes that still map the region keep their mapping until they drop it.
    pub fn remove(directory: &Path, name: &str) -> Result<(), Error> {
        crate::storage::validate_partition_name(name)?;
        fs::remove_file(directory.join(name)).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::RegionMissing(name.into()),
            _ => Error::RegionRemoveFailed(name.into(), e),
        })
    }

    fn new(name: String, path: Option<PathBuf>, mut map: MmapMut) -> Self {
        let base = map.as_mut_ptr();
        let len = map.len();
        Self {
            name,
            path,
            base,
            len,
            _map: map,
        }
    }

    /// Name of the region.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the backing file, if this process created a named region.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Length of the region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the region has no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns an error if the region is shorter than `required` bytes.
    pub fn require(&self, required: usize) -> Result<(), Error> {
        if self.len < required {
            return Err(Error::RegionTooSmall(self.len, required));
        }
        Ok(())
    }

    /// Process-local address of `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is beyond the end of the region.
    pub fn ptr(&self, offset: usize) -> *mut u8 {
        assert!(offset <= self.len, "offset {offset} outside region");
        // SAFETY: offset is within (or one past) the mapping.
        unsafe { self.base.add(offset) }
    }

    /// Interpret the 4 bytes at `offset` as an atomic word.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is misaligned or out of bounds.
    pub fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        self.check_word(offset, std::mem::size_of::<AtomicU32>());
        // SAFETY: in bounds and aligned (checked above). Mappings are zero-initialized and
        // AtomicU32 has the same in-memory representation as u32.
        unsafe { &*(self.base.add(offset) as *const AtomicU32) }
    }

    /// Interpret the 8 bytes at `offset` as an atomic word.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is misaligned or out of bounds.
    pub fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        self.check_word(offset, std::mem::size_of::<AtomicU64>());
        // SAFETY: in bounds and aligned (checked above).
        unsafe { &*(self.base.add(offset) as *const AtomicU64) }
    }

    /// Copy `dst.len()` bytes starting at `offset` into `dst`.
    ///
    /// # Safety
    ///
    /// No process may write the range concurrently.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub unsafe fn read(&self, offset: usize, dst: &mut [u8]) {
        self.check_range(offset, dst.len());
        ptr::copy_nonoverlapping(self.base.add(offset), dst.as_mut_ptr(), dst.len());
    }

    /// Copy `src` into the region starting at `offset`.
    ///
    /// # Safety
    ///
    /// No process may read or write the range concurrently.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub unsafe fn write(&self, offset: usize, src: &[u8]) {
        self.check_range(offset, src.len());
        ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(offset), src.len());
    }

    fn check_range(&self, offset: usize, len: usize) {
        let end = offset.checked_add(len);
        assert!(
            matches!(end, Some(end) if end <= self.len),
            "range {offset}+{len} outside region of {} bytes",
            self.len
        );
    }

    fn check_word(&self, offset: usize, size: usize) {
        assert!(offset % size == 0, "offset {offset} not aligned to {size}");
        self.check_range(offset, size);
    }
}
