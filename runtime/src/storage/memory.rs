//! Blobs held in memory, for tests and tooling.
//!
//! Every blob has a durable copy (what a restart would find) and, per opened handle, a working
//! copy. Writes land in the working copy and reach the durable copy on [crate::Blob::sync], so a
//! test can drop a directory mid-write and observe exactly what recovery sees.

use crate::Error;
use shoal_utils::hex;
use std::{
    collections::{BTreeMap, HashMap},
    ops::Range,
    sync::{Arc, Mutex, RwLock},
};

/// Durable blob contents, by partition and blob name.
type Shelf = HashMap<String, BTreeMap<Vec<u8>, Vec<u8>>>;

/// Byte range `offset..offset + len`, if addressable.
fn span(offset: u64, len: usize) -> Result<Range<usize>, Error> {
    let start = usize::try_from(offset).map_err(|_| Error::OffsetOverflow)?;
    let end = start.checked_add(len).ok_or(Error::OffsetOverflow)?;
    Ok(start..end)
}

/// In-memory storage.
#[derive(Clone, Default)]
pub struct Storage {
    shelf: Arc<Mutex<Shelf>>,
}

impl Storage {
    /// Total durable bytes held in `partition`.
    pub fn durable_len(&self, partition: &str) -> u64 {
        let shelf = self.shelf.lock().unwrap();
        shelf
            .get(partition)
            .map(|blobs| blobs.values().map(|content| content.len() as u64).sum())
            .unwrap_or(0)
    }
}

impl crate::Storage for Storage {
    type Blob = Blob;

    async fn open(&self, partition: &str, name: &[u8]) -> Result<(Blob, u64), Error> {
        super::validate_partition_name(partition)?;
        let durable = self
            .shelf
            .lock()
            .unwrap()
            .entry(partition.into())
            .or_default()
            .entry(name.into())
            .or_default()
            .clone();
        let len = durable.len() as u64;
        let blob = Blob {
            shelf: self.shelf.clone(),
            partition: partition.into(),
            name: name.into(),
            working: Arc::new(RwLock::new(durable)),
        };
        Ok((blob, len))
    }

    async fn remove(&self, partition: &str, name: Option<&[u8]>) -> Result<(), Error> {
        super::validate_partition_name(partition)?;
        let mut shelf = self.shelf.lock().unwrap();
        let Some(name) = name else {
            return shelf
                .remove(partition)
                .map(drop)
                .ok_or_else(|| Error::PartitionMissing(partition.into()));
        };
        let blobs = shelf
            .get_mut(partition)
            .ok_or_else(|| Error::PartitionMissing(partition.into()))?;
        match blobs.remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::BlobMissing(partition.into(), hex(name))),
        }
    }

    async fn scan(&self, partition: &str) -> Result<Vec<Vec<u8>>, Error> {
        super::validate_partition_name(partition)?;
        let shelf = self.shelf.lock().unwrap();
        let blobs = shelf
            .get(partition)
            .ok_or_else(|| Error::PartitionMissing(partition.into()))?;
        Ok(blobs.keys().cloned().collect())
    }
}

/// A handle to an in-memory blob.
#[derive(Clone)]
pub struct Blob {
    shelf: Arc<Mutex<Shelf>>,
    partition: Arc<str>,
    name: Arc<[u8]>,
    /// Content including unsynced writes (shared by clones of this handle).
    working: Arc<RwLock<Vec<u8>>>,
}

impl crate::Blob for Blob {
    async fn read_at(&self, buf: impl Into<Vec<u8>> + Send, offset: u64) -> Result<Vec<u8>, Error> {
        let mut buf = buf.into();
        let range = span(offset, buf.len())?;
        let working = self.working.read().unwrap();
        let Some(bytes) = working.get(range) else {
            return Err(Error::ReadPastEnd(self.partition.to_string(), hex(&self.name)));
        };
        buf.copy_from_slice(bytes);
        Ok(buf)
    }

    async fn write_at(&self, buf: impl Into<Vec<u8>> + Send, offset: u64) -> Result<(), Error> {
        let buf = buf.into();
        let range = span(offset, buf.len())?;
        let mut working = self.working.write().unwrap();
        if working.len() < range.end {
            working.resize(range.end, 0);
        }
        working[range].copy_from_slice(&buf);
        Ok(())
    }

    async fn resize(&self, len: u64) -> Result<(), Error> {
        let len = span(len, 0)?.start;
        self.working.write().unwrap().resize(len, 0);
        Ok(())
    }

    async fn sync(&self) -> Result<(), Error> {
        let snapshot = self.working.read().unwrap().clone();
        let mut shelf = self.shelf.lock().unwrap();
        let durable = shelf
            .get_mut(&*self.partition)
            .and_then(|blobs| blobs.get_mut(&*self.name))
            .ok_or_else(|| Error::BlobMissing(self.partition.to_string(), hex(&self.name)))?;
        *durable = snapshot;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{storage::tests::run_storage_tests, Blob as _, Storage as _};

    #[tokio::test]
    async fn test_sync_after_remove() {
        let storage = Storage::default();
        let (blob, _) = storage.open("partition", b"gone").await.unwrap();
        blob.write_at(b"data".to_vec(), 0).await.unwrap();
        storage.remove("partition", Some(b"gone")).await.unwrap();
        assert!(matches!(blob.sync().await, Err(Error::BlobMissing(_, _))));
        assert_eq!(storage.durable_len("partition"), 0);
    }

    #[tokio::test]
    async fn test_memory_storage() {
        let storage = Storage::default();
        run_storage_tests(storage).await;
    }

    #[tokio::test]
    async fn test_unsynced_writes_are_not_visible_on_reopen() {
        let storage = Storage::default();
        let (blob, _) = storage.open("partition", b"lost").await.unwrap();
        blob.write_at(b"durable".to_vec(), 0).await.unwrap();
        blob.sync().await.unwrap();
        blob.write_at(b"volatile".to_vec(), 7).await.unwrap();

        assert_eq!(storage.durable_len("partition"), 7);

        let (reopened, len) = storage.open("partition", b"lost").await.unwrap();
        assert_eq!(len, 7);
        let read = reopened.read_at(vec![0; 7], 0).await.unwrap();
        assert_eq!(read, b"durable");
    }
}
