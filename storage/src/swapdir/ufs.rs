//! A directory storing each object in its own blob.
//!
//! Blob names are the object's fileno as a big-endian `u32`. A blob holds exactly one swap header
//! followed by the body, so a blob whose length differs from what its header declares is
//! rejected on rebuild.

use super::{dir::Layout, Error};
use shoal_runtime::{Blob, Storage};
use std::{collections::HashMap, num::NonZeroU64, sync::Mutex};
use tracing::warn;

/// One blob per object in a partition.
pub struct Ufs<S: Storage> {
    storage: S,
    partition: String,
    slots: u32,
    max_size: u64,
    /// Blobs with unsealed writes.
    writing: Mutex<HashMap<u32, S::Blob>>,
}

impl<S: Storage> Ufs<S> {
    /// Create a layout of `max_size / average_object_size` slots in `partition`.
    pub fn new(
        storage: S,
        partition: &str,
        max_size: NonZeroU64,
        average_object_size: NonZeroU64,
    ) -> Result<Self, Error> {
        let slots = max_size.get() / average_object_size.get();
        if slots == 0 || slots > u32::MAX as u64 {
            return Err(Error::InvalidConfig(
                "max size must hold between 1 and 2^32-1 average objects",
            ));
        }
        Ok(Self {
            storage,
            partition: partition.into(),
            slots: slots as u32,
            max_size: max_size.get(),
            writing: Mutex::new(HashMap::new()),
        })
    }

    fn name(fileno: u32) -> [u8; 4] {
        fileno.to_be_bytes()
    }

    /// Blob holding `fileno`, reusing one with unsealed writes.
    async fn blob(&self, fileno: u32) -> Result<S::Blob, Error> {
        if let Some(blob) = self.writing.lock().unwrap().get(&fileno) {
            return Ok(blob.clone());
        }
        let (blob, _) = self
            .storage
            .open(&self.partition, &Self::name(fileno))
            .await?;
        Ok(blob)
    }
}

impl<S: Storage> Layout for Ufs<S> {
    fn slots(&self) -> u32 {
        self.slots
    }

    fn capacity(&self) -> u64 {
        self.max_size
    }

    fn exact(&self) -> bool {
        true
    }

    async fn scan(&self) -> Result<Vec<(u32, u64)>, Error> {
        let names = match self.storage.scan(&self.partition).await {
            Ok(names) => names,
            Err(shoal_runtime::Error::PartitionMissing(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut candidates = Vec::with_capacity(names.len());
        for name in names {
            let fileno = match <[u8; 4]>::try_from(name.as_slice()) {
                Ok(bytes) => u32::from_be_bytes(bytes),
                Err(_) => {
                    warn!(partition = %self.partition, ?name, "ignoring unknown blob");
                    continue;
                }
            };
            if fileno >= self.slots {
                warn!(partition = %self.partition, fileno, "ignoring blob outside directory");
                continue;
            }
            let (_, len) = self.storage.open(&self.partition, &name).await?;
            candidates.push((fileno, len));
        }
        Ok(candidates)
    }

    async fn read(&self, fileno: u32, offset: u64, len: usize) -> Result<Vec<u8>, Error> {
        let blob = self.blob(fileno).await?;
        Ok(blob.read_at(vec![0; len], offset).await?)
    }

    async fn write(&self, fileno: u32, offset: u64, data: Vec<u8>) -> Result<(), Error> {
        let blob = self.blob(fileno).await?;
        blob.write_at(data, offset).await?;
        self.writing.lock().unwrap().insert(fileno, blob);
        Ok(())
    }

    async fn invalidate(&self, fileno: u32) -> Result<(), Error> {
        self.writing.lock().unwrap().remove(&fileno);
        match self
            .storage
            .remove(&self.partition, Some(&Self::name(fileno)))
            .await
        {
            Ok(())
            | Err(shoal_runtime::Error::BlobMissing(..))
            | Err(shoal_runtime::Error::PartitionMissing(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn seal(&self, fileno: u32, len: u64) -> Result<(), Error> {
        let blob = self.blob(fileno).await?;
        blob.resize(len).await?;
        blob.sync().await?;
        self.writing.lock().unwrap().remove(&fileno);
        Ok(())
    }

    async fn sync(&self) -> Result<(), Error> {
        Ok(())
    }
}
