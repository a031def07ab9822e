//! Blobs persisted as files, one directory per partition (Unix only).
//!
//! Blob I/O is positional and runs on tokio's blocking pool, so clones of a [Blob] never contend
//! on a shared cursor. Creating or removing a blob syncs the partition directory before returning
//! (unless [Config::sync_directories] is off), so a ufs object removed before a crash stays
//! removed after it.

use crate::{BlobOp, Error};
use shoal_utils::{from_hex, hex};
use std::{
    fs::{self, File, OpenOptions},
    io::{self, ErrorKind},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::task;
use tracing::{debug, warn};

/// Configuration for the file-backed [Storage].
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory under which every partition is created as a subdirectory.
    pub storage_directory: PathBuf,

    /// Whether to sync a partition's directory after creating or removing a blob in it.
    pub sync_directories: bool,
}

impl Config {
    /// Files under `storage_directory`, with directory syncing enabled.
    pub fn new(storage_directory: PathBuf) -> Self {
        Self {
            storage_directory,
            sync_directories: true,
        }
    }
}

/// Run blocking filesystem work off the async executor.
async fn blocking<T, F>(work: F) -> io::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> io::Result<T> + Send + 'static,
{
    task::spawn_blocking(work)
        .await
        .unwrap_or_else(|err| Err(io::Error::other(err)))
}

/// Persist the entries of `directory` (names created or removed in it).
fn sync_directory(directory: &Path) -> io::Result<()> {
    File::open(directory)?.sync_all()
}

/// Storage that persists each blob as a file named by the hex encoding of its name.
#[derive(Clone)]
pub struct Storage {
    cfg: Arc<Config>,
}

impl Storage {
    pub fn new(cfg: Config) -> Self {
        Self { cfg: Arc::new(cfg) }
    }

    fn partition_path(&self, partition: &str) -> Result<PathBuf, Error> {
        super::validate_partition_name(partition)?;
        Ok(self.cfg.storage_directory.join(partition))
    }
}

impl crate::Storage for Storage {
    type Blob = Blob;

    async fn open(&self, partition: &str, name: &[u8]) -> Result<(Blob, u64), Error> {
        let directory = self.partition_path(partition)?;
        let path = directory.join(hex(name));
        let sync_directories = self.cfg.sync_directories;
        let (file, len, created) = blocking(move || {
            fs::create_dir_all(&directory)?;
            let mut options = OpenOptions::new();
            options.read(true).write(true);
            let (file, created) = match options.clone().create_new(true).open(&path) {
                Ok(file) => (file, true),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => (options.open(&path)?, false),
                Err(err) => return Err(err),
            };
            if created && sync_directories {
                sync_directory(&directory)?;
            }
            let len = file.metadata()?.len();
            Ok((file, len, created))
        })
        .await
        .map_err(|source| Error::Blob {
            partition: partition.into(),
            name: hex(name),
            op: BlobOp::Open,
            source,
        })?;
        if created {
            debug!(partition, name = %hex(name), "created blob");
        }
        Ok((Blob::new(partition, name, file), len))
    }

    async fn remove(&self, partition: &str, name: Option<&[u8]>) -> Result<(), Error> {
        let directory = self.partition_path(partition)?;
        let sync_directories = self.cfg.sync_directories;
        match name {
            Some(name) => {
                let path = directory.join(hex(name));
                blocking(move || {
                    fs::remove_file(&path)?;
                    if sync_directories {
                        sync_directory(&directory)?;
                    }
                    Ok(())
                })
                .await
                .map_err(|source| match source.kind() {
                    ErrorKind::NotFound => Error::BlobMissing(partition.into(), hex(name)),
                    _ => Error::Blob {
                        partition: partition.into(),
                        name: hex(name),
                        op: BlobOp::Remove,
                        source,
                    },
                })
            }
            None => {
                let root = self.cfg.storage_directory.clone();
                blocking(move || {
                    fs::remove_dir_all(&directory)?;
                    if sync_directories {
                        sync_directory(&root)?;
                    }
                    Ok(())
                })
                .await
                .map_err(|source| match source.kind() {
                    ErrorKind::NotFound => Error::PartitionMissing(partition.into()),
                    _ => Error::PartitionIo(partition.into(), source),
                })
            }
        }
    }

    async fn scan(&self, partition: &str) -> Result<Vec<Vec<u8>>, Error> {
        let directory = self.partition_path(partition)?;
        let (mut blobs, skipped) = blocking(move || {
            let mut blobs = Vec::new();
            let mut skipped = Vec::new();
            for entry in fs::read_dir(&directory)? {
                let entry = entry?;
                let file_name = entry.file_name();
                let is_file = entry.file_type()?.is_file();
                match file_name.to_str().and_then(from_hex) {
                    Some(name) if is_file => blobs.push(name),
                    _ => skipped.push(file_name),
                }
            }
            Ok((blobs, skipped))
        })
        .await
        .map_err(|source| match source.kind() {
            ErrorKind::NotFound => Error::PartitionMissing(partition.into()),
            _ => Error::PartitionIo(partition.into(), source),
        })?;
        for file_name in skipped {
            warn!(partition, ?file_name, "ignoring foreign entry");
        }
        blobs.sort();
        Ok(blobs)
    }
}

/// A file-backed blob.
#[derive(Clone)]
pub struct Blob {
    partition: Arc<str>,
    name: Arc<[u8]>,
    file: Arc<File>,
}

impl Blob {
    fn new(partition: &str, name: &[u8], file: File) -> Self {
        Self {
            partition: partition.into(),
            name: name.into(),
            file: Arc::new(file),
        }
    }

    fn error(&self, op: BlobOp, source: io::Error) -> Error {
        Error::Blob {
            partition: self.partition.to_string(),
            name: hex(&self.name),
            op,
            source,
        }
    }
}

impl crate::Blob for Blob {
    async fn read_at(&self, buf: impl Into<Vec<u8>> + Send, offset: u64) -> Result<Vec<u8>, Error> {
        let file = self.file.clone();
        let mut buf = buf.into();
        blocking(move || file.read_exact_at(&mut buf, offset).map(|()| buf))
            .await
            .map_err(|source| match source.kind() {
                ErrorKind::UnexpectedEof => {
                    Error::ReadPastEnd(self.partition.to_string(), hex(&self.name))
                }
                _ => self.error(BlobOp::Read, source),
            })
    }

    async fn write_at(&self, buf: impl Into<Vec<u8>> + Send, offset: u64) -> Result<(), Error> {
        let file = self.file.clone();
        let buf = buf.into();
        offset
            .checked_add(buf.len() as u64)
            .ok_or(Error::OffsetOverflow)?;
        blocking(move || file.write_all_at(&buf, offset))
            .await
            .map_err(|source| self.error(BlobOp::Write, source))
    }

    async fn resize(&self, len: u64) -> Result<(), Error> {
        let file = self.file.clone();
        blocking(move || file.set_len(len))
            .await
            .map_err(|source| self.error(BlobOp::Resize, source))
    }

    async fn sync(&self) -> Result<(), Error> {
        let file = self.file.clone();
        // The length is part of the data a reader needs, so fdatasync covers resizes
        blocking(move || file.sync_data())
            .await
            .map_err(|source| self.error(BlobOp::Sync, source))
    }
}
