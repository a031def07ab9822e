//! Access disk blobs and shared memory regions from cooperating processes.
//!
//! This crate provides the two resources the shoal storage primitives are built on:
//!
//! - [Storage] and [Blob]: asynchronous, offset-addressed access to named blobs grouped into
//!   partitions. The `tokio` module persists blobs as files; the `memory` module keeps them in
//!   memory (used by tests and tooling).
//! - [shm::Region]: a fixed-size memory region that several processes map at the same time
//!   (backed by a file in a directory such as `/dev/shm`), together with [shm::Lock], a word-sized
//!   lock that lives inside such a region.
//!
//! # Status
//!
//! `shoal-runtime` is **ALPHA** software and is not yet recommended for production use. Developers
//! should expect breaking changes and occasional instability.

use std::{fmt, future::Future, io::Error as IoError};
use thiserror::Error;

pub mod shm;
mod storage;
pub use storage::{memory, tokio};

/// A blob operation that can fail with an I/O error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlobOp {
    Open,
    Read,
    Write,
    Resize,
    Sync,
    Remove,
}

impl fmt::Display for BlobOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BlobOp::Open => "open",
            BlobOp::Read => "read",
            BlobOp::Write => "write",
            BlobOp::Resize => "resize",
            BlobOp::Sync => "sync",
            BlobOp::Remove => "remove",
        })
    }
}

/// Errors that can occur when interacting with the runtime.
#[derive(Error, Debug)]
pub enum Error {
    #[error("partition name invalid (use alphanumerics, '-' and '_'): {0}")]
    PartitionNameInvalid(String),
    #[error("partition missing: {0}")]
    PartitionMissing(String),
    #[error("partition {0} failed: {1}")]
    PartitionIo(String, IoError),
    #[error("blob missing: {0}/{1}")]
    BlobMissing(String, String),
    #[error("blob {op} failed: {partition}/{name}: {source}")]
    Blob {
        partition: String,
        name: String,
        op: BlobOp,
        #[source]
        source: IoError,
    },
    #[error("read past the end of blob {0}/{1}")]
    ReadPastEnd(String, String),
    #[error("offset overflow")]
    OffsetOverflow,
    #[error("region create failed: {0} error: {1}")]
    RegionCreateFailed(String, IoError),
    #[error("region missing: {0}")]
    RegionMissing(String),
    #[error("region map failed: {0} error: {1}")]
    RegionMapFailed(String, IoError),
    #[error("region remove failed: {0} error: {1}")]
    RegionRemoveFailed(String, IoError),
    #[error("region too small: {0} < {1}")]
    RegionTooSmall(usize, usize),
}

/// Named blobs grouped into partitions.
///
/// A cache directory owns one partition: a rock directory keeps a single database blob in it
/// while a ufs directory keeps one blob per object. Creating and removing blobs must be durable
/// once the call returns, so a restart never finds a removed object again.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Blob handle returned by [Storage::open].
    type Blob: Blob;

    /// Open (creating if needed) blob `name` in `partition`, returning it with its length.
    ///
    /// Handles opened separately share the durable content but not unsynced writes.
    fn open(
        &self,
        partition: &str,
        name: &[u8],
    ) -> impl Future<Output = Result<(Self::Blob, u64), Error>> + Send;

    /// Remove blob `name` from `partition`, or the whole partition if `name` is `None`.
    fn remove(
        &self,
        partition: &str,
        name: Option<&[u8]>,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Names of the blobs in `partition`, sorted.
    fn scan(&self, partition: &str) -> impl Future<Output = Result<Vec<Vec<u8>>, Error>> + Send;
}

/// Positional access to one blob.
///
/// Clones share unsynced writes.
pub trait Blob: Clone + Send + Sync + 'static {
    /// Fill `buf` with the bytes at `offset`.
    ///
    /// Fails with [Error::ReadPastEnd] if the blob ends before `buf` is full.
    fn read_at(
        &self,
        buf: impl Into<Vec<u8>> + Send,
        offset: u64,
    ) -> impl Future<Output = Result<Vec<u8>, Error>> + Send;

    /// Write `buf` at `offset`, zero-filling any gap past the current end.
    fn write_at(
        &self,
        buf: impl Into<Vec<u8>> + Send,
        offset: u64,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Truncate or zero-extend the blob to `len` bytes.
    fn resize(&self, len: u64) -> impl Future<Output = Result<(), Error>> + Send;

    /// Durably persist the blob's content and length.
    fn sync(&self) -> impl Future<Output = Result<(), Error>> + Send;
}
