//! A directory stored in a single database blob of fixed-size slots.
//!
//! # Format
//!
//! ```text
//! +---------------------------+----------+----------+-----+------------+
//! | Database header (16 KiB)  |  Slot 0  |  Slot 1  | ... |  Slot N-1  |
//! +---------------------------+----------+----------+-----+------------+
//!
//! Database header:
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! |  Magic (8)                    |  Version (u32)|  Slot size (u64)              |
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! |  Slots (u32)  |  CRC32 (u32)  |  Zero padding ...
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//!
//! Slot: Swap header | Body | Unused
//! ```
//!
//! Integers are little-endian and the checksum covers everything before it. Slot `n` starts at
//! byte `HEADER_SIZE + n * slot_size`. A slot whose first bytes are zero is empty, so freeing a
//! slot only requires zeroing its prefix.

use super::{dir::Layout, Error};
use crate::swapmeta::ZERO_CHECK_LEN;
use bytes::{Buf, BufMut};
use shoal_runtime::{Blob, Storage};
use std::{future::Future, num::NonZeroU64};
use tracing::info;

/// Bytes reserved at the start of the database for its header.
pub const HEADER_SIZE: u64 = 16 * 1024;

const MAGIC: &[u8; 8] = b"SHOALRCK";
const VERSION: u32 = 1;
const FIELDS_LEN: usize = 8 + 4 + 8 + 4;
const DB_NAME: &[u8] = b"rock";

/// Smallest slot size accepted.
pub const MIN_SLOT_SIZE: u64 = 512;

/// Slots of a single database blob.
pub struct Rock<S: Storage> {
    blob: S::Blob,
    slot_size: u64,
    slots: u32,
}

fn encode_header(slot_size: u64, slots: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE as usize);
    buf.put_slice(MAGIC);
    buf.put_u32_le(VERSION);
    buf.put_u64_le(slot_size);
    buf.put_u32_le(slots);
    let crc = crc32fast::hash(&buf);
    buf.put_u32_le(crc);
    buf.resize(HEADER_SIZE as usize, 0);
    buf
}

fn decode_header(buf: &[u8]) -> Result<(u64, u32), Error> {
    if buf.len() < FIELDS_LEN + 4 || &buf[..MAGIC.len()] != MAGIC {
        return Err(Error::Corrupt("bad magic"));
    }
    let (fields, mut rest) = buf.split_at(FIELDS_LEN);
    if crc32fast::hash(fields) != rest.get_u32_le() {
        return Err(Error::Corrupt("checksum mismatch"));
    }
    let mut fields = &fields[MAGIC.len()..];
    if fields.get_u32_le() != VERSION {
        return Err(Error::Corrupt("unsupported version"));
    }
    let slot_size = fields.get_u64_le();
    let slots = fields.get_u32_le();
    Ok((slot_size, slots))
}

impl<S: Storage> Rock<S> {
    /// Open the database in `partition`, creating it if it does not exist.
    ///
    /// An existing database must have the geometry implied by `max_size` and `slot_size`.
    pub async fn init(
        storage: S,
        partition: &str,
        max_size: NonZeroU64,
        slot_size: NonZeroU64,
    ) -> Result<Self, Error> {
        let slot_size = slot_size.get();
        if slot_size < MIN_SLOT_SIZE {
            return Err(Error::InvalidConfig("slot size must be at least 512 bytes"));
        }
        let slots = max_size.get() / slot_size;
        if slots == 0 || slots > u32::MAX as u64 {
            return Err(Error::InvalidConfig(
                "max size must hold between 1 and 2^32-1 slots",
            ));
        }
        let slots = slots as u32;
        let len = HEADER_SIZE + slots as u64 * slot_size;

        let (blob, stored) = storage.open(partition, DB_NAME).await?;
        if stored == 0 {
            blob.write_at(encode_header(slot_size, slots), 0).await?;
            blob.resize(len).await?;
            blob.sync().await?;
            info!(partition, slots, slot_size, "created rock database");
        } else {
            if stored < HEADER_SIZE {
                return Err(Error::Corrupt("database shorter than its header"));
            }
            let buf = blob.read_at(vec![0; FIELDS_LEN + 4], 0).await?;
            let (stored_slot_size, stored_slots) = decode_header(&buf)?;
            if stored_slot_size != slot_size || stored_slots != slots {
                return Err(Error::GeometryMismatch {
                    stored_slots,
                    stored_slot_size,
                });
            }
            if stored != len {
                blob.resize(len).await?;
            }
            info!(partition, slots, slot_size, "opened rock database");
        }
        Ok(Self {
            blob,
            slot_size,
            slots,
        })
    }

    /// Size of each slot.
    pub fn slot_size(&self) -> u64 {
        self.slot_size
    }

    fn offset(&self, fileno: u32, offset: u64) -> u64 {
        debug_assert!(fileno < self.slots);
        HEADER_SIZE + fileno as u64 * self.slot_size + offset
    }
}

impl<S: Storage> Layout for Rock<S> {
    fn slots(&self) -> u32 {
        self.slots
    }

    fn capacity(&self) -> u64 {
        self.slot_size
    }

    fn exact(&self) -> bool {
        false
    }

    fn scan(&self) -> impl Future<Output = Result<Vec<(u32, u64)>, Error>> + Send {
        let slots = (0..self.slots).map(|fileno| (fileno, self.slot_size)).collect();
        async move { Ok(slots) }
    }

    async fn read(&self, fileno: u32, offset: u64, len: usize) -> Result<Vec<u8>, Error> {
        Ok(self
            .blob
            .read_at(vec![0; len], self.offset(fileno, offset))
            .await?)
    }

    async fn write(&self, fileno: u32, offset: u64, data: Vec<u8>) -> Result<(), Error> {
        Ok(self.blob.write_at(data, self.offset(fileno, offset)).await?)
    }

    async fn invalidate(&self, fileno: u32) -> Result<(), Error> {
        Ok(self
            .blob
            .write_at(vec![0; ZERO_CHECK_LEN], self.offset(fileno, 0))
            .await?)
    }

    async fn seal(&self, _fileno: u32, _len: u64) -> Result<(), Error> {
        Ok(self.blob.sync().await?)
    }

    async fn sync(&self) -> Result<(), Error> {
        Ok(self.blob.sync().await?)
    }
}
