//! Typed metadata stored in front of every object persisted to disk.
//!
//! Each on-disk object starts with a [Header] describing it (cache key, URL, timestamps and
//! sizes). A reader inspecting a slot on disk has no other way to know what the slot holds, so
//! [decode] treats its input as untrusted: every length is checked before it is used and
//! malformed input is reported as an [Error] rather than a panic.
//!
//! # Format
//!
//! ```text
//! +----------+----------------+--------+----------+---------+--------+----------+---------+---
//! | Sentinel | Header length  | Type 1 | Length 1 | Value 1 | Type 2 | Length 2 | Value 2 |...
//! |   (u8)   |     (u32)      |  (u8)  |  (u32)   |         |  (u8)  |  (u32)   |         |
//! +----------+----------------+--------+----------+---------+--------+----------+---------+---
//! ```
//!
//! All integers are little-endian. The header length covers the whole header (sentinel and
//! length field included), so the object body starts right after it.
//!
//! | Type | Field                   | Value                                   |
//! |------|-------------------------|-----------------------------------------|
//! | 3    | [Field::Key]            | 16-byte [CacheKey]                      |
//! | 4    | [Field::Url]            | request URL                             |
//! | 8    | [Field::Vary]           | Vary header names and values            |
//! | 9    | [Field::Std]            | 44-byte [StdMeta]                       |
//! | 10   | [Field::ObjectSize]     | u64 size of the body                    |
//! | 11   | [Field::StoreUrl]       | URL the object was stored under         |
//!
//! Any other type is preserved as [Field::Opaque], so headers written by newer versions survive a
//! decode and re-encode. A recognized type carrying a value of the wrong length is skipped.
//!
//! # Truncation
//!
//! A field whose declared length runs past the declared header length ends decoding. The fields
//! read before it are returned and [Decoded::truncated] is set so callers can decide whether a
//! partial header is good enough.

use bytes::Bytes;
use shoal_utils::CacheKey;
use thiserror::Error;

mod header;
pub use header::{decode, Decoded, Header};

/// First byte of every header.
pub const SENTINEL: u8 = 0x03;

/// Length of the sentinel and header length prefix (and of each field's type and length prefix).
pub const PREFIX_LEN: usize = 5;

/// Number of leading bytes checked when rejecting zero-filled buffers.
pub const ZERO_CHECK_LEN: usize = 10;

/// Length of an encoded [StdMeta].
pub const STD_META_LEN: usize = 44;

/// Errors that can occur when decoding or checking a [Header].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("buffer too short: {0} bytes")]
    TooShort(usize),
    #[error("buffer starts with zeros")]
    Zeroed,
    #[error("bad sentinel: {0:#04x}")]
    BadSentinel(u8),
    #[error("invalid header length: {0}")]
    InvalidLength(u32),
    #[error("missing key")]
    MissingKey,
    #[error("key mismatch: expected {expected}, found {found}")]
    KeyMismatch { expected: CacheKey, found: CacheKey },
    #[error("object size mismatch: header says {expected}, found {found}")]
    SizeMismatch { expected: u64, found: u64 },
}

/// Numeric type of a header field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Key = 3,
    Url = 4,
    Vary = 8,
    Std = 9,
    ObjectSize = 10,
    StoreUrl = 11,
}

impl FieldType {
    /// Recognize a field type.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            3 => Some(Self::Key),
            4 => Some(Self::Url),
            8 => Some(Self::Vary),
            9 => Some(Self::Std),
            10 => Some(Self::ObjectSize),
            11 => Some(Self::StoreUrl),
            _ => None,
        }
    }

    /// Exact value length required by the type, if it has one.
    pub fn fixed_len(self) -> Option<usize> {
        match self {
            Self::Key => Some(CacheKey::SIZE),
            Self::Std => Some(STD_META_LEN),
            Self::ObjectSize => Some(8),
            Self::Url | Self::Vary | Self::StoreUrl => None,
        }
    }
}

/// Timestamps, sizes and flags of a stored object.
///
/// Timestamps are seconds since the Unix epoch (negative values mean "unknown").
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StdMeta {
    pub timestamp: i64,
    pub lastref: i64,
    pub expires: i64,
    pub lastmod: i64,
    /// Total bytes on disk (header plus body).
    pub swap_file_size: u64,
    pub refcount: u16,
    pub flags: u16,
}

/// A single header field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Field {
    Key(CacheKey),
    Url(Bytes),
    Vary(Bytes),
    Std(StdMeta),
    ObjectSize(u64),
    StoreUrl(Bytes),
    /// A field of a type this version does not interpret.
    Opaque { tag: u8, value: Bytes },
}

impl Field {
    /// Numeric type written for this field.
    pub fn tag(&self) -> u8 {
        match self {
            Field::Key(_) => FieldType::Key as u8,
            Field::Url(_) => FieldType::Url as u8,
            Field::Vary(_) => FieldType::Vary as u8,
            Field::Std(_) => FieldType::Std as u8,
            Field::ObjectSize(_) => FieldType::ObjectSize as u8,
            Field::StoreUrl(_) => FieldType::StoreUrl as u8,
            Field::Opaque { tag, .. } => *tag,
        }
    }

    /// Length of the encoded value (without the type and length prefix).
    pub fn value_len(&self) -> usize {
        match self {
            Field::Key(_) => CacheKey::SIZE,
            Field::Url(value) | Field::Vary(value) | Field::StoreUrl(value) => value.len(),
            Field::Std(_) => STD_META_LEN,
            Field::ObjectSize(_) => 8,
            Field::Opaque { value, .. } => value.len(),
        }
    }
}
