use super::{
    Error, Field, FieldType, StdMeta, PREFIX_LEN, SENTINEL, STD_META_LEN, ZERO_CHECK_LEN,
};
use bytes::{Buf, BufMut, Bytes};
use shoal_utils::CacheKey;
use tracing::debug;

/// Metadata describing a stored object.
///
/// Fields are optional; encoding always writes them in the same (canonical) order: key, URL,
/// store URL, standard metadata, object size, Vary, then opaque fields in insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Header {
    pub key: Option<CacheKey>,
    pub url: Option<Bytes>,
    pub store_url: Option<Bytes>,
    pub std: Option<StdMeta>,
    pub object_size: Option<u64>,
    pub vary: Option<Bytes>,
    pub opaque: Vec<(u8, Bytes)>,
}

/// Result of a successful [decode].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decoded {
    /// Fields recovered from the buffer.
    pub header: Header,
    /// Declared length of the header (the body starts at this offset).
    pub header_len: usize,
    /// Set if decoding stopped at a field that ran past the declared length.
    pub truncated: bool,
}

impl Header {
    /// Create a header for `key`.
    pub fn new(key: CacheKey) -> Self {
        Self {
            key: Some(key),
            ..Default::default()
        }
    }

    /// Set a field (replacing any previous value of the same known type).
    pub fn push(&mut self, field: Field) {
        match field {
            Field::Key(key) => self.key = Some(key),
            Field::Url(url) => self.url = Some(url),
            Field::Vary(vary) => self.vary = Some(vary),
            Field::Std(std) => self.std = Some(std),
            Field::ObjectSize(size) => self.object_size = Some(size),
            Field::StoreUrl(url) => self.store_url = Some(url),
            Field::Opaque { tag, value } => self.opaque.push((tag, value)),
        }
    }

    /// Fields in canonical order.
    pub fn fields(&self) -> Vec<Field> {
        let mut fields = Vec::new();
        if let Some(key) = self.key {
            fields.push(Field::Key(key));
        }
        if let Some(url) = &self.url {
            fields.push(Field::Url(url.clone()));
        }
        if let Some(url) = &self.store_url {
            fields.push(Field::StoreUrl(url.clone()));
        }
        if let Some(std) = self.std {
            fields.push(Field::Std(std));
        }
        if let Some(size) = self.object_size {
            fields.push(Field::ObjectSize(size));
        }
        if let Some(vary) = &self.vary {
            fields.push(Field::Vary(vary.clone()));
        }
        for (tag, value) in &self.opaque {
            fields.push(Field::Opaque {
                tag: *tag,
                value: value.clone(),
            });
        }
        fields
    }

    /// Exact number of bytes [Header::encode] produces.
    pub fn encoded_len(&self) -> usize {
        PREFIX_LEN
            + self
                .fields()
                .iter()
                .map(|field| PREFIX_LEN + field.value_len())
                .sum::<usize>()
    }

    /// Encode the header.
    ///
    /// # Panics
    ///
    /// Panics if the encoded header would exceed `u32::MAX` bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.put_u8(SENTINEL);
        buf.put_u32_le(0); // patched below
        for field in self.fields() {
            buf.put_u8(field.tag());
            buf.put_u32_le(u32::try_from(field.value_len()).expect("field exceeds u32::MAX"));
            match field {
                Field::Key(key) => buf.put_slice(key.as_ref()),
                Field::Url(value)
                | Field::Vary(value)
                | Field::StoreUrl(value)
                | Field::Opaque { value, .. } => buf.put_slice(&value),
                Field::Std(std) => {
                    buf.put_i64_le(std.timestamp);
                    buf.put_i64_le(std.lastref);
                    buf.put_i64_le(std.expires);
                    buf.put_i64_le(std.lastmod);
                    buf.put_u64_le(std.swap_file_size);
                    buf.put_u16_le(std.refcount);
                    buf.put_u16_le(std.flags);
                }
                Field::ObjectSize(size) => buf.put_u64_le(size),
            }
        }
        let len = u32::try_from(buf.len()).expect("header exceeds u32::MAX");
        buf[1..PREFIX_LEN].copy_from_slice(&len.to_le_bytes());
        buf
    }

    /// Verify the header describes the object stored under `expected`.
    pub fn check_key(&self, expected: &CacheKey) -> Result<(), Error> {
        match self.key {
            None => Err(Error::MissingKey),
            Some(found) if found != *expected => Err(Error::KeyMismatch {
                expected: *expected,
                found,
            }),
            Some(_) => Ok(()),
        }
    }

    /// Verify a body of `found` bytes agrees with the recorded object size (if any).
    pub fn check_object_size(&self, found: u64) -> Result<(), Error> {
        match self.object_size {
            Some(expected) if expected != found => Err(Error::SizeMismatch { expected, found }),
            _ => Ok(()),
        }
    }
}

/// Decode the header at the start of `buf`.
///
/// Only the first [ZERO_CHECK_LEN] bytes are inspected to reject zero-filled (never written or
/// invalidated) buffers, so decoding stays cheap when scanning many slots.
pub fn decode(buf: &[u8]) -> Result<Decoded, Error> {
    if buf.len() < PREFIX_LEN {
        return Err(Error::TooShort(buf.len()));
    }
    if buf[..buf.len().min(ZERO_CHECK_LEN)].iter().all(|b| *b == 0) {
        return Err(Error::Zeroed);
    }

    let mut prefix = &buf[..PREFIX_LEN];
    let sentinel = prefix.get_u8();
    if sentinel != SENTINEL {
        return Err(Error::BadSentinel(sentinel));
    }
    let declared = prefix.get_u32_le();
    if (declared as usize) < PREFIX_LEN || declared as usize > buf.len() {
        return Err(Error::InvalidLength(declared));
    }

    let mut header = Header::default();
    let mut truncated = false;
    let mut cursor = &buf[PREFIX_LEN..declared as usize];
    while cursor.remaining() >= PREFIX_LEN {
        let tag = cursor.get_u8();
        let len = cursor.get_u32_le() as usize;
        if len > cursor.remaining() {
            debug!(tag, len, remaining = cursor.remaining(), "truncated header field");
            truncated = true;
            break;
        }
        let (value, rest) = cursor.split_at(len);
        cursor = rest;
        if let Some(field) = materialize(tag, value) {
            header.push(field);
        }
    }

    Ok(Decoded {
        header,
        header_len: declared as usize,
        truncated,
    })
}

fn materialize(tag: u8, mut value: &[u8]) -> Option<Field> {
    let Some(kind) = FieldType::from_u8(tag) else {
        return Some(Field::Opaque {
            tag,
            value: Bytes::copy_from_slice(value),
        });
    };
    if let Some(expected) = kind.fixed_len() {
        if value.len() != expected {
            debug!(tag, len = value.len(), expected, "skipping field with bad length");
            return None;
        }
    }
    let field = match kind {
        FieldType::Key => Field::Key(CacheKey::try_from(value).ok()?),
        FieldType::Url => Field::Url(Bytes::copy_from_slice(value)),
        FieldType::Vary => Field::Vary(Bytes::copy_from_slice(value)),
        FieldType::StoreUrl => Field::StoreUrl(Bytes::copy_from_slice(value)),
        FieldType::ObjectSize => Field::ObjectSize(value.get_u64_le()),
        FieldType::Std => {
            debug_assert_eq!(value.len(), STD_META_LEN);
            Field::Std(StdMeta {
                timestamp: value.get_i64_le(),
                lastref: value.get_i64_le(),
                expires: value.get_i64_le(),
                lastmod: value.get_i64_le(),
                swap_file_size: value.get_u64_le(),
                refcount: value.get_u16_le(),
                flags: value.get_u16_le(),
            })
        }
    };
    Some(field)
}
