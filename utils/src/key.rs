use crate::hex;
use std::{
    fmt::{Debug, Display},
    ops::Deref,
};
use thiserror::Error;

/// Errors returned when parsing a [CacheKey].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("invalid length: {0}")]
    InvalidLength(usize),
}

/// A 128-bit digest identifying one cached response variant.
///
/// Keys are derived from the request method and URL (see [CacheKey::from_request]) and never
/// change once assigned. The same bytes are embedded in every on-disk swap header so that an
/// object loaded from disk can be cross-checked against the entry that asked for it.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct CacheKey([u8; CacheKey::SIZE]);

impl CacheKey {
    /// Length of a key in bytes.
    pub const SIZE: usize = 16;

    /// Creates a key from raw digest bytes.
    pub const fn new(value: [u8; Self::SIZE]) -> Self {
        Self(value)
    }

    /// Derives the key of a request from its method and URL.
    ///
    /// The method is included so that, for example, `HEAD` and `GET` responses for the same URL
    /// are cached as distinct variants.
    pub fn from_request(method: &[u8], url: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(method);
        hasher.update(&[0]);
        hasher.update(url);
        let digest = hasher.finalize();
        let mut value = [0u8; Self::SIZE];
        value.copy_from_slice(&digest.as_bytes()[..Self::SIZE]);
        Self(value)
    }

    /// Returns the home bucket of this key in a table of `buckets` entries.
    ///
    /// # Panics
    ///
    /// Panics if `buckets` is zero.
    pub fn anchor(&self, buckets: u32) -> u32 {
        assert!(buckets > 0, "table must have at least one bucket");
        let mut head = [0u8; 4];
        head.copy_from_slice(&self.0[..4]);
        u32::from_le_bytes(head) % buckets
    }

    /// Returns the key as a byte array.
    pub const fn to_bytes(&self) -> [u8; Self::SIZE] {
        self.0
    }
}

impl TryFrom<&[u8]> for CacheKey {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let array: [u8; Self::SIZE] = value
            .try_into()
            .map_err(|_| Error::InvalidLength(value.len()))?;
        Ok(Self(array))
    }
}

impl From<[u8; CacheKey::SIZE]> for CacheKey {
    fn from(value: [u8; CacheKey::SIZE]) -> Self {
        Self(value)
    }
}

impl AsRef<[u8]> for CacheKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Deref for CacheKey {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex(&self.0))
    }
}

impl Debug for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CacheKey({})", hex(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn test_from_request() {
        let get = CacheKey::from_request(b"GET", b"http://example.com/");
        let again = CacheKey::from_request(b"GET", b"http://example.com/");
        let head = CacheKey::from_request(b"HEAD", b"http://example.com/");
        let other = CacheKey::from_request(b"GET", b"http://example.com/a");
        assert_eq!(get, again);
        assert_ne!(get, head);
        assert_ne!(get, other);

        // The separator prevents method/URL boundary ambiguity
        let a = CacheKey::from_request(b"GETx", b"y");
        let b = CacheKey::from_request(b"GET", b"xy");
        assert_ne!(a, b);
    }

    #[test]
    fn test_try_from() {
        let bytes = [7u8; CacheKey::SIZE];
        let key = CacheKey::try_from(&bytes[..]).unwrap();
        assert_eq!(key.to_bytes(), bytes);
        assert_eq!(key.as_ref(), &bytes[..]);

        assert_eq!(
            CacheKey::try_from(&bytes[..15]),
            Err(Error::InvalidLength(15))
        );
        assert_eq!(CacheKey::try_from(&[0u8; 17][..]), Err(Error::InvalidLength(17)));
    }

    #[test]
    fn test_display() {
        let mut bytes = [0u8; CacheKey::SIZE];
        bytes[0] = 0xab;
        bytes[15] = 0x01;
        let key = CacheKey::new(bytes);
        assert_eq!(key.to_string(), "ab000000000000000000000000000001");
        assert_eq!(
            format!("{key:?}"),
            "CacheKey(ab000000000000000000000000000001)"
        );
    }

    #[test]
    fn test_anchor_in_range() {
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..1_000 {
            let key = CacheKey::new(rng.gen());
            let buckets = rng.gen_range(1..10_000);
            assert!(key.anchor(buckets) < buckets);
        }
    }
}
