//! Share in-flight objects between processes and persist cached objects to disk.
//!
//! # Status
//!
//! `shoal-storage` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

pub mod pages;
pub mod swapdir;
pub mod swapmeta;
pub mod transients;
