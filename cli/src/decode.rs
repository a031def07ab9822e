//! Print the swap header found in a file.

use crate::Error;
use shoal_storage::swapmeta::{decode as decode_header, Decoded};
use shoal_utils::hex;
use std::path::Path;
use tracing::info;

pub const CMD: &str = "decode";

/// Bytes read when looking for a header.
const READ_LEN: usize = 64 * 1024;

/// Decode the header starting at `offset` in `path`.
pub async fn decode(path: &Path, offset: u64) -> Result<(), Error> {
    let data = tokio::fs::read(path).await?;
    let start = usize::try_from(offset)
        .ok()
        .filter(|start| *start <= data.len())
        .ok_or_else(|| Error::InvalidArgument(format!("offset {offset} beyond end of file")))?;
    let end = data.len().min(start.saturating_add(READ_LEN));
    let decoded = decode_header(&data[start..end])?;
    info!(path = %path.display(), offset, header_len = decoded.header_len, "decoded header");
    print!("{}", describe(&decoded));
    Ok(())
}

fn describe(decoded: &Decoded) -> String {
    let header = &decoded.header;
    let mut out = format!("header length: {}\n", decoded.header_len);
    if decoded.truncated {
        out.push_str("truncated: true\n");
    }
    if let Some(key) = &header.key {
        out.push_str(&format!("key: {key}\n"));
    }
    if let Some(url) = &header.url {
        out.push_str(&format!("url: {}\n", String::from_utf8_lossy(url)));
    }
    if let Some(url) = &header.store_url {
        out.push_str(&format!("store url: {}\n", String::from_utf8_lossy(url)));
    }
    if let Some(std) = &header.std {
        out.push_str(&format!(
            "timestamp: {}\nlastref: {}\nexpires: {}\nlastmod: {}\nswap file size: {}\nrefcount: {}\nflags: {:#06x}\n",
            std.timestamp,
            std.lastref,
            std.expires,
            std.lastmod,
            std.swap_file_size,
            std.refcount,
            std.flags
        ));
    }
    if let Some(size) = header.object_size {
        out.push_str(&format!("object size: {size}\n"));
    }
    if let Some(vary) = &header.vary {
        out.push_str(&format!("vary: {}\n", String::from_utf8_lossy(vary)));
    }
    for (tag, value) in &header.opaque {
        out.push_str(&format!("field {tag}: {}\n", hex(value)));
    }
    out
}
