//! Per-content compression, applied before encryption.
//!
//! The chosen codec is recorded as a compression header id in the pack
//! footer and the index entry, never inside the payload itself, so
//! compression statistics are available without touching pack blobs.

use anyhow::{bail, Error};

/// Stored uncompressed.
pub const COMPRESSION_NONE: u32 = 0;

/// Stored zstd compressed (level 1).
pub const COMPRESSION_ZSTD: u32 = 1;

const ZSTD_LEVEL: i32 = 1;

/// Compress `data` if that actually shrinks it. Returns the payload to
/// store and the compression header id describing it.
pub fn compress(data: &[u8]) -> Result<(Vec<u8>, u32), Error> {
    let compressed = zstd::bulk::compress(data, ZSTD_LEVEL)?;
    if compressed.len() < data.len() {
        Ok((compressed, COMPRESSION_ZSTD))
    } else {
        Ok((data.to_vec(), COMPRESSION_NONE))
    }
}

/// Undo [compress] according to the recorded header id.
pub fn decompress(data: &[u8], compression: u32) -> Result<Vec<u8>, Error> {
    match compression {
        COMPRESSION_NONE => Ok(data.to_vec()),
        COMPRESSION_ZSTD => {
            let mut reader = data;
            Ok(zstd::stream::decode_all(&mut reader)?)
        }
        other => bail!("unknown compression header id {}", other),
    }
}
