//! Binary layout of index blobs.
//!
//! An index blob is a sorted batch of entries with a covered-id-range
//! header and a CRC over the body. Pack names are stored once in a
//! table and referenced by position, keeping entries fixed size.
//!
//! Version 1 lacks the original length and compression header id;
//! readers fill them with the stored length and "none" so statistics
//! stay approximately right for old blobs.

use anyhow::{bail, format_err, Error};

use hbk_api_types::{BlobId, ContentId};

use crate::compression::COMPRESSION_NONE;
use crate::index::IndexEntry;

// WARNING: PLEASE DO NOT MODIFY THOSE MAGIC VALUES

pub const INDEX_BLOB_MAGIC_1_0: [u8; 8] = [201, 14, 222, 173, 97, 60, 12, 154];

pub const INDEX_VERSION_1: u32 = 1;
pub const INDEX_VERSION_2: u32 = 2;

/// Pack-table sentinel for tombstones.
const PACK_NONE: u32 = u32::MAX;

const HEADER_SIZE: usize = 8 + 4 + 4 + 4 + 33 + 33 + 4;

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, count: usize) -> Result<&'a [u8], Error> {
        if self.pos + count > self.data.len() {
            bail!("truncated index blob");
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_le_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn read_i64(&mut self) -> Result<i64, Error> {
        Ok(i64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn read_content_id(&mut self) -> Result<ContentId, Error> {
        let prefix = self.read_u8()?;
        let mut digest = [0u8; 32];
        digest.copy_from_slice(self.bytes(32)?);
        ContentId::new(prefix, digest)
    }
}

fn push_content_id(out: &mut Vec<u8>, id: &ContentId) {
    out.push(id.prefix());
    out.extend_from_slice(id.digest());
}

/// Serialize `entries` (sorted by content id) into an index blob body.
pub fn encode_index_blob(entries: &[IndexEntry], version: u32) -> Result<Vec<u8>, Error> {
    if version != INDEX_VERSION_1 && version != INDEX_VERSION_2 {
        bail!("unsupported index version {}", version);
    }
    for window in entries.windows(2) {
        if window[0].content >= window[1].content {
            bail!("index entries are not sorted");
        }
    }

    // pack name table, first reference wins the slot
    let mut pack_names: Vec<&BlobId> = Vec::new();
    let mut pack_index = std::collections::HashMap::new();
    for entry in entries {
        if let Some(ref pack) = entry.pack {
            pack_index.entry(pack.as_str()).or_insert_with(|| {
                pack_names.push(pack);
                (pack_names.len() - 1) as u32
            });
        }
    }

    let mut body = Vec::new();
    for pack in &pack_names {
        let name = pack.as_str().as_bytes();
        if name.len() > u16::MAX as usize {
            bail!("pack blob name too long");
        }
        body.extend_from_slice(&(name.len() as u16).to_le_bytes());
        body.extend_from_slice(name);
    }

    for entry in entries {
        push_content_id(&mut body, &entry.content);
        let pack_ref = match entry.pack {
            Some(ref pack) => pack_index[pack.as_str()],
            None => PACK_NONE,
        };
        body.extend_from_slice(&pack_ref.to_le_bytes());
        body.extend_from_slice(&entry.offset.to_le_bytes());
        body.extend_from_slice(&entry.stored_length.to_le_bytes());
        if version >= INDEX_VERSION_2 {
            body.extend_from_slice(&entry.original_length.to_le_bytes());
            body.extend_from_slice(&entry.compression.to_le_bytes());
        }
        body.push(entry.flags);
        body.push(entry.format_version);
        body.extend_from_slice(&entry.timestamp.to_le_bytes());
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&body);
    let crc = hasher.finalize();

    let (lo, hi) = match (entries.first(), entries.last()) {
        (Some(first), Some(last)) => (first.content, last.content),
        _ => (ContentId::data([0u8; 32]), ContentId::data([0u8; 32])),
    };

    let mut data = Vec::with_capacity(HEADER_SIZE + body.len());
    data.extend_from_slice(&INDEX_BLOB_MAGIC_1_0);
    data.extend_from_slice(&version.to_le_bytes());
    data.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    data.extend_from_slice(&(pack_names.len() as u32).to_le_bytes());
    push_content_id(&mut data, &lo);
    push_content_id(&mut data, &hi);
    data.extend_from_slice(&crc.to_le_bytes());
    data.extend_from_slice(&body);

    Ok(data)
}

/// Parse an index blob, verifying magic, version and CRC.
pub fn decode_index_blob(data: &[u8]) -> Result<Vec<IndexEntry>, Error> {
    let mut reader = Reader::new(data);

    let magic = reader.bytes(8)?;
    if magic != INDEX_BLOB_MAGIC_1_0 {
        bail!("got unknown index blob magic number");
    }
    let version = reader.read_u32()?;
    if version != INDEX_VERSION_1 && version != INDEX_VERSION_2 {
        bail!("unsupported index version {}", version);
    }
    let entry_count = reader.read_u32()? as usize;
    let pack_count = reader.read_u32()? as usize;
    let _lo = reader.read_content_id()?;
    let _hi = reader.read_content_id()?;
    let crc = reader.read_u32()?;

    let body = &data[HEADER_SIZE..];
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    if hasher.finalize() != crc {
        bail!("index blob has wrong CRC checksum");
    }

    let mut pack_names = Vec::with_capacity(pack_count);
    for _ in 0..pack_count {
        let len = reader.read_u16()? as usize;
        let name = reader.bytes(len)?;
        let name = std::str::from_utf8(name)
            .map_err(|_| format_err!("invalid pack name in index blob"))?;
        pack_names.push(BlobId::from(name));
    }

    let mut entries = Vec::with_capacity(entry_count);
    for _ in 0..entry_count {
        let content = reader.read_content_id()?;
        let pack_ref = reader.read_u32()?;
        let offset = reader.read_u32()?;
        let stored_length = reader.read_u32()?;
        let (original_length, compression) = if version >= INDEX_VERSION_2 {
            (reader.read_u32()?, reader.read_u32()?)
        } else {
            (stored_length, COMPRESSION_NONE)
        };
        let flags = reader.read_u8()?;
        let format_version = reader.read_u8()?;
        let timestamp = reader.read_i64()?;

        let pack = if pack_ref == PACK_NONE {
            None
        } else {
            let pack = pack_names
                .get(pack_ref as usize)
                .ok_or_else(|| format_err!("invalid pack reference {} in index blob", pack_ref))?;
            Some(pack.clone())
        };

        entries.push(IndexEntry {
            content,
            pack,
            offset,
            stored_length,
            original_length,
            compression,
            timestamp,
            flags,
            format_version,
        });
    }

    Ok(entries)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::index::{ENTRY_FLAG_DELETED, ENTRY_FORMAT_VERSION};

    fn sample_entries() -> Vec<IndexEntry> {
        vec![
            IndexEntry {
                content: ContentId::data([1; 32]),
                pack: Some(BlobId::from("pdeadbeef00000001")),
                offset: 0,
                stored_length: 100,
                original_length: 200,
                compression: 1,
                timestamp: 1000,
                flags: 0,
                format_version: ENTRY_FORMAT_VERSION,
            },
            IndexEntry {
                content: ContentId::data([2; 32]),
                pack: Some(BlobId::from("pdeadbeef00000001")),
                offset: 100,
                stored_length: 50,
                original_length: 50,
                compression: 0,
                timestamp: 1001,
                flags: 0,
                format_version: ENTRY_FORMAT_VERSION,
            },
            IndexEntry {
                content: ContentId::data([3; 32]),
                pack: None,
                offset: 0,
                stored_length: 0,
                original_length: 0,
                compression: 0,
                timestamp: 1002,
                flags: ENTRY_FLAG_DELETED,
                format_version: ENTRY_FORMAT_VERSION,
            },
        ]
    }

    #[test]
    fn v2_roundtrip() -> Result<(), Error> {
        let entries = sample_entries();
        let data = encode_index_blob(&entries, INDEX_VERSION_2)?;
        let decoded = decode_index_blob(&data)?;
        assert_eq!(decoded, entries);
        Ok(())
    }

    #[test]
    fn v1_drops_compression_info() -> Result<(), Error> {
        let entries = sample_entries();
        let data = encode_index_blob(&entries, INDEX_VERSION_1)?;
        let decoded = decode_index_blob(&data)?;
        assert_eq!(decoded.len(), entries.len());
        // v1 cannot store the original length
        assert_eq!(decoded[0].original_length, 100);
        assert_eq!(decoded[0].compression, COMPRESSION_NONE);
        assert_eq!(decoded[1].content, entries[1].content);
        Ok(())
    }

    #[test]
    fn corruption_detected() -> Result<(), Error> {
        let entries = sample_entries();
        let mut data = encode_index_blob(&entries, INDEX_VERSION_2)?;

        let last = data.len() - 1;
        data[last] ^= 0xff;
        assert!(decode_index_blob(&data).is_err());

        data[last] ^= 0xff;
        data[0] ^= 0xff;
        assert!(decode_index_blob(&data).is_err());
        Ok(())
    }

    #[test]
    fn unsorted_entries_rejected() {
        let mut entries = sample_entries();
        entries.swap(0, 1);
        assert!(encode_index_blob(&entries, INDEX_VERSION_2).is_err());
    }

    #[test]
    fn empty_blob_roundtrip() -> Result<(), Error> {
        let data = encode_index_blob(&[], INDEX_VERSION_2)?;
        assert!(decode_index_blob(&data)?.is_empty());
        Ok(())
    }
}
