//! The pack builder: buffers encrypted payloads into size-bounded pack
//! blobs and emits the session's index blob on flush.
//!
//! Publication order is packs first, index blob last. A crash between
//! the two leaves unreferenced packs (cleaned up by maintenance after
//! the safety window) but never an index blob pointing at missing
//! packs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Serialize};

use hbk_api_types::{
    BlobId, BlobMeta, ContentId, INDEX_BLOB_PREFIX, PACK_DATA_BLOB_PREFIX,
    PACK_METADATA_BLOB_PREFIX, SESSION_BLOB_PREFIX,
};
use hbk_tools::crypt_config::CryptConfig;
use hbk_tools::task::TaskContext;
use hbk_tools::{task_debug, task_log};

use crate::blob_store::{BlobStore, PutOptions};
use crate::compression;
use crate::index::{Generation, IndexEntry, ENTRY_FLAG_DELETED, ENTRY_FLAG_SHORT_DROP,
    ENTRY_FORMAT_VERSION};
use crate::index_blob::{encode_index_blob, INDEX_VERSION_2};

/// Default upper bound for pack blob sizes.
pub const DEFAULT_MAX_PACK_SIZE: u64 = 20 * 1024 * 1024;

const MIN_MAX_PACK_SIZE: u64 = 10 * 1024 * 1024;
const MAX_MAX_PACK_SIZE: u64 = 120 * 1024 * 1024;

/// Clamp a configured pack size bound into the supported window.
pub fn clamp_max_pack_size(size: u64) -> u64 {
    size.clamp(MIN_MAX_PACK_SIZE, MAX_MAX_PACK_SIZE)
}

// WARNING: PLEASE DO NOT MODIFY THOSE MAGIC VALUES

pub const PACK_FOOTER_MAGIC_1_0: [u8; 8] = [88, 220, 41, 175, 204, 59, 138, 6];

pub const PACK_FOOTER_VERSION: u32 = 1;

// magic 8 || version 4 || entry_count 4 || table_len 4 || crc 4
const TRAILER_SIZE: usize = 24;
// prefix 1 || digest 32 || offset 4 || stored 4 || original 4 || compression 4
const FOOTER_ENTRY_SIZE: usize = 49;
const AUTH_TAG_SIZE: usize = 32;

/// One footer record locating a content inside its pack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FooterEntry {
    pub content: ContentId,
    pub offset: u32,
    pub stored_length: u32,
    pub original_length: u32,
    pub compression: u32,
}

/// Serialize the footer: entry table, HMAC over the table, trailer.
pub fn encode_pack_footer(crypt: &CryptConfig, entries: &[FooterEntry]) -> Vec<u8> {
    let mut table = Vec::with_capacity(entries.len() * FOOTER_ENTRY_SIZE);
    for entry in entries {
        table.push(entry.content.prefix());
        table.extend_from_slice(entry.content.digest());
        table.extend_from_slice(&entry.offset.to_le_bytes());
        table.extend_from_slice(&entry.stored_length.to_le_bytes());
        table.extend_from_slice(&entry.original_length.to_le_bytes());
        table.extend_from_slice(&entry.compression.to_le_bytes());
    }

    let auth_tag = crypt.compute_auth_tag(&table);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&table);
    let crc = hasher.finalize();

    let mut footer = table;
    footer.extend_from_slice(&auth_tag);
    footer.extend_from_slice(&PACK_FOOTER_MAGIC_1_0);
    footer.extend_from_slice(&PACK_FOOTER_VERSION.to_le_bytes());
    footer.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    footer.extend_from_slice(&(((entries.len()) * FOOTER_ENTRY_SIZE) as u32).to_le_bytes());
    footer.extend_from_slice(&crc.to_le_bytes());
    footer
}

fn parse_footer_table(table: &[u8], entry_count: usize) -> Result<Vec<FooterEntry>, Error> {
    let mut entries = Vec::with_capacity(entry_count);
    for chunk in table.chunks_exact(FOOTER_ENTRY_SIZE) {
        let prefix = chunk[0];
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&chunk[1..33]);
        entries.push(FooterEntry {
            content: ContentId::new(prefix, digest)?,
            offset: u32::from_le_bytes(chunk[33..37].try_into().unwrap()),
            stored_length: u32::from_le_bytes(chunk[37..41].try_into().unwrap()),
            original_length: u32::from_le_bytes(chunk[41..45].try_into().unwrap()),
            compression: u32::from_le_bytes(chunk[45..49].try_into().unwrap()),
        });
    }
    if entries.len() != entry_count {
        bail!("pack footer entry count mismatch");
    }
    Ok(entries)
}

/// Read and authenticate the footer of a stored pack blob.
///
/// The footer is addressable from the blob tail alone, so indexes can
/// be rebuilt from pack bodies without any other state.
pub fn read_pack_footer(
    store: &dyn BlobStore,
    crypt: &CryptConfig,
    meta: &BlobMeta,
) -> Result<Vec<FooterEntry>, Error> {
    if meta.length < TRAILER_SIZE as u64 {
        bail!("pack blob '{}' too short for a footer", meta.id);
    }
    let trailer = store.get_blob(
        &meta.id,
        meta.length - TRAILER_SIZE as u64,
        Some(TRAILER_SIZE as u64),
    )?;

    if trailer[0..8] != PACK_FOOTER_MAGIC_1_0 {
        bail!("pack blob '{}' has no valid footer magic", meta.id);
    }
    let version = u32::from_le_bytes(trailer[8..12].try_into().unwrap());
    if version != PACK_FOOTER_VERSION {
        bail!("pack blob '{}' has unsupported footer version {}", meta.id, version);
    }
    let entry_count = u32::from_le_bytes(trailer[12..16].try_into().unwrap()) as usize;
    let table_len = u32::from_le_bytes(trailer[16..20].try_into().unwrap()) as usize;
    let crc = u32::from_le_bytes(trailer[20..24].try_into().unwrap());

    if table_len != entry_count * FOOTER_ENTRY_SIZE {
        bail!("pack blob '{}' has a truncated footer", meta.id);
    }
    let footer_size = (table_len + AUTH_TAG_SIZE + TRAILER_SIZE) as u64;
    if meta.length < footer_size {
        bail!("pack blob '{}' has a truncated footer", meta.id);
    }

    let body = store.get_blob(
        &meta.id,
        meta.length - footer_size,
        Some((table_len + AUTH_TAG_SIZE) as u64),
    )?;
    let (table, auth_tag) = body.split_at(table_len);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(table);
    if hasher.finalize() != crc {
        bail!("pack blob '{}' footer has wrong CRC checksum", meta.id);
    }
    if !openssl::memcmp::eq(&crypt.compute_auth_tag(table), auth_tag) {
        bail!("pack blob '{}' footer failed authentication", meta.id);
    }

    parse_footer_table(table, entry_count)
}

/// Chooses the name of the next index blob.
pub trait IndexNamer: Send + Sync {
    fn next_index_blob_id(&self) -> Result<BlobId, Error>;
}

/// Flat `n<random>` index names, used without the epoch manager.
pub struct LegacyIndexNamer;

impl IndexNamer for LegacyIndexNamer {
    fn next_index_blob_id(&self) -> Result<BlobId, Error> {
        Ok(BlobId::from(format!(
            "{}{}",
            INDEX_BLOB_PREFIX,
            uuid::Uuid::new_v4().simple()
        )))
    }
}

/// Marker blob recording an intentionally abandoned session, so
/// maintenance can tell an abort from a crash.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct SessionMarker {
    session: String,
    started: i64,
    aborted: i64,
}

struct OpenPack {
    id: BlobId,
    buffer: Vec<u8>,
    footer: Vec<FooterEntry>,
}

/// Assembles contents into pack blobs for one write session.
///
/// Data and metadata contents go into distinct packs; the session uuid
/// is embedded in every pack name so concurrent writers never collide.
pub struct PackBuilder {
    store: Arc<dyn BlobStore>,
    crypt: Arc<CryptConfig>,
    namer: Arc<dyn IndexNamer>,
    max_pack_size: u64,
    index_version: u32,
    session: String,
    started: i64,
    counter: u32,
    open_packs: HashMap<bool, OpenPack>,
    pending: BTreeMap<ContentId, IndexEntry>,
}

/// Associated data binding a payload to its content id.
pub fn content_ad(id: &ContentId) -> Vec<u8> {
    id.to_string().into_bytes()
}

impl PackBuilder {
    pub fn new(
        store: Arc<dyn BlobStore>,
        crypt: Arc<CryptConfig>,
        namer: Arc<dyn IndexNamer>,
        max_pack_size: u64,
    ) -> Self {
        Self {
            store,
            crypt,
            namer,
            max_pack_size: clamp_max_pack_size(max_pack_size),
            index_version: INDEX_VERSION_2,
            session: uuid::Uuid::new_v4().simple().to_string(),
            started: hbk_tools::time::epoch_i64(),
            counter: 0,
            open_packs: HashMap::new(),
            pending: BTreeMap::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session
    }

    pub fn max_pack_size(&self) -> u64 {
        self.max_pack_size
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// The session's own entry for `id`, if any (read-your-writes).
    pub fn pending_entry(&self, id: &ContentId) -> Option<IndexEntry> {
        self.pending.get(id).cloned()
    }

    /// Ciphertext of a pending entry whose pack is still open. Sealed
    /// packs are already uploaded and read through the store.
    pub fn read_pending_payload(&self, entry: &IndexEntry) -> Option<Vec<u8>> {
        let pack = entry.pack.as_ref()?;
        let open = self
            .open_packs
            .values()
            .find(|open| open.id == *pack)?;
        let start = entry.offset as usize;
        let end = start + entry.stored_length as usize;
        open.buffer.get(start..end).map(|slice| slice.to_vec())
    }

    fn next_pack_id(&mut self, metadata: bool) -> BlobId {
        let prefix = if metadata {
            PACK_METADATA_BLOB_PREFIX
        } else {
            PACK_DATA_BLOB_PREFIX
        };
        self.counter += 1;
        BlobId::from(format!("{}{}{:08x}", prefix, self.session, self.counter))
    }

    /// Compress, encrypt and buffer one content.
    ///
    /// Deterministic: adding the same id again returns the existing
    /// session entry without touching the buffers, unless `force` is
    /// set (used by pack rewriting, which must produce a fresh copy).
    ///
    /// `min_timestamp` raises the entry timestamp above an existing
    /// winner, so the new entry supersedes it even within the same
    /// second.
    pub fn add_entry(
        &mut self,
        id: ContentId,
        plaintext: &[u8],
        flags: u8,
        force: bool,
        min_timestamp: i64,
        task: &dyn TaskContext,
    ) -> Result<IndexEntry, Error> {
        if !force {
            if let Some(entry) = self.pending.get(&id) {
                if !entry.is_deleted() {
                    return Ok(entry.clone());
                }
            }
        }

        let (payload, compression) = compression::compress(plaintext)?;
        let ciphertext = self.crypt.encrypt(&content_ad(&id), &payload)?;
        if ciphertext.len() as u64 > self.max_pack_size {
            bail!(
                "content '{}' too large for the configured pack size ({} bytes)",
                id,
                ciphertext.len()
            );
        }

        let metadata = id.is_metadata();
        if !self.open_packs.contains_key(&metadata) {
            let pack_id = self.next_pack_id(metadata);
            task_debug!(task, "opening pack blob '{}'", pack_id);
            self.open_packs.insert(
                metadata,
                OpenPack {
                    id: pack_id,
                    buffer: Vec::new(),
                    footer: Vec::new(),
                },
            );
        }

        let entry = {
            let open = self.open_packs.get_mut(&metadata).unwrap();
            let offset = open.buffer.len() as u32;
            open.buffer.extend_from_slice(&ciphertext);
            open.footer.push(FooterEntry {
                content: id,
                offset,
                stored_length: ciphertext.len() as u32,
                original_length: plaintext.len() as u32,
                compression,
            });
            IndexEntry {
                content: id,
                pack: Some(open.id.clone()),
                offset,
                stored_length: ciphertext.len() as u32,
                original_length: plaintext.len() as u32,
                compression,
                timestamp: hbk_tools::time::epoch_i64().max(min_timestamp),
                flags,
                format_version: ENTRY_FORMAT_VERSION,
            }
        };
        self.pending.insert(id, entry.clone());

        let full = self.open_packs[&metadata].buffer.len() as u64 >= self.max_pack_size;
        if full {
            self.seal_pack(metadata, task)?;
        }

        Ok(entry)
    }

    /// Record a tombstone for `id` with a fresh timestamp.
    pub fn add_tombstone(&mut self, id: ContentId, short_drop: bool) -> IndexEntry {
        let mut flags = ENTRY_FLAG_DELETED;
        if short_drop {
            flags |= ENTRY_FLAG_SHORT_DROP;
        }
        let entry = IndexEntry {
            content: id,
            pack: None,
            offset: 0,
            stored_length: 0,
            original_length: 0,
            compression: 0,
            timestamp: hbk_tools::time::epoch_i64(),
            flags,
            format_version: ENTRY_FORMAT_VERSION,
        };
        self.pending.insert(id, entry.clone());
        entry
    }

    /// Upload one open pack (with footer) and close it. The open pack
    /// is kept until the upload went through, so a failed put leaves
    /// the session retryable.
    fn seal_pack(&mut self, metadata: bool, task: &dyn TaskContext) -> Result<(), Error> {
        let sealed = {
            let open = match self.open_packs.get(&metadata) {
                None => return Ok(()),
                Some(open) => open,
            };
            if open.footer.is_empty() {
                None
            } else {
                let mut data = open.buffer.clone();
                data.extend_from_slice(&encode_pack_footer(&self.crypt, &open.footer));
                Some((open.id.clone(), data))
            }
        };

        match sealed {
            None => {
                self.open_packs.remove(&metadata);
                Ok(())
            }
            Some((id, data)) => {
                self.store
                    .put_blob(&id, &data, &PutOptions::default())
                    .map_err(|err| format_err!("uploading pack blob '{}' failed - {}", id, err))?;
                task_debug!(task, "sealed pack blob '{}' ({} bytes)", id, data.len());
                self.open_packs.remove(&metadata);
                Ok(())
            }
        }
    }

    /// Seal and upload all open packs, then publish the session's
    /// index blob. Returns the new generation, or `None` if the
    /// session had nothing pending.
    pub fn flush(&mut self, task: &dyn TaskContext) -> Result<Option<Generation>, Error> {
        task.check_abort()?;
        self.seal_pack(false, task)?;
        self.seal_pack(true, task)?;

        if self.pending.is_empty() {
            return Ok(None);
        }

        let entries: Vec<IndexEntry> = self.pending.values().cloned().collect();
        let data = encode_index_blob(&entries, self.index_version)?;
        let id = self.namer.next_index_blob_id()?;
        self.store
            .put_blob(&id, &data, &PutOptions::default())
            .map_err(|err| format_err!("uploading index blob '{}' failed - {}", id, err))?;
        let meta = self.store.get_metadata(&id)?;
        task_log!(
            task,
            "flushed {} index entries to '{}'",
            entries.len(),
            id
        );

        self.pending.clear();
        Ok(Some(Generation::new(meta, entries)))
    }

    /// Flush, or on `abort` drop all buffered state and record a
    /// session marker instead.
    pub fn close(
        &mut self,
        abort: bool,
        task: &dyn TaskContext,
    ) -> Result<Option<Generation>, Error> {
        if !abort {
            return self.flush(task);
        }

        let marker = SessionMarker {
            session: self.session.clone(),
            started: self.started,
            aborted: hbk_tools::time::epoch_i64(),
        };
        let id = BlobId::from(format!("{}{}", SESSION_BLOB_PREFIX, self.session));
        let payload = self
            .crypt
            .encrypt(id.as_str().as_bytes(), &serde_json::to_vec(&marker)?)?;
        self.store.put_blob(&id, &payload, &PutOptions::default())?;
        task_log!(task, "session '{}' aborted", self.session);

        self.open_packs.clear();
        self.pending.clear();
        Ok(None)
    }
}
