//! Labeled JSON records stored as metadata contents.
//!
//! Each manifest lives in its own `m`-prefixed content; a deletion
//! writes a tombstone record that hides every older record of the same
//! manifest id until maintenance drops the underlying contents. An
//! in-memory inverted index answers label queries without touching
//! storage.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use anyhow::{bail, format_err, Context, Error};
use serde::{Deserialize, Serialize};

use hbk_api_types::{ContentId, ContentRange, ManifestId, CONTENT_PREFIX_MANIFEST};
use hbk_tools::serde_helpers::bytes_as_base64;
use hbk_tools::task::TaskContext;

use crate::content::ContentManager;
use crate::index::IterateOptions;

#[derive(Serialize, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
struct ManifestRecord {
    id: ManifestId,
    labels: BTreeMap<String, String>,
    mod_time: i64,
    #[serde(with = "bytes_as_base64")]
    payload: Vec<u8>,
    #[serde(default)]
    deleted: bool,
}

/// Listing entry returned by label queries.
#[derive(Clone, Debug)]
pub struct ManifestInfo {
    pub id: ManifestId,
    pub labels: BTreeMap<String, String>,
    pub mod_time: i64,
}

struct LoadedManifest {
    content: ContentId,
    labels: BTreeMap<String, String>,
    mod_time: i64,
    deleted: bool,
}

#[derive(Default)]
struct State {
    manifests: HashMap<ManifestId, LoadedManifest>,
    label_index: HashMap<(String, String), BTreeSet<ManifestId>>,
}

impl State {
    fn index_labels(&mut self, id: &ManifestId, labels: &BTreeMap<String, String>) {
        for (key, value) in labels {
            self.label_index
                .entry((key.clone(), value.clone()))
                .or_default()
                .insert(id.clone());
        }
    }

    fn unindex_labels(&mut self, id: &ManifestId, labels: &BTreeMap<String, String>) {
        for (key, value) in labels {
            if let Some(set) = self.label_index.get_mut(&(key.clone(), value.clone())) {
                set.remove(id);
                if set.is_empty() {
                    self.label_index.remove(&(key.clone(), value.clone()));
                }
            }
        }
    }

    fn apply(&mut self, content: ContentId, record: &ManifestRecord) {
        if let Some(existing) = self.manifests.get(&record.id) {
            let newer = record.mod_time > existing.mod_time
                || (record.mod_time == existing.mod_time && record.deleted);
            if !newer {
                return;
            }
            let labels = existing.labels.clone();
            self.unindex_labels(&record.id, &labels);
        }
        if !record.deleted {
            self.index_labels(&record.id, &record.labels);
        }
        self.manifests.insert(
            record.id.clone(),
            LoadedManifest {
                content,
                labels: record.labels.clone(),
                mod_time: record.mod_time,
                deleted: record.deleted,
            },
        );
    }
}

/// Manifest namespace over the content manager.
pub struct ManifestStore {
    contents: Arc<ContentManager>,
    state: RwLock<State>,
}

impl ManifestStore {
    pub fn new(contents: Arc<ContentManager>) -> Self {
        Self {
            contents,
            state: RwLock::new(State::default()),
        }
    }

    /// Rebuild the in-memory label index from the content manager.
    pub fn reload(&self, task: &dyn TaskContext) -> Result<usize, Error> {
        let iterate = IterateOptions {
            range: ContentRange::prefix(CONTENT_PREFIX_MANIFEST),
            include_deleted: false,
        };

        let mut ids = Vec::new();
        self.contents
            .indexes()
            .iterate_contents(&iterate, task, &mut |entry| {
                ids.push(entry.content);
                Ok(())
            })?;

        let mut state = State::default();
        for content in ids {
            task.check_abort()?;
            let data = self.contents.get_content(&content, task)?;
            let record: ManifestRecord = serde_json::from_slice(&data)
                .with_context(|| format!("unable to parse manifest content '{}'", content))?;
            state.apply(content, &record);
        }

        let loaded = state.manifests.len();
        *self.state.write().unwrap() = state;
        Ok(loaded)
    }

    fn write_record(
        &self,
        record: &ManifestRecord,
        task: &dyn TaskContext,
    ) -> Result<ContentId, Error> {
        let data = serde_json::to_vec(record)?;
        self.contents
            .write_content(CONTENT_PREFIX_MANIFEST, &data, task)
    }

    /// Store a new manifest and return its id.
    pub fn put(
        &self,
        labels: BTreeMap<String, String>,
        payload: Vec<u8>,
        task: &dyn TaskContext,
    ) -> Result<ManifestId, Error> {
        if labels.is_empty() {
            bail!("refusing to store a manifest without labels");
        }

        let mut raw = [0u8; 16];
        openssl::rand::rand_bytes(&mut raw)?;
        let id = ManifestId::new(hex::encode(raw));

        let record = ManifestRecord {
            id: id.clone(),
            labels,
            mod_time: hbk_tools::time::epoch_i64(),
            payload,
            deleted: false,
        };
        let content = self.write_record(&record, task)?;
        self.state.write().unwrap().apply(content, &record);
        Ok(id)
    }

    /// Labels and payload of one manifest.
    pub fn get(
        &self,
        id: &ManifestId,
        task: &dyn TaskContext,
    ) -> Result<(BTreeMap<String, String>, Vec<u8>), Error> {
        let content = {
            let state = self.state.read().unwrap();
            match state.manifests.get(id) {
                Some(manifest) if !manifest.deleted => manifest.content,
                _ => bail!("manifest '{}' not found", id),
            }
        };

        let data = self.contents.get_content(&content, task)?;
        let record: ManifestRecord = serde_json::from_slice(&data)
            .map_err(|err| format_err!("unable to parse manifest '{}' - {}", id, err))?;
        Ok((record.labels, record.payload))
    }

    /// All live manifests carrying every given label. An empty query
    /// lists everything.
    pub fn find(&self, labels: &BTreeMap<String, String>) -> Vec<ManifestInfo> {
        let state = self.state.read().unwrap();

        let matches: Vec<&ManifestId> = if labels.is_empty() {
            state
                .manifests
                .iter()
                .filter(|(_, manifest)| !manifest.deleted)
                .map(|(id, _)| id)
                .collect()
        } else {
            let mut sets = Vec::with_capacity(labels.len());
            for (key, value) in labels {
                match state.label_index.get(&(key.clone(), value.clone())) {
                    Some(set) => sets.push(set),
                    None => return Vec::new(),
                }
            }
            sets.sort_by_key(|set| set.len());
            let (smallest, rest) = sets.split_first().unwrap();
            smallest
                .iter()
                .filter(|id| rest.iter().all(|set| set.contains(*id)))
                .collect()
        };

        let mut found: Vec<ManifestInfo> = matches
            .into_iter()
            .filter_map(|id| {
                state.manifests.get(id).map(|manifest| ManifestInfo {
                    id: id.clone(),
                    labels: manifest.labels.clone(),
                    mod_time: manifest.mod_time,
                })
            })
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }

    /// Hide a manifest behind a tombstone record.
    pub fn delete(&self, id: &ManifestId, task: &dyn TaskContext) -> Result<(), Error> {
        let mod_time = {
            let state = self.state.read().unwrap();
            match state.manifests.get(id) {
                Some(manifest) if !manifest.deleted => {
                    // strictly newer than the record it hides
                    manifest.mod_time.max(hbk_tools::time::epoch_i64() - 1) + 1
                }
                _ => bail!("manifest '{}' not found", id),
            }
        };

        let record = ManifestRecord {
            id: id.clone(),
            labels: BTreeMap::new(),
            mod_time,
            payload: Vec::new(),
            deleted: true,
        };
        let content = self.write_record(&record, task)?;
        self.state.write().unwrap().apply(content, &record);
        Ok(())
    }

    /// Drop superseded manifest records and expired tombstones from
    /// the content manager. Called by full maintenance.
    pub fn compact(&self, min_tombstone_age: i64, task: &dyn TaskContext) -> Result<usize, Error> {
        let iterate = IterateOptions {
            range: ContentRange::prefix(CONTENT_PREFIX_MANIFEST),
            include_deleted: false,
        };
        let mut ids = Vec::new();
        self.contents
            .indexes()
            .iterate_contents(&iterate, task, &mut |entry| {
                ids.push(entry.content);
                Ok(())
            })?;

        // newest record per manifest id wins; everything else goes
        let mut records: Vec<(ContentId, ManifestRecord)> = Vec::new();
        let mut state = State::default();
        for content in ids {
            task.check_abort()?;
            let data = self.contents.get_content(&content, task)?;
            let record: ManifestRecord = serde_json::from_slice(&data)
                .with_context(|| format!("unable to parse manifest content '{}'", content))?;
            state.apply(content, &record);
            records.push((content, record));
        }

        let now = hbk_tools::time::epoch_i64();
        let mut dropped = 0;
        for (content, record) in records {
            let winner = match state.manifests.get(&record.id) {
                Some(winner) => winner,
                None => continue,
            };
            let superseded = winner.content != content;
            let expired_tombstone =
                winner.content == content && winner.deleted && now - winner.mod_time >= min_tombstone_age;
            if superseded || expired_tombstone {
                self.contents.delete_content(&content)?;
                dropped += 1;
            }
        }
        Ok(dropped)
    }
}
