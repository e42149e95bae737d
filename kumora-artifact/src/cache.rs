//! The artifact cache: metadata indexing and a refcounted blob layer over
//! the engine.
//!
//! Payloads are stored once under `blob:<content_hash>`; each artifact key
//! stores the hash and holds one reference. Secondary indices are
//! lookup-only and never outlive the artifact key they reference: deletion
//! always deindexes first, then erases.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use tracing::debug;

use kumora_core::error::{Error, Result};
use kumora_core::hash::fnv1a_64_hex;
use kumora_core::types::now_ms;
use kumora_engine::Engine;

use crate::meta::{default_miss_cost, owner_ttl_default_ms, ArtifactMeta};

/// Longest key prefix maintained in the prefix index.
const PREFIX_INDEX_MAX_LEN: usize = 32;
/// Per-bucket member cap; keys beyond it are not indexed for that prefix,
/// so long-tail keys can be absent from `invalidate_prefix`.
const PREFIX_INDEX_CAP: usize = 4096;

/// Artifact-layer counters.
#[derive(Debug, Clone, Default)]
pub struct AiStats {
    pub puts: u64,
    pub gets: u64,
    pub hits: u64,
    pub misses: u64,
    pub dedup_hits: u64,
    pub dedup_blobs: u64,
}

/// A `get` result: metadata plus the dereferenced payload.
#[derive(Debug, Clone)]
pub struct ArtifactValue {
    pub meta: ArtifactMeta,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, Default)]
struct BlobInfo {
    refcount: usize,
    size_bytes: usize,
}

#[derive(Debug, Clone)]
struct KeyInfo {
    meta: ArtifactMeta,
    blob_hash: String,
    hits: u64,
    explain: String,
}

/// Metadata and secondary-index layer atop the engine. The engine itself is
/// passed into each call; this struct owns only the index structures.
#[derive(Default)]
pub struct ArtifactCache {
    stats: AiStats,
    blob_index: HashMap<String, BlobInfo>,
    key_index: HashMap<String, KeyInfo>,
    epoch_index: HashMap<String, HashSet<String>>,
    model_index: HashMap<String, HashSet<String>>,
    prefix_index: HashMap<String, HashSet<String>>,
}

impl ArtifactCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an artifact: parse and default-fill the metadata, write the
    /// blob and the referencing key, bump the refcount, index.
    pub fn put(
        &mut self,
        engine: &mut Engine,
        artifact_type: &str,
        key: &str,
        meta_json: &str,
        payload: Bytes,
    ) -> Result<()> {
        let mut meta = ArtifactMeta::parse(meta_json)?;
        if meta.artifact_type != artifact_type {
            return Err(Error::Artifact {
                message: "artifact type mismatch".to_string(),
            });
        }
        if meta.created_at_ms == 0 {
            meta.created_at_ms = now_ms() as u64;
        }
        if meta.ttl_ms == 0 {
            meta.ttl_ms = owner_ttl_default_ms(&meta.owner);
        }
        meta.size_bytes = payload.len();
        if meta.content_hash.is_empty() {
            meta.content_hash = fnv1a_64_hex(&payload);
        }
        if meta.miss_cost <= 0.0 {
            meta.miss_cost = default_miss_cost(artifact_type);
        }

        // A re-put supersedes the old record: deindex it and release its
        // blob reference before the new write. A blob at refcount zero is
        // deleted from the engine.
        if let Some(prev) = self.key_index.get(key).cloned() {
            self.deindex_key(key, &prev);
            if let Some(blob) = self.blob_index.get_mut(&prev.blob_hash) {
                blob.refcount = blob.refcount.saturating_sub(1);
                if blob.refcount == 0 {
                    engine.del(&[format!("blob:{}", prev.blob_hash)]);
                    self.blob_index.remove(&prev.blob_hash);
                }
            }
        }

        let blob_key = format!("blob:{}", meta.content_hash);
        let ttl_ms = Some(meta.ttl_ms);
        engine
            .set(&blob_key, payload, ttl_ms, "vector")
            .map_err(|e| Error::Artifact {
                message: format!("blob put failed: {}", e),
            })?;
        let blob_ref = Bytes::copy_from_slice(meta.content_hash.as_bytes());
        engine
            .set(key, blob_ref, ttl_ms, &meta.owner)
            .map_err(|e| Error::Artifact {
                message: format!("key put failed: {}", e),
            })?;

        let blob = self.blob_index.entry(meta.content_hash.clone()).or_default();
        if blob.refcount > 0 {
            self.stats.dedup_hits += 1;
            debug!(key, hash = meta.content_hash.as_str(), "blob dedup hit");
        }
        blob.refcount += 1;
        blob.size_bytes = meta.size_bytes;

        let explain = format!(
            "admit:score>threshold owner={} type={}",
            meta.owner, meta.artifact_type
        );
        let blob_hash = meta.content_hash.clone();
        self.index_key(key, &meta);
        self.key_index.insert(
            key.to_string(),
            KeyInfo {
                meta,
                blob_hash,
                hits: 0,
                explain,
            },
        );

        self.stats.puts += 1;
        self.stats.dedup_blobs = self.blob_index.len() as u64;
        Ok(())
    }

    /// Fetch an artifact; present only when both the key and its blob are
    /// still resident and unexpired.
    pub fn get(&mut self, engine: &mut Engine, key: &str) -> Option<ArtifactValue> {
        self.stats.gets += 1;
        if !self.key_index.contains_key(key) {
            self.stats.misses += 1;
            return None;
        }
        if engine.get(key).is_none() {
            self.stats.misses += 1;
            return None;
        }
        let blob_key = match self.key_index.get(key) {
            Some(ki) => format!("blob:{}", ki.blob_hash),
            None => return None,
        };
        let payload = match engine.get(&blob_key) {
            Some(p) => p,
            None => {
                self.stats.misses += 1;
                return None;
            }
        };
        self.stats.hits += 1;
        let ki = self.key_index.get_mut(key)?;
        ki.hits += 1;
        Some(ArtifactValue {
            meta: ki.meta.clone(),
            payload,
        })
    }

    pub fn mget(&mut self, engine: &mut Engine, keys: &[String]) -> Vec<Option<ArtifactValue>> {
        keys.iter().map(|k| self.get(engine, k)).collect()
    }

    /// Remove every key tagged with `epoch`. Unknown epochs remove nothing.
    pub fn invalidate_epoch(&mut self, engine: &mut Engine, epoch: &str) -> usize {
        match self.epoch_index.remove(epoch) {
            Some(keys) => self.invalidate_keys(engine, &keys),
            None => 0,
        }
    }

    pub fn invalidate_model(&mut self, engine: &mut Engine, model_id: &str) -> usize {
        match self.model_index.remove(model_id) {
            Some(keys) => self.invalidate_keys(engine, &keys),
            None => 0,
        }
    }

    pub fn invalidate_prefix(&mut self, engine: &mut Engine, prefix: &str) -> usize {
        match self.prefix_index.remove(prefix) {
            Some(keys) => self.invalidate_keys(engine, &keys),
            None => 0,
        }
    }

    /// Deterministic counters report.
    pub fn stats_report(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("puts:{}\n", self.stats.puts));
        out.push_str(&format!("gets:{}\n", self.stats.gets));
        out.push_str(&format!("hits:{}\n", self.stats.hits));
        out.push_str(&format!("misses:{}\n", self.stats.misses));
        out.push_str(&format!("dedup_hits:{}\n", self.stats.dedup_hits));
        out.push_str(&format!("blob_count:{}\n", self.blob_index.len()));
        let mut by_type: HashMap<&str, u64> = HashMap::new();
        for ki in self.key_index.values() {
            *by_type.entry(ki.meta.artifact_type.as_str()).or_insert(0) += 1;
        }
        let mut rows: Vec<(&str, u64)> = by_type.into_iter().collect();
        rows.sort();
        for (ty, count) in rows {
            out.push_str(&format!("type.{}:{}\n", ty, count));
        }
        out
    }

    /// Top `n` keys by local hit count, count-descending then lexicographic.
    pub fn top_hot(&self, n: usize) -> String {
        let mut rows: Vec<(&String, u64)> =
            self.key_index.iter().map(|(k, ki)| (k, ki.hits)).collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        let mut out = String::new();
        for (key, hits) in rows.into_iter().take(n) {
            out.push_str(&format!("{}:{}\n", key, hits));
        }
        out
    }

    /// Top `n` keys by configured miss cost.
    pub fn top_costly(&self, n: usize) -> String {
        let mut rows: Vec<(&String, f64)> = self
            .key_index
            .iter()
            .map(|(k, ki)| (k, ki.meta.miss_cost))
            .collect();
        rows.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });
        let mut out = String::new();
        for (key, cost) in rows.into_iter().take(n) {
            out.push_str(&format!("{}:{}\n", key, cost));
        }
        out
    }

    pub fn explain(&self, key: &str) -> String {
        match self.key_index.get(key) {
            Some(ki) => ki.explain.clone(),
            None => "MISS:no metadata".to_string(),
        }
    }

    pub fn stats(&self) -> &AiStats {
        &self.stats
    }

    fn index_key(&mut self, key: &str, meta: &ArtifactMeta) {
        if !meta.snapshot_epoch.is_empty() {
            self.epoch_index
                .entry(meta.snapshot_epoch.clone())
                .or_default()
                .insert(key.to_string());
        }
        if !meta.model_id.is_empty() {
            self.model_index
                .entry(meta.model_id.clone())
                .or_default()
                .insert(key.to_string());
        }
        for len in 1..=key.len().min(PREFIX_INDEX_MAX_LEN) {
            let bucket = self.prefix_index.entry(key[..len].to_string()).or_default();
            if bucket.len() < PREFIX_INDEX_CAP {
                bucket.insert(key.to_string());
            }
        }
    }

    fn deindex_key(&mut self, key: &str, ki: &KeyInfo) {
        if !ki.meta.snapshot_epoch.is_empty() {
            if let Some(bucket) = self.epoch_index.get_mut(&ki.meta.snapshot_epoch) {
                bucket.remove(key);
            }
        }
        if !ki.meta.model_id.is_empty() {
            if let Some(bucket) = self.model_index.get_mut(&ki.meta.model_id) {
                bucket.remove(key);
            }
        }
        for len in 1..=key.len().min(PREFIX_INDEX_MAX_LEN) {
            if let Some(bucket) = self.prefix_index.get_mut(&key[..len]) {
                bucket.remove(key);
            }
        }
    }

    fn invalidate_keys(&mut self, engine: &mut Engine, keys: &HashSet<String>) -> usize {
        let mut removed = 0;
        for key in keys {
            let ki = match self.key_index.get(key).cloned() {
                Some(ki) => ki,
                None => continue,
            };
            self.deindex_key(key, &ki);
            if let Some(blob) = self.blob_index.get_mut(&ki.blob_hash) {
                if blob.refcount > 0 {
                    blob.refcount -= 1;
                }
                if blob.refcount == 0 {
                    engine.del(&[format!("blob:{}", ki.blob_hash)]);
                    self.blob_index.remove(&ki.blob_hash);
                }
            }
            engine.del(std::slice::from_ref(key));
            self.key_index.remove(key);
            removed += 1;
        }
        self.stats.dedup_blobs = self.blob_index.len() as u64;
        removed
    }
}
