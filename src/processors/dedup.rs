//! Multi-strategy content deduplication.
//!
//! A candidate document is first checked against exact content hashes
//! (MD5, SHA-1, SHA-256 of the normalized content), then near-matched
//! through a 64-bit SimHash prefilter, and finally scored with a
//! fine-grained similarity from an embedding provider. The provider is
//! a seam: an LLM-backed implementation when the gateway is healthy, a
//! TF-IDF vectorizer when it is not. Falling back sets a diagnostic
//! flag on the outcome so downstream can tell the difference.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{AtlasError, Result};
use crate::models::ProcessedDocument;

/// Strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStrategy {
    HashOnly,
    SemanticOnly,
    Hybrid,
}

fn default_similarity_threshold() -> f64 {
    0.85
}
fn default_simhash_threshold() -> u32 {
    3
}
fn default_embed_cache_size() -> usize {
    1024
}

/// Deduplication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    pub strategy: DedupStrategy,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// Maximum SimHash Hamming distance admitted to fine scoring.
    #[serde(default = "default_simhash_threshold")]
    pub simhash_threshold: u32,
    #[serde(default = "default_embed_cache_size")]
    pub embed_cache_size: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            strategy: DedupStrategy::Hybrid,
            similarity_threshold: default_similarity_threshold(),
            simhash_threshold: default_simhash_threshold(),
            embed_cache_size: default_embed_cache_size(),
        }
    }
}

/// Exact and locality-sensitive hashes of one normalized content body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
    pub simhash: u64,
}

/// Compute the full fingerprint of normalized content.
pub fn fingerprint(content: &str) -> Fingerprint {
    let bytes = content.as_bytes();
    Fingerprint {
        md5: format!("{:x}", Md5::digest(bytes)),
        sha1: format!("{:x}", Sha1::digest(bytes)),
        sha256: format!("{:x}", Sha256::digest(bytes)),
        simhash: simhash(content),
    }
}

/// 64-bit SimHash over whitespace tokens weighted by frequency.
pub fn simhash(content: &str) -> u64 {
    let mut weights: HashMap<&str, i64> = HashMap::new();
    for token in content.split_whitespace() {
        *weights.entry(token).or_insert(0) += 1;
    }
    if weights.is_empty() {
        return 0;
    }

    let mut vector = [0i64; 64];
    for (token, weight) in weights {
        let digest = Md5::digest(token.as_bytes());
        let hash = u64::from_be_bytes(digest[..8].try_into().expect("md5 is 16 bytes"));
        for (bit, slot) in vector.iter_mut().enumerate() {
            if hash >> (63 - bit) & 1 == 1 {
                *slot += weight;
            } else {
                *slot -= weight;
            }
        }
    }

    let mut value = 0u64;
    for (bit, slot) in vector.iter().enumerate() {
        if *slot > 0 {
            value |= 1 << (63 - bit);
        }
    }
    value
}

/// Hamming distance between two SimHash values.
pub fn hamming(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// Cosine similarity between two vectors; 0.0 for mismatched or empty
/// inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

/// Embedding backend used for fine-grained similarity.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    fn name(&self) -> &'static str;
}

const TFIDF_DIMS: usize = 512;

/// Hashed TF-IDF vectorizer: the always-available fallback provider.
///
/// Document frequencies accumulate across the provider's lifetime, so
/// vectors sharpen as the corpus grows.
pub struct TfIdfProvider {
    state: Mutex<TfIdfState>,
}

#[derive(Default)]
struct TfIdfState {
    doc_count: u64,
    doc_frequency: HashMap<u64, u64>,
}

impl TfIdfProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TfIdfState::default()),
        }
    }

    fn bucket(token: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        hasher.finish()
    }
}

impl Default for TfIdfProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for TfIdfProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let tokens: Vec<u64> = text
            .split_whitespace()
            .map(|t| Self::bucket(&t.to_lowercase()))
            .collect();
        let total = tokens.len().max(1) as f32;

        let mut counts: HashMap<u64, u64> = HashMap::new();
        for token in &tokens {
            *counts.entry(*token).or_insert(0) += 1;
        }

        let mut state = self.state.lock().expect("tfidf state poisoned");
        state.doc_count += 1;
        for token in counts.keys() {
            *state.doc_frequency.entry(*token).or_insert(0) += 1;
        }

        let mut vector = vec![0.0f32; TFIDF_DIMS];
        for (token, count) in counts {
            let df = *state.doc_frequency.get(&token).unwrap_or(&1) as f32;
            let idf = (1.0 + state.doc_count as f32 / (1.0 + df)).ln();
            let tf = count as f32 / total;
            vector[(token % TFIDF_DIMS as u64) as usize] += tf * idf;
        }
        Ok(vector)
    }

    fn name(&self) -> &'static str {
        "tfidf"
    }
}

/// Minimal LRU map for cached embeddings.
struct LruCache {
    capacity: usize,
    map: HashMap<String, Vec<f32>>,
    order: VecDeque<String>,
}

impl LruCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &str) -> Option<Vec<f32>> {
        if let Some(value) = self.map.get(key) {
            let value = value.clone();
            if let Some(pos) = self.order.iter().position(|k| k == key) {
                self.order.remove(pos);
            }
            self.order.push_back(key.to_string());
            Some(value)
        } else {
            None
        }
    }

    fn put(&mut self, key: String, value: Vec<f32>) {
        if self.map.contains_key(&key) {
            if let Some(pos) = self.order.iter().position(|k| *k == key) {
                self.order.remove(pos);
            }
        } else if self.map.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.map.remove(&evicted);
            }
        }
        self.order.push_back(key.clone());
        self.map.insert(key, value);
    }
}

/// One previously seen document.
struct StoredEntry {
    sha256: String,
    simhash: u64,
    content: String,
    group_id: Uuid,
}

struct GroupMeta {
    /// Creation order; the tie-break "oldest group" key.
    seq: u64,
    members: usize,
}

/// Result of checking one candidate.
#[derive(Debug, Clone)]
pub struct DedupOutcome {
    pub is_duplicate: bool,
    pub group_id: Uuid,
    pub similarity: f64,
    /// True when the LLM path was configured but unavailable and the
    /// TF-IDF fallback scored this candidate.
    pub degraded: bool,
}

/// Stateful deduplicator holding the similarity index.
pub struct Deduplicator {
    config: DedupConfig,
    primary: Option<Arc<dyn EmbeddingProvider>>,
    fallback: Arc<dyn EmbeddingProvider>,
    entries: Vec<StoredEntry>,
    by_sha256: HashMap<String, Uuid>,
    by_md5: HashMap<String, Uuid>,
    by_sha1: HashMap<String, Uuid>,
    groups: HashMap<Uuid, GroupMeta>,
    next_seq: u64,
    embed_cache: LruCache,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        let cache_size = config.embed_cache_size;
        Self {
            config,
            primary: None,
            fallback: Arc::new(TfIdfProvider::new()),
            entries: Vec::new(),
            by_sha256: HashMap::new(),
            by_md5: HashMap::new(),
            by_sha1: HashMap::new(),
            groups: HashMap::new(),
            next_seq: 0,
            embed_cache: LruCache::new(cache_size),
        }
    }

    /// Install the LLM-backed embedding provider.
    pub fn with_primary_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.primary = Some(provider);
        self
    }

    /// Warm the index from already-stored documents, preserving their
    /// group assignments.
    pub fn observe_existing(&mut self, doc: &ProcessedDocument) {
        let group_id = doc.similarity_group_id.unwrap_or(doc.id);
        let fp = fingerprint(&doc.content);
        self.insert_entry(fp, doc.content.clone(), group_id);
    }

    /// Check a candidate and update the index.
    ///
    /// An empty normalized content is a structural failure.
    pub async fn check(&mut self, content: &str) -> Result<DedupOutcome> {
        if content.trim().is_empty() {
            return Err(AtlasError::Dedup("empty normalized content".into()));
        }

        let fp = fingerprint(content);

        // Exact hash collision: duplicate with full confidence.
        if self.config.strategy != DedupStrategy::SemanticOnly {
            if let Some(group_id) = self.exact_match(&fp) {
                self.insert_entry(fp, content.to_string(), group_id);
                return Ok(DedupOutcome {
                    is_duplicate: true,
                    group_id,
                    similarity: 1.0,
                    degraded: false,
                });
            }
        }

        if self.config.strategy == DedupStrategy::HashOnly {
            let group_id = self.new_group();
            self.insert_entry(fp, content.to_string(), group_id);
            return Ok(DedupOutcome {
                is_duplicate: false,
                group_id,
                similarity: 0.0,
                degraded: false,
            });
        }

        // SimHash prefilter narrows the fine-similarity workload.
        let candidates: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| hamming(e.simhash, fp.simhash) <= self.config.simhash_threshold)
            .map(|(i, _)| i)
            .collect();

        let mut degraded = false;
        let mut best: Option<(f64, Uuid)> = None;

        if !candidates.is_empty() {
            let (provider, fell_back) = self.select_provider(content).await;
            degraded = fell_back;

            // A provider that dies mid-scoring invalidates the whole
            // pass (vectors from different providers do not compare);
            // redo it entirely on the fallback.
            best = match self.score_candidates(&provider, &fp, content, &candidates).await {
                Ok(best) => best,
                Err(e) if !degraded && self.primary.is_some() => {
                    warn!(error = %e, "embedding failed mid-check, rescoring with tf-idf");
                    degraded = true;
                    let fallback = self.fallback.clone();
                    self.score_candidates(&fallback, &fp, content, &candidates)
                        .await?
                }
                Err(e) => return Err(e),
            };
        }

        match best {
            Some((similarity, group_id)) if similarity >= self.config.similarity_threshold => {
                debug!(similarity, %group_id, degraded, "near-duplicate detected");
                self.insert_entry(fp, content.to_string(), group_id);
                Ok(DedupOutcome {
                    is_duplicate: true,
                    group_id,
                    similarity,
                    degraded,
                })
            }
            best => {
                let group_id = self.new_group();
                self.insert_entry(fp, content.to_string(), group_id);
                Ok(DedupOutcome {
                    is_duplicate: false,
                    group_id,
                    similarity: best.map(|(s, _)| s).unwrap_or(0.0),
                    degraded,
                })
            }
        }
    }

    /// Apply an outcome to a processed document.
    pub fn apply(outcome: &DedupOutcome, doc: &mut ProcessedDocument) {
        doc.is_duplicate = outcome.is_duplicate;
        doc.similarity_group_id = Some(outcome.group_id);
        doc.similarity_score = outcome.similarity;
        doc.dedup_degraded = outcome.degraded;
    }

    fn exact_match(&self, fp: &Fingerprint) -> Option<Uuid> {
        self.by_sha256
            .get(&fp.sha256)
            .or_else(|| self.by_md5.get(&fp.md5))
            .or_else(|| self.by_sha1.get(&fp.sha1))
            .copied()
    }

    /// Pick the active provider, probing the primary with the candidate
    /// text; a failing primary demotes this check to the fallback.
    async fn select_provider(&mut self, probe: &str) -> (Arc<dyn EmbeddingProvider>, bool) {
        match &self.primary {
            None => (self.fallback.clone(), false),
            Some(primary) => {
                // Cheap probe on a prefix; a healthy provider answers.
                let prefix: String = probe.chars().take(64).collect();
                match primary.embed(&prefix).await {
                    Ok(_) => (primary.clone(), false),
                    Err(e) => {
                        warn!(error = %e, "embedding provider unavailable, using tf-idf fallback");
                        (self.fallback.clone(), true)
                    }
                }
            }
        }
    }

    /// Score every candidate with one provider; returns the best
    /// `(similarity, group)` under the tie-break rules.
    async fn score_candidates(
        &mut self,
        provider: &Arc<dyn EmbeddingProvider>,
        fp: &Fingerprint,
        content: &str,
        candidates: &[usize],
    ) -> Result<Option<(f64, Uuid)>> {
        let candidate_vec = self.embed_cached(provider, &fp.sha256, content).await?;
        let mut best: Option<(f64, Uuid)> = None;

        for &index in candidates {
            let (entry_hash, entry_content, entry_group) = {
                let entry = &self.entries[index];
                (entry.sha256.clone(), entry.content.clone(), entry.group_id)
            };
            let entry_vec = self
                .embed_cached(provider, &entry_hash, &entry_content)
                .await?;
            let similarity = cosine_similarity(&candidate_vec, &entry_vec) as f64;

            let better = match best {
                None => true,
                Some((best_sim, best_group)) => {
                    similarity > best_sim
                        || (similarity == best_sim
                            && self.group_seq(entry_group) < self.group_seq(best_group))
                }
            };
            if better {
                best = Some((similarity, entry_group));
            }
        }
        Ok(best)
    }

    async fn embed_cached(
        &mut self,
        provider: &Arc<dyn EmbeddingProvider>,
        content_hash: &str,
        content: &str,
    ) -> Result<Vec<f32>> {
        let key = format!("{}:{}", provider.name(), content_hash);
        if let Some(vector) = self.embed_cache.get(&key) {
            return Ok(vector);
        }
        let vector = provider.embed(content).await?;
        self.embed_cache.put(key, vector.clone());
        Ok(vector)
    }

    fn group_seq(&self, group_id: Uuid) -> u64 {
        self.groups.get(&group_id).map(|g| g.seq).unwrap_or(u64::MAX)
    }

    fn new_group(&mut self) -> Uuid {
        let group_id = Uuid::new_v4();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.groups.insert(group_id, GroupMeta { seq, members: 0 });
        group_id
    }

    fn insert_entry(&mut self, fp: Fingerprint, content: String, group_id: Uuid) {
        self.groups
            .entry(group_id)
            .or_insert_with(|| {
                let seq = self.next_seq;
                self.next_seq += 1;
                GroupMeta { seq, members: 0 }
            })
            .members += 1;
        self.by_sha256.insert(fp.sha256.clone(), group_id);
        self.by_md5.insert(fp.md5, group_id);
        self.by_sha1.insert(fp.sha1, group_id);
        self.entries.push(StoredEntry {
            sha256: fp.sha256,
            simhash: fp.simhash,
            content,
            group_id,
        });
    }

    /// Number of distinct similarity groups seen so far.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Members recorded for one group.
    pub fn group_size(&self, group_id: Uuid) -> usize {
        self.groups.get(&group_id).map(|g| g.members).unwrap_or(0)
    }
}
