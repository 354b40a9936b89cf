//! In-memory vector index with exact cosine-similarity search.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::memory::{MemoryId, VectorRef};

/// Default minimum similarity for a warm match.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.5;

/// A warm-tier vector pointing back at its owning record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorEntry {
    #[serde(skip)]
    pub id: VectorRef,
    pub memory_id: MemoryId,
    /// Unit-length vector of the index dimension
    pub vector: Vec<f32>,
    pub content_preview: String,
    pub created_at: DateTime<Utc>,
}

/// On-disk snapshot layout: vector entry id -> entry.
pub type WarmSnapshot = BTreeMap<String, VectorEntry>;

/// One ranked search result.
#[derive(Debug, Clone, PartialEq)]
pub struct WarmMatch {
    pub vector_id: VectorRef,
    pub memory_id: MemoryId,
    pub similarity: f32,
    pub preview: String,
}

/// Outcome of an insert.
#[derive(Debug, Clone)]
pub struct InsertOutcome {
    pub vector_ref: VectorRef,
    /// Entries dropped to stay within the capacity bound
    pub evicted: usize,
}

/// Warm tier: vectors kept in memory and ranked by exact cosine similarity.
///
/// `search` scores every stored vector against the query. There is no
/// approximate structure here; swapping one in changes which results come
/// back and must be done behind this same method.
#[derive(Debug)]
pub struct WarmIndex {
    entries: HashMap<VectorRef, VectorEntry>,
    dim: usize,
    limit: usize,
    /// Mutations not yet captured by a snapshot
    dirty: usize,
}

impl WarmIndex {
    pub fn new(dim: usize, limit: usize) -> Self {
        Self {
            entries: HashMap::new(),
            dim,
            limit: limit.max(1),
            dirty: 0,
        }
    }

    /// Rebuild from a snapshot, skipping entries of the wrong dimension.
    pub fn from_snapshot(snapshot: WarmSnapshot, dim: usize, limit: usize) -> Self {
        let mut index = Self::new(dim, limit);
        let mut skipped = 0usize;

        for (id, mut entry) in snapshot {
            if entry.vector.len() != dim {
                skipped += 1;
                continue;
            }
            entry.id = VectorRef(id);
            index.entries.insert(entry.id.clone(), entry);
        }
        if skipped > 0 {
            warn!(skipped, dim, "Dropped snapshot entries with mismatched dimension");
        }
        index.enforce_limit();
        index
    }

    /// Insert a vector for `memory_id`, created now.
    pub fn insert(
        &mut self,
        memory_id: &MemoryId,
        vector: Vec<f32>,
        preview: impl Into<String>,
    ) -> Result<InsertOutcome> {
        self.insert_at(memory_id, vector, preview, Utc::now())
    }

    /// Insert a vector with an explicit creation time.
    pub fn insert_at(
        &mut self,
        memory_id: &MemoryId,
        vector: Vec<f32>,
        preview: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Result<InsertOutcome> {
        if vector.len() != self.dim {
            return Err(Error::embedding(format!(
                "vector has dimension {}, index expects {}",
                vector.len(),
                self.dim
            )));
        }
        let vector = normalize(vector)
            .ok_or_else(|| Error::embedding("cannot index a zero or non-finite vector"))?;

        let mut vector_ref = VectorRef::derive(memory_id, created_at);
        let mut suffix = 1;
        while self.entries.contains_key(&vector_ref) {
            vector_ref = VectorRef(format!(
                "{}_{}",
                VectorRef::derive(memory_id, created_at),
                suffix
            ));
            suffix += 1;
        }

        let mut evicted = 0;
        while self.entries.len() >= self.limit {
            if self.evict_oldest().is_none() {
                break;
            }
            evicted += 1;
        }

        self.entries.insert(
            vector_ref.clone(),
            VectorEntry {
                id: vector_ref.clone(),
                memory_id: memory_id.clone(),
                vector,
                content_preview: preview.into(),
                created_at,
            },
        );
        self.dirty += 1;

        Ok(InsertOutcome {
            vector_ref,
            evicted,
        })
    }

    /// Rank stored vectors by cosine similarity to `query`.
    ///
    /// Entries scoring below `threshold` are discarded, the rest sorted
    /// descending and cut to `k`.
    pub fn search(&self, query: &[f32], k: usize, threshold: f32) -> Vec<WarmMatch> {
        if k == 0 || query.len() != self.dim {
            return Vec::new();
        }

        let mut matches: Vec<WarmMatch> = self
            .entries
            .values()
            .filter_map(|entry| {
                let similarity = cosine_similarity(query, &entry.vector);
                (similarity >= threshold).then(|| WarmMatch {
                    vector_id: entry.id.clone(),
                    memory_id: entry.memory_id.clone(),
                    similarity,
                    preview: entry.content_preview.clone(),
                })
            })
            .collect();

        matches.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.vector_id.as_str().cmp(b.vector_id.as_str()))
        });
        matches.truncate(k);
        matches
    }

    /// Drop entries created more than `age` before `now`. Returns the count.
    pub fn evict_older_than(&mut self, age: Duration, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| now - entry.created_at <= age);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            self.dirty += evicted;
            debug!(evicted, "Evicted aged warm entries");
        }
        evicted
    }

    /// Collapse entries sharing a memory id to the earliest one.
    pub fn compress_duplicates(&mut self) -> usize {
        let mut keep: HashMap<MemoryId, (DateTime<Utc>, VectorRef)> = HashMap::new();
        for entry in self.entries.values() {
            let candidate = (entry.created_at, entry.id.clone());
            keep.entry(entry.memory_id.clone())
                .and_modify(|current| {
                    if (candidate.0, candidate.1.as_str()) < (current.0, current.1.as_str()) {
                        *current = candidate.clone();
                    }
                })
                .or_insert_with(|| candidate.clone());
        }

        let before = self.entries.len();
        self.entries
            .retain(|id, entry| keep.get(&entry.memory_id).map(|(_, k)| k == id).unwrap_or(true));
        let removed = before - self.entries.len();
        if removed > 0 {
            self.dirty += removed;
            debug!(removed, "Compressed duplicate warm entries");
        }
        removed
    }

    /// Remove every entry referencing `memory_id`.
    pub fn remove_memory(&mut self, memory_id: &MemoryId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| &entry.memory_id != memory_id);
        let removed = before - self.entries.len();
        self.dirty += removed;
        removed
    }

    pub fn contains_memory(&self, memory_id: &MemoryId) -> bool {
        self.entries.values().any(|entry| &entry.memory_id == memory_id)
    }

    pub fn get(&self, vector_ref: &VectorRef) -> Option<&VectorEntry> {
        self.entries.get(vector_ref)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Inserts and removals since the last captured snapshot.
    pub fn dirty(&self) -> usize {
        self.dirty
    }

    /// Copy the entries for persistence along with the dirty count captured.
    pub fn capture(&self) -> (WarmSnapshot, usize) {
        let snapshot = self
            .entries
            .iter()
            .map(|(id, entry)| (id.as_str().to_string(), entry.clone()))
            .collect();
        (snapshot, self.dirty)
    }

    /// Acknowledge that `saved` dirty mutations reached disk.
    pub fn mark_clean(&mut self, saved: usize) {
        self.dirty = self.dirty.saturating_sub(saved);
    }

    fn enforce_limit(&mut self) -> usize {
        let mut evicted = 0;
        while self.entries.len() > self.limit && self.evict_oldest().is_some() {
            evicted += 1;
        }
        evicted
    }

    fn evict_oldest(&mut self) -> Option<VectorEntry> {
        let oldest = self
            .entries
            .values()
            .min_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.id.as_str().cmp(b.id.as_str()))
            })
            .map(|entry| entry.id.clone())?;
        self.entries.remove(&oldest)
    }
}

/// Cosine similarity of two vectors; 0.0 for mismatched or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

/// Scale to unit length. `None` for zero or non-finite input.
pub fn normalize(mut vector: Vec<f32>) -> Option<Vec<f32>> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return None;
    }
    vector.iter_mut().for_each(|x| *x /= norm);
    Some(vector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn mem(name: &str) -> MemoryId {
        MemoryId::from_content(name)
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_insert_normalizes_and_checks_dimension() {
        let mut index = WarmIndex::new(2, 10);
        let outcome = index.insert(&mem("a"), vec![3.0, 4.0], "a").unwrap();
        let entry = index.get(&outcome.vector_ref).unwrap();
        assert!((entry.vector[0] - 0.6).abs() < 1e-6);
        assert!((entry.vector[1] - 0.8).abs() < 1e-6);

        assert!(matches!(
            index.insert(&mem("b"), vec![1.0, 0.0, 0.0], "b"),
            Err(Error::EmbeddingUnavailable(_))
        ));
        assert!(index.insert(&mem("c"), vec![0.0, 0.0], "c").is_err());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_search_filters_sorts_and_truncates() {
        let mut index = WarmIndex::new(2, 10);
        index.insert(&mem("east"), vec![1.0, 0.0], "east").unwrap();
        index.insert(&mem("north-east"), vec![1.0, 1.0], "ne").unwrap();
        index.insert(&mem("north"), vec![0.0, 1.0], "north").unwrap();
        index.insert(&mem("west"), vec![-1.0, 0.0], "west").unwrap();

        let results = index.search(&[1.0, 0.1], 10, 0.5);
        let ids: Vec<_> = results.iter().map(|m| m.memory_id.clone()).collect();
        assert_eq!(ids, vec![mem("east"), mem("north-east")]);
        assert!(results[0].similarity >= results[1].similarity);

        let top1 = index.search(&[1.0, 0.1], 1, 0.5);
        assert_eq!(top1.len(), 1);
        assert_eq!(top1[0].memory_id, mem("east"));

        assert!(index.search(&[1.0, 0.1], 0, 0.5).is_empty());
        assert!(index.search(&[1.0, 0.0, 0.0], 5, 0.0).is_empty());
    }

    #[test]
    fn test_capacity_bound_evicts_oldest() {
        let mut index = WarmIndex::new(2, 2);
        let now = Utc::now();
        index
            .insert_at(&mem("old"), vec![1.0, 0.0], "old", now - Duration::hours(2))
            .unwrap();
        index
            .insert_at(&mem("mid"), vec![0.0, 1.0], "mid", now - Duration::hours(1))
            .unwrap();
        let outcome = index.insert_at(&mem("new"), vec![1.0, 1.0], "new", now).unwrap();

        assert_eq!(outcome.evicted, 1);
        assert_eq!(index.len(), 2);
        assert!(!index.contains_memory(&mem("old")));
        assert!(index.contains_memory(&mem("new")));
    }

    #[test]
    fn test_evict_older_than() {
        let mut index = WarmIndex::new(2, 10);
        let now = Utc::now();
        index
            .insert_at(&mem("a"), vec![1.0, 0.0], "a", now - Duration::days(10))
            .unwrap();
        index
            .insert_at(&mem("b"), vec![1.0, 0.0], "b", now - Duration::days(8))
            .unwrap();
        index.insert_at(&mem("c"), vec![1.0, 0.0], "c", now).unwrap();

        let evicted = index.evict_older_than(Duration::days(7), now);
        assert_eq!(evicted, 2);
        assert_eq!(index.len(), 1);
        assert!(index.contains_memory(&mem("c")));
    }

    #[test]
    fn test_compress_duplicates_keeps_earliest() {
        let mut index = WarmIndex::new(2, 10);
        let now = Utc::now();
        let first = index
            .insert_at(&mem("dup"), vec![1.0, 0.0], "dup", now - Duration::minutes(5))
            .unwrap();
        index.insert_at(&mem("dup"), vec![1.0, 0.0], "dup", now).unwrap();
        index.insert_at(&mem("dup"), vec![1.0, 0.0], "dup", now).unwrap();
        index.insert_at(&mem("solo"), vec![0.0, 1.0], "solo", now).unwrap();

        assert_eq!(index.len(), 4);
        assert_eq!(index.compress_duplicates(), 2);
        assert_eq!(index.len(), 2);
        assert!(index.get(&first.vector_ref).is_some());
        assert_eq!(index.compress_duplicates(), 0);
    }

    #[test]
    fn test_remove_memory() {
        let mut index = WarmIndex::new(2, 10);
        index.insert(&mem("x"), vec![1.0, 0.0], "x").unwrap();
        index.insert(&mem("x"), vec![1.0, 0.0], "x").unwrap();
        index.insert(&mem("y"), vec![0.0, 1.0], "y").unwrap();

        assert_eq!(index.remove_memory(&mem("x")), 2);
        assert_eq!(index.len(), 1);
        assert_eq!(index.remove_memory(&mem("x")), 0);
    }

    #[test]
    fn test_dirty_tracking() {
        let mut index = WarmIndex::new(2, 10);
        index.insert(&mem("a"), vec![1.0, 0.0], "a").unwrap();
        index.insert(&mem("b"), vec![0.0, 1.0], "b").unwrap();
        let (snapshot, dirty) = index.capture();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(dirty, 2);

        index.insert(&mem("c"), vec![1.0, 1.0], "c").unwrap();
        index.mark_clean(dirty);
        assert_eq!(index.dirty(), 1);
    }

    #[test]
    fn test_from_snapshot_skips_wrong_dimension() {
        let mut source = WarmIndex::new(2, 10);
        source.insert(&mem("a"), vec![1.0, 0.0], "a").unwrap();
        let (mut snapshot, _) = source.capture();
        let mut bad = snapshot.values().next().unwrap().clone();
        bad.vector = vec![1.0, 0.0, 0.0];
        snapshot.insert("vec_bad".to_string(), bad);

        let restored = WarmIndex::from_snapshot(snapshot, 2, 10);
        assert_eq!(restored.len(), 1);
        assert_eq!(restored.dirty(), 0);
        assert!(restored.contains_memory(&mem("a")));
    }
}
