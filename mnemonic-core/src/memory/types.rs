//! Core memory types: MemoryId, MemoryRecord, Tier, VectorRef.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Opaque key/value metadata attached to a record.
pub type Metadata = HashMap<String, Value>;

/// Importance assigned when the caller supplies none.
pub const DEFAULT_IMPORTANCE: f64 = 0.5;

/// Metadata key read by [`MemoryRecord::new`] to set importance.
pub const IMPORTANCE_KEY: &str = "importance";

/// Content-addressed memory identifier.
///
/// Derived from the SHA-256 of the content, so storing the same content twice
/// always lands on the same row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryId(String);

impl MemoryId {
    /// Derive the id for a piece of content.
    pub fn from_content(content: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        Self(format!("mem_{:x}", hasher.finalize()))
    }

    /// Wrap an id read back from storage.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MemoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for MemoryId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Storage tier of a record.
///
/// Advisory only: a record in `Hot` is still present in Warm and Cold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Cold = 0,
    Warm = 1,
    Hot = 2,
}

impl Tier {
    /// Tier one step faster, if any.
    pub fn promoted(self) -> Option<Tier> {
        match self {
            Tier::Cold => Some(Tier::Warm),
            Tier::Warm => Some(Tier::Hot),
            Tier::Hot => None,
        }
    }

    /// Tier one step slower, if any.
    pub fn demoted(self) -> Option<Tier> {
        match self {
            Tier::Hot => Some(Tier::Warm),
            Tier::Warm => Some(Tier::Cold),
            Tier::Cold => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
        }
    }

    /// Parse the stored column value; unknown values fall back to Cold.
    pub fn from_i64(value: i64) -> Tier {
        match value {
            2 => Tier::Hot,
            1 => Tier::Warm,
            _ => Tier::Cold,
        }
    }

    pub const ALL: [Tier; 3] = [Tier::Hot, Tier::Warm, Tier::Cold];
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Link from a record to its vector entry in the warm index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorRef(pub String);

impl VectorRef {
    /// Vector entry id for a memory inserted at `at`.
    pub fn derive(memory_id: &MemoryId, at: DateTime<Utc>) -> Self {
        let hash = memory_id.as_str().trim_start_matches("mem_");
        let prefix = &hash[..hash.len().min(16)];
        Self(format!("vec_{}_{}", prefix, at.timestamp_millis()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VectorRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable unit of knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: MemoryId,
    pub content: String,
    pub metadata: Metadata,
    pub embedding_ref: Option<VectorRef>,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub access_count: u64,
    /// Caller-supplied weight in [0, 1]
    pub importance: f64,
    /// Last committed advisory tier
    pub tier: Tier,
}

impl MemoryRecord {
    /// Create a record for `content`. Importance is taken from the
    /// `importance` metadata key when it holds a number.
    pub fn new(content: impl Into<String>, metadata: Metadata) -> Self {
        let content = content.into();
        let now = Utc::now();
        let importance = metadata
            .get(IMPORTANCE_KEY)
            .and_then(Value::as_f64)
            .unwrap_or(DEFAULT_IMPORTANCE);

        Self {
            id: MemoryId::from_content(&content),
            content,
            metadata,
            embedding_ref: None,
            created_at: now,
            accessed_at: now,
            access_count: 0,
            importance: clamp_importance(importance),
            tier: Tier::Cold,
        }
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = clamp_importance(importance);
        self
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_embedding_ref(mut self, vector_ref: VectorRef) -> Self {
        self.embedding_ref = Some(vector_ref);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Truncated content used as the warm index preview.
    pub fn preview(&self, max_chars: usize) -> String {
        truncate_chars(&self.content, max_chars)
    }
}

fn clamp_importance(value: f64) -> f64 {
    if value.is_nan() {
        DEFAULT_IMPORTANCE
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Truncate to at most `max_chars` characters without splitting a char.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_id_is_deterministic() {
        let a = MemoryId::from_content("The sky is blue");
        let b = MemoryId::from_content("The sky is blue");
        let c = MemoryId::from_content("The sky is grey");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("mem_"));
    }

    #[test]
    fn test_importance_from_metadata() {
        let mut meta = Metadata::new();
        meta.insert("importance".into(), json!(0.9));
        let record = MemoryRecord::new("fact", meta);
        assert!((record.importance - 0.9).abs() < 1e-9);

        let record = MemoryRecord::new("fact", Metadata::new());
        assert!((record.importance - DEFAULT_IMPORTANCE).abs() < 1e-9);
    }

    #[test]
    fn test_importance_is_clamped() {
        let record = MemoryRecord::new("x", Metadata::new()).with_importance(4.0);
        assert_eq!(record.importance, 1.0);
        let record = MemoryRecord::new("x", Metadata::new()).with_importance(f64::NAN);
        assert_eq!(record.importance, DEFAULT_IMPORTANCE);
    }

    #[test]
    fn test_tier_transitions() {
        assert_eq!(Tier::Cold.promoted(), Some(Tier::Warm));
        assert_eq!(Tier::Warm.promoted(), Some(Tier::Hot));
        assert_eq!(Tier::Hot.promoted(), None);
        assert_eq!(Tier::Hot.demoted(), Some(Tier::Warm));
        assert_eq!(Tier::Cold.demoted(), None);
        assert_eq!(Tier::from_i64(Tier::Warm as i64), Tier::Warm);
        assert_eq!(Tier::from_i64(42), Tier::Cold);
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        let record = MemoryRecord::new("héllo wörld", Metadata::new());
        assert_eq!(record.preview(4), "héll");
        assert_eq!(record.preview(100), "héllo wörld");
    }

    #[test]
    fn test_vector_ref_derivation() {
        let id = MemoryId::from_content("abc");
        let at = Utc::now();
        let r = VectorRef::derive(&id, at);
        assert!(r.as_str().starts_with("vec_"));
        assert!(r.as_str().ends_with(&at.timestamp_millis().to_string()));
    }
}
