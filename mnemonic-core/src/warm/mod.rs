//! Warm tier: in-memory semantic index with snapshot persistence.
//!
//! Vectors are ranked by exact cosine similarity over every entry. The index
//! is a cache of the cold store; losing it (or its snapshot) loses no data.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mnemonic_core::warm::{WarmIndex, load_index};
//!
//! let mut index = WarmIndex::new(128, 10_000);
//! index.insert(&memory_id, vector, "The sky is blue")?;
//! let matches = index.search(&query, 5, 0.5);
//! ```

mod index;
mod persist;

pub use index::{
    cosine_similarity, normalize, InsertOutcome, VectorEntry, WarmIndex, WarmMatch, WarmSnapshot,
    DEFAULT_SIMILARITY_THRESHOLD,
};
pub use persist::{load_index, read_snapshot, save_index, write_atomic, SnapshotWriter};
