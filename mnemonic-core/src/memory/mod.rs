//! Durable cold tier and the record model shared by every tier.
//!
//! The cold store is the single authority for a record: the warm index and
//! hot cache only ever hold copies that can be rebuilt from it.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mnemonic_core::memory::{ColdStore, MemoryRecord, Metadata};
//!
//! let store = ColdStore::in_memory()?;
//! let record = MemoryRecord::new("The API uses JWT for auth", Metadata::new())
//!     .with_importance(0.9);
//! store.put(&record)?;
//!
//! let results = store.search("JWT", 10)?;
//! ```

mod schema;
mod store;
mod types;

pub use schema::{get_schema_version, initialize_schema, is_initialized, SCHEMA_VERSION};
pub use store::ColdStore;
pub use types::{
    truncate_chars, MemoryId, MemoryRecord, Metadata, Tier, VectorRef, DEFAULT_IMPORTANCE,
    IMPORTANCE_KEY,
};
