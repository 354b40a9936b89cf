//! # mnemonic-core
//!
//! A tiered memory engine for agents: fast recall of stored knowledge with
//! durability across restarts.
//!
//! ## Tiers
//!
//! - **Hot**: external TTL cache, exact-key lookups (optional)
//! - **Warm**: in-memory vector index ranked by exact cosine similarity,
//!   snapshotted to disk (optional, needs an embedding provider)
//! - **Cold**: SQLite store, the single source of truth, substring search
//!
//! A `TierManager` promotes frequently read records and demotes idle ones;
//! a `PressureMonitor` discards old warm vectors when process memory runs high.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use mnemonic_core::{EngineConfig, HashEmbedder, MemoryEngine, Metadata};
//!
//! let engine = MemoryEngine::builder(EngineConfig::ephemeral())
//!     .with_embedder(Arc::new(HashEmbedder::default()))
//!     .build()
//!     .await?;
//!
//! let stored = engine.remember("The sky is blue", Metadata::new()).await?;
//! let recalled = engine.recall("sky", 5).await?;
//! assert!(recalled.contains(&stored.id));
//! ```

pub mod cache;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod pressure;
mod proptest;
pub mod scheduler;
pub mod tiering;
pub mod warm;

// Re-exports for convenience
pub use cache::{HotCache, HotEntry, InMemoryHotCache};
pub use config::EngineConfig;
pub use embedding::{EmbeddingProvider, HashEmbedder, OpenAIEmbedder, OpenAIEmbedderConfig};
pub use engine::{
    Availability, EngineStats, MemoryEngine, MemoryEngineBuilder, OptimizeReport, RecallHit,
    RecallOutcome, RememberOutcome, SweepReport, TierAvailability, TierDistribution, TierFlags,
};
pub use error::{Error, Result};
pub use memory::{ColdStore, MemoryId, MemoryRecord, Metadata, Tier, VectorRef};
pub use metrics::{EngineMetrics, MetricsSnapshot, TierMetrics, TierMetricsSnapshot, TiersSnapshot};
pub use pressure::{MemorySampler, PressureMonitor, PressureReport, ProcMemorySampler};
pub use scheduler::{PeriodicJob, Scheduler};
pub use tiering::{AccessPattern, TierManager, TierPolicy, TierTransition, TransitionKind};
pub use warm::{cosine_similarity, SnapshotWriter, VectorEntry, WarmIndex, WarmMatch};
