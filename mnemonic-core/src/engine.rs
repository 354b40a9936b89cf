//! The memory engine: the public contract over the three tiers.
//!
//! `remember` commits to the cold store first and only then tries the warm
//! index and hot cache. `recall` cascades Hot -> Warm -> Cold and writes any
//! warm or cold result back into the hot cache. Only cold store failures are
//! returned to the caller; every other tier degrades to the next one.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use mnemonic_core::{EngineConfig, HashEmbedder, InMemoryHotCache, MemoryEngine, Metadata};
//!
//! let engine = MemoryEngine::builder(EngineConfig::from_env())
//!     .with_hot_cache(Arc::new(InMemoryHotCache::new()))
//!     .with_embedder(Arc::new(HashEmbedder::default()))
//!     .build()
//!     .await?;
//!
//! let stored = engine.remember("The sky is blue", Metadata::new()).await?;
//! let found = engine.recall("sky", 5).await?;
//! engine.shutdown().await;
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, info, instrument, warn};

use crate::cache::{HotCache, HotEntry, MAX_TTL_SECS};
use crate::config::EngineConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::memory::{ColdStore, MemoryId, MemoryRecord, Metadata, Tier};
use crate::metrics::{EngineMetrics, TiersSnapshot};
use crate::pressure::{MemorySampler, PressureMonitor, PressureReport, ProcMemorySampler};
use crate::scheduler::{PeriodicJob, Scheduler};
use crate::tiering::{TierManager, TierPolicy, TierTransition, TransitionKind};
use crate::warm::{load_index, SnapshotWriter, WarmIndex};

/// Score given to substring matches from the cold store.
const SUBSTRING_MATCH_SCORE: f32 = 1.0;

/// One recalled record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallHit {
    pub id: MemoryId,
    pub content: String,
    pub metadata: Metadata,
    /// Cosine similarity for warm matches, 1.0 for substring matches
    pub score: f32,
    /// Advisory tier of the record when it was recalled
    pub tier: Tier,
}

impl RecallHit {
    pub fn from_record(record: &MemoryRecord, score: f32) -> Self {
        Self {
            id: record.id.clone(),
            content: record.content.clone(),
            metadata: record.metadata.clone(),
            score,
            tier: record.tier,
        }
    }
}

/// Which tiers accepted a write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierFlags {
    pub hot: bool,
    pub warm: bool,
    pub cold: bool,
}

/// Result of [`MemoryEngine::remember`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RememberOutcome {
    pub id: MemoryId,
    pub tiers: TierFlags,
}

/// Result of [`MemoryEngine::recall`].
#[derive(Debug, Clone)]
pub struct RecallOutcome {
    pub results: Vec<RecallHit>,
    /// Tier that produced the top result, `None` when nothing matched
    pub satisfied_tier: Option<Tier>,
    pub latency: std::time::Duration,
}

impl RecallOutcome {
    fn empty(started: Instant) -> Self {
        Self {
            results: Vec::new(),
            satisfied_tier: None,
            latency: started.elapsed(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn contains(&self, id: &MemoryId) -> bool {
        self.results.iter().any(|hit| &hit.id == id)
    }
}

/// Reachability of one tier at the time of the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Connected,
    Offline,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierAvailability {
    pub hot: Availability,
    pub warm: Availability,
    pub cold: Availability,
}

/// Committed record count per tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierDistribution {
    pub hot: u64,
    pub warm: u64,
    pub cold: u64,
}

impl From<HashMap<Tier, u64>> for TierDistribution {
    fn from(counts: HashMap<Tier, u64>) -> Self {
        let get = |tier| counts.get(&tier).copied().unwrap_or(0);
        Self {
            hot: get(Tier::Hot),
            warm: get(Tier::Warm),
            cold: get(Tier::Cold),
        }
    }
}

/// Result of [`MemoryEngine::stats`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub tiers: TiersSnapshot,
    pub promotions: u64,
    pub demotions: u64,
    /// `None` when the cold store is unreachable
    pub distribution: Option<TierDistribution>,
    pub warm_entries: usize,
    /// Access patterns held in memory
    pub tracked: usize,
    /// Tier of each tracked pattern, ahead of the next sweep's commit
    pub tracked_tiers: TierDistribution,
    pub memory_ratio: Option<f64>,
    pub availability: TierAvailability,
}

/// Result of [`MemoryEngine::optimize`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizeReport {
    pub pressure: PressureReport,
    pub compressed: usize,
    pub vacuumed: bool,
}

/// Result of one tier sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub promotions: usize,
    pub demotions: usize,
    /// Access statistics written back to the cold store
    pub synced: usize,
    /// Tracked ids no longer present in the cold store
    pub dropped: usize,
    pub pruned: usize,
    pub hot_keys_pruned: usize,
}

/// Memory ids cached under one hot key.
#[derive(Debug)]
struct HotKey {
    ids: HashSet<MemoryId>,
    cached_at: DateTime<Utc>,
}

/// Builder for [`MemoryEngine`] with injected collaborators.
pub struct MemoryEngineBuilder {
    config: EngineConfig,
    cold: Option<ColdStore>,
    hot: Option<Arc<dyn HotCache>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    sampler: Option<Arc<dyn MemorySampler>>,
}

impl MemoryEngineBuilder {
    /// Use an already opened cold store instead of opening the configured path.
    pub fn with_cold_store(mut self, store: ColdStore) -> Self {
        self.cold = Some(store);
        self
    }

    pub fn with_hot_cache(mut self, cache: Arc<dyn HotCache>) -> Self {
        self.hot = Some(cache);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_memory_sampler(mut self, sampler: Arc<dyn MemorySampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Open every tier and start background jobs if configured.
    ///
    /// Fails with `Configuration` for invalid settings and
    /// `StorageUnavailable` when the cold store cannot be opened. A missing
    /// or corrupt warm snapshot only yields an empty warm index.
    pub async fn build(self) -> Result<MemoryEngine> {
        let config = self.config;
        config.validate()?;

        if let Some(embedder) = &self.embedder {
            if embedder.dimension() != config.embedding_dim {
                return Err(Error::config(format!(
                    "embedder produces dimension {}, engine configured for {}",
                    embedder.dimension(),
                    config.embedding_dim
                )));
            }
        }

        let cold = match self.cold {
            Some(store) => store,
            None if config.is_in_memory() => ColdStore::in_memory()?,
            None => ColdStore::open(config.resolved_cold_store_path()?)?,
        };

        let snapshot_path = config.resolved_warm_snapshot_path()?;
        let warm = match &snapshot_path {
            Some(path) => load_index(path, config.embedding_dim, config.warm_tier_limit),
            None => WarmIndex::new(config.embedding_dim, config.warm_tier_limit),
        };

        let mut tiers = TierManager::new(TierPolicy::from_config(&config));
        for record in cold.records_in_tiers(&[Tier::Warm, Tier::Hot])? {
            tiers.track_record(&record);
        }

        let warm = Arc::new(RwLock::new(warm));
        let snapshots = snapshot_path
            .map(|path| SnapshotWriter::spawn(warm.clone(), path, config.snapshot_queue_capacity));
        let sampler = self
            .sampler
            .unwrap_or_else(|| Arc::new(ProcMemorySampler::new()) as Arc<dyn MemorySampler>);
        let pressure = PressureMonitor::from_config(&config, sampler);

        info!(
            warm_entries = warm.read().await.len(),
            tracked = tiers.len(),
            hot = self.hot.is_some(),
            semantic = self.embedder.is_some(),
            "Memory engine ready"
        );

        let inner = Arc::new(EngineInner {
            config,
            cold,
            warm,
            tiers: Mutex::new(tiers),
            hot: self.hot,
            embedder: self.embedder,
            pressure,
            metrics: EngineMetrics::new(),
            snapshots,
            hot_keys: Mutex::new(HashMap::new()),
            maintenance: Mutex::new(()),
            operations: RwLock::new(()),
            shutting_down: AtomicBool::new(false),
        });

        let engine = MemoryEngine {
            inner,
            scheduler: Scheduler::new(),
        };
        if engine.inner.config.background_jobs {
            engine.start_jobs();
        }
        Ok(engine)
    }
}

/// Tiered memory: hot TTL cache, warm semantic index, durable cold store.
pub struct MemoryEngine {
    inner: Arc<EngineInner>,
    scheduler: Scheduler,
}

impl MemoryEngine {
    pub fn builder(config: EngineConfig) -> MemoryEngineBuilder {
        MemoryEngineBuilder {
            config,
            cold: None,
            hot: None,
            embedder: None,
            sampler: None,
        }
    }

    /// Engine with only the cold tier.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        Self::builder(config).build().await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Store `content`. Repeating the same content overwrites the same record.
    #[instrument(skip(self, content, metadata), fields(len = content.len()))]
    pub async fn remember(&self, content: &str, metadata: Metadata) -> Result<RememberOutcome> {
        let inner = &self.inner;
        let _op = inner.admit().await?;

        let record = MemoryRecord::new(content, metadata);
        let id = inner.cold.put(&record)?;
        inner.metrics.cold.record_store();

        let warm = inner.store_warm(&record).await;
        let hot = inner.store_hot(&record).await;

        debug!(memory_id = %id, hot, warm, "Remembered");
        Ok(RememberOutcome {
            id,
            tiers: TierFlags {
                hot,
                warm,
                cold: true,
            },
        })
    }

    /// Look up `query`, trying Hot, then Warm, then Cold.
    ///
    /// The hot tier matches the raw query string exactly. A warm result is
    /// only trusted on its own when its best similarity reaches
    /// `warm_confidence_floor`; otherwise cold substring matches are merged in.
    #[instrument(skip(self, query))]
    pub async fn recall(&self, query: &str, top_k: usize) -> Result<RecallOutcome> {
        let inner = &self.inner;
        let _op = inner.admit().await?;
        let started = Instant::now();

        if top_k == 0 || query.trim().is_empty() {
            return Ok(RecallOutcome::empty(started));
        }

        if let Some(hits) = inner.recall_hot(query, top_k).await {
            inner.note_hot_access(&hits).await?;
            return Ok(RecallOutcome {
                results: hits,
                satisfied_tier: Some(Tier::Hot),
                latency: started.elapsed(),
            });
        }

        let mut results = inner.recall_warm(query, top_k).await?;
        let mut satisfied = (!results.is_empty()).then_some(Tier::Warm);

        let confident = results
            .first()
            .map(|hit| hit.score >= inner.config.warm_confidence_floor)
            .unwrap_or(false);
        if !confident {
            let seen: HashSet<MemoryId> = results.iter().map(|hit| hit.id.clone()).collect();
            let cold_hits = inner.recall_cold(query, top_k, &seen)?;
            if !cold_hits.is_empty() {
                satisfied = Some(Tier::Cold);
                results.extend(cold_hits);
                results.sort_by(|a, b| b.score.total_cmp(&a.score));
                results.truncate(top_k);
            }
        }

        if !results.is_empty() {
            inner.note_access(&results).await?;
            inner.cache_results(query, &results).await;
        }

        Ok(RecallOutcome {
            results,
            satisfied_tier: satisfied,
            latency: started.elapsed(),
        })
    }

    /// Delete a record from every tier. Returns whether the cold store had it.
    #[instrument(skip(self, id), fields(memory_id = %id))]
    pub async fn forget(&self, id: &MemoryId) -> Result<bool> {
        let inner = &self.inner;
        let _op = inner.admit().await?;

        let record = inner.cold.get(id)?;
        let existed = inner.cold.delete(id)?;

        let (removed, dirty) = {
            let mut warm = inner.warm.write().await;
            (warm.remove_memory(id), warm.dirty())
        };
        if removed > 0 {
            inner.maybe_schedule_snapshot(dirty);
        }
        inner.tiers.lock().await.untrack(id);

        let ids = HashSet::from([id.clone()]);
        let content_keys = record.map(|r| r.content).into_iter().collect();
        let invalidated = inner.invalidate_hot(&ids, content_keys).await;

        info!(existed, warm_vectors = removed, hot_keys = invalidated, "Forgot memory");
        Ok(existed)
    }

    /// Pressure check, warm compaction and cold vacuum. Safe to repeat;
    /// degraded subsystems are logged, not returned.
    #[instrument(skip(self))]
    pub async fn optimize(&self) -> Result<OptimizeReport> {
        let inner = &self.inner;
        let _op = inner.admit().await?;

        let pressure = inner.check_pressure().await;

        let (compressed, dirty) = {
            let mut warm = inner.warm.write().await;
            (warm.compress_duplicates(), warm.dirty())
        };
        inner.metrics.warm.record_evictions(compressed as u64);
        if dirty > 0 {
            inner.schedule_snapshot();
        }

        let vacuumed = match inner.cold.vacuum() {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Cold store vacuum failed");
                false
            }
        };

        Ok(OptimizeReport {
            pressure,
            compressed,
            vacuumed,
        })
    }

    /// Metrics plus availability probed at call time.
    pub async fn stats(&self) -> Result<EngineStats> {
        let inner = &self.inner;
        let _op = inner.admit().await?;

        let metrics = inner.metrics.snapshot();

        let cold = match inner.cold.ping() {
            Ok(()) => Availability::Connected,
            Err(e) => {
                debug!(error = %e, "Cold store ping failed");
                Availability::Offline
            }
        };
        let distribution = match cold {
            Availability::Connected => inner
                .cold
                .tier_distribution()
                .ok()
                .map(TierDistribution::from),
            _ => None,
        };

        let hot = match &inner.hot {
            None => Availability::Disabled,
            Some(cache) => match cache.ping().await {
                Ok(()) => Availability::Connected,
                Err(e) => {
                    debug!(error = %e, "Hot cache ping failed");
                    Availability::Offline
                }
            },
        };
        let warm = if inner.embedder.is_some() {
            Availability::Connected
        } else {
            Availability::Disabled
        };

        let warm_entries = inner.warm.read().await.len();
        let (tracked, tracked_tiers) = {
            let tiers = inner.tiers.lock().await;
            (tiers.len(), TierDistribution::from(tiers.distribution()))
        };

        Ok(EngineStats {
            tiers: metrics.tiers,
            promotions: metrics.promotions,
            demotions: metrics.demotions,
            distribution,
            warm_entries,
            tracked,
            tracked_tiers,
            memory_ratio: inner.pressure.sample(),
            availability: TierAvailability { hot, warm, cold },
        })
    }

    /// Run one tier sweep now.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let _op = self.inner.admit().await?;
        self.inner.sweep().await
    }

    /// Purge stale, unimportant cold records now. Returns the purge count.
    pub async fn cleanup(&self) -> Result<usize> {
        let _op = self.inner.admit().await?;
        self.inner.cleanup().await
    }

    /// Write the warm snapshot now. Returns the entries written.
    pub async fn flush_snapshot(&self) -> Result<usize> {
        let _op = self.inner.admit().await?;
        match &self.inner.snapshots {
            Some(writer) => writer.flush().await,
            None => Ok(0),
        }
    }

    /// Stop jobs, flush the warm snapshot, close the cold store, then close
    /// the hot cache. Every step is attempted; calling twice is a no-op.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down memory engine");

        // Admitted operations finish before anything is flushed
        let _drained = inner.operations.write().await;

        self.scheduler.shutdown().await;

        if let Some(writer) = &inner.snapshots {
            match writer.shutdown().await {
                Ok(entries) => debug!(entries, "Final warm snapshot written"),
                Err(e) => warn!(error = %e, "Final warm snapshot failed"),
            }
        }
        if let Err(e) = inner.cold.close() {
            warn!(error = %e, "Closing cold store failed");
        }
        if let Some(hot) = &inner.hot {
            if let Err(e) = hot.close().await {
                warn!(error = %e, "Closing hot cache failed");
            }
        }
    }

    fn start_jobs(&self) {
        let config = &self.inner.config;

        let inner = self.inner.clone();
        self.scheduler.spawn(
            PeriodicJob::new("tier-sweep", config.sweep_interval),
            move || {
                let inner = inner.clone();
                async move {
                    if let Err(e) = inner.sweep().await {
                        warn!(error = %e, "Tier sweep failed");
                    }
                }
            },
        );

        let inner = self.inner.clone();
        self.scheduler.spawn(
            PeriodicJob::new("memory-pressure", config.pressure_interval),
            move || {
                let inner = inner.clone();
                async move {
                    inner.check_pressure().await;
                }
            },
        );

        let inner = self.inner.clone();
        self.scheduler.spawn(
            PeriodicJob::new("warm-snapshot", config.snapshot_interval),
            move || {
                let inner = inner.clone();
                async move {
                    if inner.warm.read().await.dirty() > 0 {
                        inner.schedule_snapshot();
                    }
                }
            },
        );

        let inner = self.inner.clone();
        self.scheduler.spawn(
            PeriodicJob::new("cold-cleanup", config.cleanup_interval),
            move || {
                let inner = inner.clone();
                async move {
                    if let Err(e) = inner.cleanup().await {
                        warn!(error = %e, "Cold cleanup failed");
                    }
                }
            },
        );

        debug!(jobs = self.scheduler.job_count(), "Background jobs started");
    }
}

struct EngineInner {
    config: EngineConfig,
    cold: ColdStore,
    warm: Arc<RwLock<WarmIndex>>,
    tiers: Mutex<TierManager>,
    hot: Option<Arc<dyn HotCache>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    pressure: PressureMonitor,
    metrics: EngineMetrics,
    snapshots: Option<SnapshotWriter>,
    hot_keys: Mutex<HashMap<String, HotKey>>,
    /// Serializes sweeps and cleanups
    maintenance: Mutex<()>,
    /// Read side held by every public operation, write side by shutdown
    operations: RwLock<()>,
    shutting_down: AtomicBool,
}

impl EngineInner {
    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    /// Admit one public operation. Shutdown waits for every admitted one.
    async fn admit(&self) -> Result<RwLockReadGuard<'_, ()>> {
        let guard = self.operations.read().await;
        self.ensure_running()?;
        Ok(guard)
    }

    // ==================== Writes ====================

    /// Embed and index a record unless it is already indexed.
    async fn store_warm(&self, record: &MemoryRecord) -> bool {
        let Some(embedder) = &self.embedder else {
            return false;
        };
        if self.warm.read().await.contains_memory(&record.id) {
            return true;
        }

        let vector = match embedder.embed(&record.content).await {
            Ok(vector) => vector,
            Err(e) => {
                warn!(memory_id = %record.id, error = %e, "Embedding failed, record kept cold only");
                return false;
            }
        };

        let (outcome, dirty) = {
            let mut warm = self.warm.write().await;
            if warm.contains_memory(&record.id) {
                return true;
            }
            match warm.insert(&record.id, vector, record.preview(self.config.preview_chars)) {
                Ok(outcome) => (outcome, warm.dirty()),
                Err(e) => {
                    warn!(memory_id = %record.id, error = %e, "Warm insert rejected");
                    return false;
                }
            }
        };

        self.metrics.warm.record_store();
        self.metrics.warm.record_evictions(outcome.evicted as u64);
        if let Err(e) = self.cold.set_embedding_ref(&record.id, Some(&outcome.vector_ref)) {
            warn!(memory_id = %record.id, error = %e, "Could not link warm vector");
        }
        self.maybe_schedule_snapshot(dirty);
        true
    }

    /// Cache a record under its own content.
    async fn store_hot(&self, record: &MemoryRecord) -> bool {
        self.cache_results(&record.content, &[RecallHit::from_record(record, SUBSTRING_MATCH_SCORE)])
            .await
    }

    async fn cache_results(&self, key: &str, hits: &[RecallHit]) -> bool {
        let Some(hot) = &self.hot else {
            return false;
        };
        let bytes = match HotEntry::new(hits.to_vec()).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Could not encode hot entry");
                return false;
            }
        };

        match hot.set_with_ttl(key, bytes, self.config.hot_ttl_secs).await {
            Ok(()) => {
                self.metrics.hot.record_store();
                self.hot_keys.lock().await.insert(
                    key.to_string(),
                    HotKey {
                        ids: hits.iter().map(|hit| hit.id.clone()).collect(),
                        cached_at: Utc::now(),
                    },
                );
                true
            }
            Err(e) => {
                warn!(error = %e, "Hot cache write failed");
                false
            }
        }
    }

    fn maybe_schedule_snapshot(&self, dirty: usize) {
        if dirty >= self.config.snapshot_batch_size {
            self.schedule_snapshot();
        }
    }

    fn schedule_snapshot(&self) {
        if let Some(writer) = &self.snapshots {
            if !writer.schedule() {
                debug!("Warm snapshot already pending");
            }
        }
    }

    // ==================== Reads ====================

    async fn recall_hot(&self, query: &str, top_k: usize) -> Option<Vec<RecallHit>> {
        let hot = self.hot.as_ref()?;

        let cached = match hot.get(query).await {
            Ok(Some(bytes)) => match HotEntry::decode(&bytes) {
                Ok(entry) => Some(entry.hits),
                Err(e) => {
                    warn!(error = %e, "Ignoring unreadable hot entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Hot cache lookup failed, falling through");
                None
            }
        };

        match cached {
            Some(mut hits) if !hits.is_empty() => {
                self.metrics.hot.record_hit();
                hits.truncate(top_k);
                Some(hits)
            }
            _ => {
                self.metrics.hot.record_miss();
                None
            }
        }
    }

    async fn recall_warm(&self, query: &str, top_k: usize) -> Result<Vec<RecallHit>> {
        let Some(embedder) = &self.embedder else {
            return Ok(Vec::new());
        };
        let vector = match embedder.embed(query).await {
            Ok(vector) => vector,
            Err(e) => {
                warn!(error = %e, "Query embedding failed, skipping semantic recall");
                return Ok(Vec::new());
            }
        };

        let matches = self
            .warm
            .read()
            .await
            .search(&vector, usize::MAX, self.config.similarity_threshold);

        let mut seen = HashSet::new();
        let mut stale = Vec::new();
        let mut hits = Vec::new();
        for found in matches {
            if hits.len() >= top_k {
                break;
            }
            if !seen.insert(found.memory_id.clone()) {
                continue;
            }
            match self.cold.get(&found.memory_id)? {
                Some(record) => hits.push(RecallHit::from_record(&record, found.similarity)),
                None => stale.push(found.memory_id),
            }
        }

        if !stale.is_empty() {
            let mut warm = self.warm.write().await;
            for id in &stale {
                warm.remove_memory(id);
            }
            debug!(count = stale.len(), "Dropped warm vectors of deleted records");
        }

        if hits.is_empty() {
            self.metrics.warm.record_miss();
        } else {
            self.metrics.warm.record_hit();
        }
        Ok(hits)
    }

    fn recall_cold(
        &self,
        query: &str,
        top_k: usize,
        exclude: &HashSet<MemoryId>,
    ) -> Result<Vec<RecallHit>> {
        let hits: Vec<RecallHit> = self
            .cold
            .search(query, top_k + exclude.len())?
            .iter()
            .filter(|record| !exclude.contains(&record.id))
            .take(top_k)
            .map(|record| RecallHit::from_record(record, SUBSTRING_MATCH_SCORE))
            .collect();

        if hits.is_empty() {
            self.metrics.cold.record_miss();
        } else {
            self.metrics.cold.record_hit();
        }
        Ok(hits)
    }

    /// Count an access for warm or cold results, both durably and in the
    /// tier manager. Untracked ids are seeded from their pre-access record.
    async fn note_access(&self, hits: &[RecallHit]) -> Result<()> {
        let untracked: Vec<MemoryId> = {
            let tiers = self.tiers.lock().await;
            hits.iter()
                .filter(|hit| !tiers.is_tracked(&hit.id))
                .map(|hit| hit.id.clone())
                .collect()
        };
        let mut seeds = Vec::with_capacity(untracked.len());
        for id in &untracked {
            if let Some(record) = self.cold.get(id)? {
                seeds.push(record);
            }
        }
        for hit in hits {
            self.cold.touch(&hit.id)?;
        }

        let now = Utc::now();
        let mut tiers = self.tiers.lock().await;
        for record in &seeds {
            tiers.track_record(record);
        }
        for hit in hits {
            tiers.record_access_at(&hit.id, now);
        }
        Ok(())
    }

    /// Count an access for hot results without touching the cold store.
    /// Counts reach the cold store on the next sweep. Untracked ids are
    /// seeded from their committed record; ids the store lost are skipped.
    async fn note_hot_access(&self, hits: &[RecallHit]) -> Result<()> {
        let untracked: Vec<MemoryId> = {
            let tiers = self.tiers.lock().await;
            hits.iter()
                .filter(|hit| !tiers.is_tracked(&hit.id))
                .map(|hit| hit.id.clone())
                .collect()
        };
        let mut seeds = Vec::with_capacity(untracked.len());
        let mut absent = HashSet::new();
        for id in untracked {
            match self.cold.get(&id)? {
                Some(record) => seeds.push(record),
                None => {
                    absent.insert(id);
                }
            }
        }

        let now = Utc::now();
        let mut tiers = self.tiers.lock().await;
        for record in &seeds {
            tiers.track_record(record);
        }
        for hit in hits.iter().filter(|hit| !absent.contains(&hit.id)) {
            tiers.record_access_at(&hit.id, now);
        }
        Ok(())
    }

    // ==================== Maintenance ====================

    /// Delete every hot key caching one of `ids`, plus `extra_keys`.
    async fn invalidate_hot(&self, ids: &HashSet<MemoryId>, extra_keys: Vec<String>) -> usize {
        let Some(hot) = &self.hot else {
            return 0;
        };

        let mut keys: HashSet<String> = extra_keys.into_iter().collect();
        self.hot_keys.lock().await.retain(|key, cached| {
            if cached.ids.iter().any(|id| ids.contains(id)) {
                keys.insert(key.clone());
                false
            } else {
                true
            }
        });

        let mut invalidated = 0;
        for key in keys {
            match hot.delete(&key).await {
                Ok(()) => invalidated += 1,
                Err(e) => warn!(error = %e, "Hot cache invalidation failed"),
            }
        }
        invalidated
    }

    /// Drop tracking for hot keys whose TTL has passed.
    async fn prune_hot_keys(&self, now: DateTime<Utc>) -> usize {
        let ttl = Duration::seconds(self.config.hot_ttl_secs.min(MAX_TTL_SECS) as i64);
        let mut keys = self.hot_keys.lock().await;
        let before = keys.len();
        keys.retain(|_, cached| now - cached.cached_at <= ttl);
        before - keys.len()
    }

    async fn check_pressure(&self) -> PressureReport {
        let report = self.pressure.check(&self.warm).await;
        self.metrics
            .warm
            .record_evictions((report.evicted + report.compressed) as u64);
        if report.triggered {
            self.schedule_snapshot();
        }
        report
    }

    /// Write in-memory access counts back to the cold store. Returns the
    /// number synced and the ids the store no longer has.
    fn sync_pending(&self, pending: Vec<(MemoryId, u64, DateTime<Utc>)>) -> Result<(usize, Vec<MemoryId>)> {
        let mut synced = 0;
        let mut absent = Vec::new();
        for (id, count, at) in pending {
            if self.cold.sync_access(&id, count, at)? {
                synced += 1;
            } else {
                absent.push(id);
            }
        }
        Ok((synced, absent))
    }

    async fn sweep(&self) -> Result<SweepReport> {
        let _maintenance = self.maintenance.lock().await;
        let now = Utc::now();
        let mut report = SweepReport::default();

        let pending = self.tiers.lock().await.take_unsynced();
        let (synced, mut missing) = self.sync_pending(pending)?;
        report.synced = synced;

        let plan = self.tiers.lock().await.plan_sweep(now);
        for transition in plan {
            if missing.contains(&transition.id) {
                continue;
            }
            if !self.cold.set_tier(&transition.id, transition.to)? {
                missing.push(transition.id.clone());
                continue;
            }
            let applied = self.tiers.lock().await.apply(&transition);
            if !applied {
                continue;
            }

            match transition.kind {
                TransitionKind::Promotion => {
                    self.metrics.record_promotion();
                    report.promotions += 1;
                }
                TransitionKind::Demotion => {
                    self.metrics.record_demotion();
                    report.demotions += 1;
                }
            }
            debug!(
                memory_id = %transition.id,
                from = %transition.from,
                to = %transition.to,
                "Tier transition"
            );
            self.apply_transition_effects(&transition).await?;
        }

        {
            let mut tiers = self.tiers.lock().await;
            for id in &missing {
                tiers.untrack(id);
            }
            report.dropped = missing.len();
            report.pruned = tiers.prune_idle(now);
        }
        report.hot_keys_pruned = self.prune_hot_keys(now).await;

        if report.promotions + report.demotions + report.dropped > 0 {
            info!(
                promotions = report.promotions,
                demotions = report.demotions,
                dropped = report.dropped,
                "Tier sweep complete"
            );
        }
        Ok(report)
    }

    async fn apply_transition_effects(&self, transition: &TierTransition) -> Result<()> {
        match (transition.from, transition.to) {
            (Tier::Cold, Tier::Warm) => {
                if self.embedder.is_some() && !self.warm.read().await.contains_memory(&transition.id)
                {
                    if let Some(record) = self.cold.get(&transition.id)? {
                        self.store_warm(&record).await;
                    }
                }
            }
            (Tier::Warm, Tier::Hot) => {
                if self.hot.is_some() {
                    if let Some(record) = self.cold.get(&transition.id)? {
                        self.store_hot(&record).await;
                    }
                }
            }
            (Tier::Warm, Tier::Cold) => {
                let (removed, dirty) = {
                    let mut warm = self.warm.write().await;
                    (warm.remove_memory(&transition.id), warm.dirty())
                };
                if removed > 0 {
                    self.cold.set_embedding_ref(&transition.id, None)?;
                    self.metrics.warm.record_evictions(removed as u64);
                    self.maybe_schedule_snapshot(dirty);
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<usize> {
        let _maintenance = self.maintenance.lock().await;

        // Pending accesses must land before staleness is judged
        let pending = self.tiers.lock().await.take_unsynced();
        let (_, absent) = self.sync_pending(pending)?;

        let purged = self.cold.purge_stale(
            Duration::days(self.config.retention_days),
            self.config.cleanup_importance_floor,
            Utc::now(),
        )?;

        {
            let mut tiers = self.tiers.lock().await;
            for id in purged.iter().chain(absent.iter()) {
                tiers.untrack(id);
            }
        }
        if purged.is_empty() {
            return Ok(0);
        }

        let dirty = {
            let mut warm = self.warm.write().await;
            for id in &purged {
                warm.remove_memory(id);
            }
            warm.dirty()
        };
        self.maybe_schedule_snapshot(dirty);

        let ids: HashSet<MemoryId> = purged.iter().cloned().collect();
        self.invalidate_hot(&ids, Vec::new()).await;

        if let Err(e) = self.cold.vacuum() {
            warn!(error = %e, "Vacuum after cleanup failed");
        }
        Ok(purged.len())
    }
}
