//! SQLite-backed cold store: the durable source of truth.

use crate::error::{Error, Result};
use crate::memory::schema::{initialize_schema, is_initialized};
use crate::memory::types::*;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const RECORD_COLUMNS: &str = "id, content, metadata, embedding_ref, created_at, accessed_at,
                              access_count, importance, tier";

/// Durable relational store for [`MemoryRecord`]s.
///
/// All statements run under one connection mutex, so writes to the same id
/// are strictly ordered. `put` is an upsert keyed by the content-addressed
/// id and returns only after SQLite has committed it to the WAL.
#[derive(Clone)]
pub struct ColdStore {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl ColdStore {
    /// Open or create a cold store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::storage(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| Error::storage(e.to_string()))?;
        if !is_initialized(&conn) {
            initialize_schema(&conn)?;
        }
        info!(path = %path.display(), "Opened cold store");

        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::storage(e.to_string()))?;
        initialize_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let guard = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
        let conn = guard
            .as_ref()
            .ok_or_else(|| Error::storage("cold store is closed"))?;
        f(conn).map_err(|e| Error::storage(e.to_string()))
    }

    // ==================== Record Operations ====================

    /// Insert or overwrite a record by id.
    ///
    /// On conflict the content, metadata, importance and access time are
    /// replaced; creation time, access count and tier are preserved, and an
    /// existing embedding reference survives a put without one.
    pub fn put(&self, record: &MemoryRecord) -> Result<MemoryId> {
        let metadata = serde_json::to_string(&record.metadata)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO records (
                    id, content, metadata, embedding_ref, created_at, accessed_at,
                    access_count, importance, tier
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(id) DO UPDATE SET
                    content = excluded.content,
                    metadata = excluded.metadata,
                    embedding_ref = COALESCE(excluded.embedding_ref, records.embedding_ref),
                    accessed_at = excluded.accessed_at,
                    importance = excluded.importance",
                params![
                    record.id.as_str(),
                    record.content,
                    metadata,
                    record.embedding_ref.as_ref().map(|r| r.as_str()),
                    format_datetime(record.created_at),
                    format_datetime(record.accessed_at),
                    record.access_count as i64,
                    record.importance,
                    record.tier as i64,
                ],
            )?;
            Ok(())
        })?;
        debug!(memory_id = %record.id, "Committed record to cold store");
        Ok(record.id.clone())
    }

    /// Get a record by id.
    pub fn get(&self, id: &MemoryId) -> Result<Option<MemoryRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM records WHERE id = ?1", RECORD_COLUMNS),
                params![id.as_str()],
                Self::row_to_record,
            )
            .optional()
        })
    }

    /// Substring search over content and metadata.
    ///
    /// Ranked by importance, then access count, then recency. Matching is
    /// SQLite `LIKE` (ASCII case-insensitive), not semantic.
    pub fn search(&self, text: &str, limit: usize) -> Result<Vec<MemoryRecord>> {
        let pattern = format!("%{}%", escape_like(text));
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM records
                 WHERE content LIKE ?1 ESCAPE '\\' OR metadata LIKE ?1 ESCAPE '\\'
                 ORDER BY importance DESC, access_count DESC, accessed_at DESC
                 LIMIT ?2",
                RECORD_COLUMNS
            ))?;

            let records = stmt
                .query_map(params![pattern, limit as i64], Self::row_to_record)?
                .filter_map(|r| r.ok())
                .collect();

            Ok(records)
        })
    }

    /// Record one access: bump the counter and the access time.
    pub fn touch(&self, id: &MemoryId) -> Result<bool> {
        self.with_conn(|conn| {
            let rows = conn.execute(
                "UPDATE records SET access_count = access_count + 1, accessed_at = ?2
                 WHERE id = ?1",
                params![id.as_str(), format_datetime(Utc::now())],
            )?;
            Ok(rows > 0)
        })
    }

    /// Persist access statistics tracked in memory, never moving them backwards.
    pub fn sync_access(&self, id: &MemoryId, access_count: u64, at: DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let rows = conn.execute(
                "UPDATE records SET access_count = MAX(access_count, ?2),
                                    accessed_at = MAX(accessed_at, ?3)
                 WHERE id = ?1",
                params![id.as_str(), access_count as i64, format_datetime(at)],
            )?;
            Ok(rows > 0)
        })
    }

    /// Commit a tier transition.
    pub fn set_tier(&self, id: &MemoryId, tier: Tier) -> Result<bool> {
        self.with_conn(|conn| {
            let rows = conn.execute(
                "UPDATE records SET tier = ?2 WHERE id = ?1",
                params![id.as_str(), tier as i64],
            )?;
            Ok(rows > 0)
        })
    }

    /// Set or clear the warm index back-reference.
    pub fn set_embedding_ref(&self, id: &MemoryId, vector_ref: Option<&VectorRef>) -> Result<bool> {
        self.with_conn(|conn| {
            let rows = conn.execute(
                "UPDATE records SET embedding_ref = ?2 WHERE id = ?1",
                params![id.as_str(), vector_ref.map(|r| r.as_str())],
            )?;
            Ok(rows > 0)
        })
    }

    /// Delete a record.
    pub fn delete(&self, id: &MemoryId) -> Result<bool> {
        self.with_conn(|conn| {
            let rows = conn.execute("DELETE FROM records WHERE id = ?1", params![id.as_str()])?;
            Ok(rows > 0)
        })
    }

    /// Hard-delete cold-tier records that are both stale and unimportant.
    ///
    /// This is the only automatic deletion. Returns the purged ids.
    pub fn purge_stale(
        &self,
        retention: Duration,
        importance_floor: f64,
        now: DateTime<Utc>,
    ) -> Result<Vec<MemoryId>> {
        let cutoff = format_datetime(now - retention);
        let purged = self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let ids: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM records
                     WHERE accessed_at < ?1 AND importance < ?2 AND tier = ?3",
                )?;
                let rows = stmt.query_map(
                    params![cutoff, importance_floor, Tier::Cold as i64],
                    |row| row.get(0),
                )?;
                rows.filter_map(|r| r.ok()).collect()
            };
            for id in &ids {
                tx.execute("DELETE FROM records WHERE id = ?1", params![id])?;
            }
            tx.commit()?;
            Ok(ids)
        })?;

        if !purged.is_empty() {
            info!(count = purged.len(), "Purged stale cold records");
        }
        Ok(purged.into_iter().map(MemoryId::from_raw).collect())
    }

    /// Checkpoint the WAL and reclaim free pages.
    pub fn vacuum(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
            conn.execute_batch("VACUUM")?;
            Ok(())
        })
    }

    /// Records currently in one of the given tiers.
    pub fn records_in_tiers(&self, tiers: &[Tier]) -> Result<Vec<MemoryRecord>> {
        if tiers.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<String> = tiers.iter().map(|_| "?".to_string()).collect();
        let sql = format!(
            "SELECT {} FROM records WHERE tier IN ({})",
            RECORD_COLUMNS,
            placeholders.join(",")
        );
        let tier_values: Vec<i64> = tiers.iter().map(|t| *t as i64).collect();

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let records = stmt
                .query_map(rusqlite::params_from_iter(tier_values), Self::row_to_record)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(records)
        })
    }

    /// Total number of records.
    pub fn count(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
            Ok(count as u64)
        })
    }

    /// Number of records per committed tier.
    pub fn tier_distribution(&self) -> Result<HashMap<Tier, u64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT tier, COUNT(*) FROM records GROUP BY tier")?;
            let rows = stmt.query_map([], |row| {
                let tier: i64 = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((Tier::from_i64(tier), count as u64))
            })?;

            let mut distribution: HashMap<Tier, u64> =
                Tier::ALL.iter().map(|t| (*t, 0)).collect();
            for (tier, count) in rows.filter_map(|r| r.ok()) {
                *distribution.entry(tier).or_insert(0) += count;
            }
            Ok(distribution)
        })
    }

    /// Cheap liveness probe.
    pub fn ping(&self) -> Result<()> {
        self.with_conn(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))
            .map(|_| ())
    }

    /// Close the underlying connection. Later calls fail with `StorageUnavailable`.
    pub fn close(&self) -> Result<()> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
        if let Some(conn) = guard.take() {
            conn.close()
                .map_err(|(_, e)| Error::storage(format!("close failed: {}", e)))?;
            info!("Closed cold store");
        }
        Ok(())
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<MemoryRecord> {
        let metadata: Metadata = row
            .get::<_, Option<String>>(2)?
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();

        Ok(MemoryRecord {
            id: MemoryId::from_raw(row.get::<_, String>(0)?),
            content: row.get(1)?,
            metadata,
            embedding_ref: row.get::<_, Option<String>>(3)?.map(VectorRef),
            created_at: parse_datetime(row.get::<_, String>(4)?),
            accessed_at: parse_datetime(row.get::<_, String>(5)?),
            access_count: row.get::<_, i64>(6)?.max(0) as u64,
            importance: row.get(7)?,
            tier: Tier::from_i64(row.get(8)?),
        })
    }
}

/// Fixed-width UTC timestamps so text ordering matches time ordering.
fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(content: &str, importance: f64) -> MemoryRecord {
        MemoryRecord::new(content, Metadata::new()).with_importance(importance)
    }

    #[test]
    fn test_put_and_get() {
        let store = ColdStore::in_memory().unwrap();
        let rec = record("The sky is blue", 0.9).with_metadata("source", "observation");

        let id = store.put(&rec).unwrap();
        let loaded = store.get(&id).unwrap().unwrap();

        assert_eq!(loaded.content, "The sky is blue");
        assert_eq!(loaded.metadata.get("source"), Some(&json!("observation")));
        assert!((loaded.importance - 0.9).abs() < 1e-9);
        assert_eq!(loaded.tier, Tier::Cold);
    }

    #[test]
    fn test_put_is_idempotent_upsert() {
        let store = ColdStore::in_memory().unwrap();
        let first = record("same content", 0.4);
        store.put(&first).unwrap();
        store.touch(&first.id).unwrap();
        store.set_tier(&first.id, Tier::Warm).unwrap();

        let second = record("same content", 0.8);
        let id = store.put(&second).unwrap();

        assert_eq!(id, first.id);
        assert_eq!(store.count().unwrap(), 1);

        let loaded = store.get(&id).unwrap().unwrap();
        assert!((loaded.importance - 0.8).abs() < 1e-9);
        assert_eq!(loaded.access_count, 1);
        assert_eq!(loaded.tier, Tier::Warm);
    }

    #[test]
    fn test_put_keeps_existing_embedding_ref() {
        let store = ColdStore::in_memory().unwrap();
        let rec = record("vectorised", 0.5);
        let vref = VectorRef::derive(&rec.id, Utc::now());
        store.put(&rec.clone().with_embedding_ref(vref.clone())).unwrap();

        store.put(&rec).unwrap();
        let loaded = store.get(&rec.id).unwrap().unwrap();
        assert_eq!(loaded.embedding_ref, Some(vref));
    }

    #[test]
    fn test_search_is_substring_and_ranked() {
        let store = ColdStore::in_memory().unwrap();
        let low = record("the sky at night", 0.2);
        let high = record("The sky is blue", 0.9);
        let other = record("Grass is green", 1.0);
        store.put(&low).unwrap();
        store.put(&high).unwrap();
        store.put(&other).unwrap();

        let results = store.search("sky", 10).unwrap();
        let ids: Vec<_> = results.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec![high.id, low.id]);
    }

    #[test]
    fn test_search_ties_break_on_access_count() {
        let store = ColdStore::in_memory().unwrap();
        let a = record("apple pie", 0.5);
        let b = record("apple tart", 0.5);
        store.put(&a).unwrap();
        store.put(&b).unwrap();
        store.touch(&b.id).unwrap();

        let results = store.search("apple", 10).unwrap();
        assert_eq!(results[0].id, b.id);
    }

    #[test]
    fn test_search_matches_metadata_and_escapes_wildcards() {
        let store = ColdStore::in_memory().unwrap();
        store
            .put(&record("deploy notes", 0.5).with_metadata("project", "orion"))
            .unwrap();
        store.put(&record("100% done", 0.5)).unwrap();
        store.put(&record("1000 items", 0.5)).unwrap();

        assert_eq!(store.search("orion", 10).unwrap().len(), 1);
        let pct = store.search("0%", 10).unwrap();
        assert_eq!(pct.len(), 1);
        assert_eq!(pct[0].content, "100% done");
    }

    #[test]
    fn test_search_respects_limit() {
        let store = ColdStore::in_memory().unwrap();
        for i in 0..5 {
            store.put(&record(&format!("note {}", i), 0.5)).unwrap();
        }
        assert_eq!(store.search("note", 3).unwrap().len(), 3);
    }

    #[test]
    fn test_touch_and_delete() {
        let store = ColdStore::in_memory().unwrap();
        let rec = record("ephemeral", 0.5);
        store.put(&rec).unwrap();

        assert!(store.touch(&rec.id).unwrap());
        assert!(store.touch(&rec.id).unwrap());
        assert_eq!(store.get(&rec.id).unwrap().unwrap().access_count, 2);

        assert!(store.delete(&rec.id).unwrap());
        assert!(!store.delete(&rec.id).unwrap());
        assert!(store.get(&rec.id).unwrap().is_none());
        assert!(!store.touch(&rec.id).unwrap());
    }

    #[test]
    fn test_sync_access_never_regresses() {
        let store = ColdStore::in_memory().unwrap();
        let rec = record("tracked", 0.5);
        store.put(&rec).unwrap();
        store.sync_access(&rec.id, 7, Utc::now()).unwrap();
        store
            .sync_access(&rec.id, 3, Utc::now() - Duration::days(3))
            .unwrap();

        let loaded = store.get(&rec.id).unwrap().unwrap();
        assert_eq!(loaded.access_count, 7);
        assert!(Utc::now() - loaded.accessed_at < Duration::minutes(1));
    }

    #[test]
    fn test_purge_stale_only_removes_old_unimportant_cold() {
        let store = ColdStore::in_memory().unwrap();
        let old = Utc::now() - Duration::days(45);

        let mut stale = record("stale trivia", 0.1);
        stale.accessed_at = old;
        let mut important = record("old but important", 0.9);
        important.accessed_at = old;
        let mut warm = record("old unimportant warm", 0.1).with_tier(Tier::Warm);
        warm.accessed_at = old;
        let fresh = record("fresh trivia", 0.1);

        for r in [&stale, &important, &warm, &fresh] {
            store.put(r).unwrap();
        }

        let purged = store.purge_stale(Duration::days(30), 0.3, Utc::now()).unwrap();
        assert_eq!(purged, vec![stale.id.clone()]);
        assert_eq!(store.count().unwrap(), 3);
    }

    #[test]
    fn test_tier_distribution_and_records_in_tiers() {
        let store = ColdStore::in_memory().unwrap();
        store.put(&record("a", 0.5)).unwrap();
        store.put(&record("b", 0.5).with_tier(Tier::Warm)).unwrap();
        store.put(&record("c", 0.5).with_tier(Tier::Hot)).unwrap();

        let dist = store.tier_distribution().unwrap();
        assert_eq!(dist[&Tier::Cold], 1);
        assert_eq!(dist[&Tier::Warm], 1);
        assert_eq!(dist[&Tier::Hot], 1);

        let tracked = store.records_in_tiers(&[Tier::Warm, Tier::Hot]).unwrap();
        assert_eq!(tracked.len(), 2);
    }

    #[test]
    fn test_close_makes_store_unavailable() {
        let store = ColdStore::in_memory().unwrap();
        assert!(store.ping().is_ok());
        store.close().unwrap();
        assert!(matches!(store.ping(), Err(Error::StorageUnavailable(_))));
        assert!(matches!(
            store.put(&record("late", 0.5)),
            Err(Error::StorageUnavailable(_))
        ));
        // Closing twice is harmless
        store.close().unwrap();
    }

    #[test]
    fn test_durable_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cold.db");
        let rec = record("survives restart", 0.7);

        {
            let store = ColdStore::open(&path).unwrap();
            store.put(&rec).unwrap();
            store.set_tier(&rec.id, Tier::Warm).unwrap();
            store.close().unwrap();
        }

        let store = ColdStore::open(&path).unwrap();
        let loaded = store.get(&rec.id).unwrap().unwrap();
        assert_eq!(loaded.content, "survives restart");
        assert_eq!(loaded.tier, Tier::Warm);
        store.vacuum().unwrap();
    }
}
