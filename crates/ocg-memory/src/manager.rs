use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use rusqlite::Connection;
use tracing::{debug, info, instrument, warn};

use crate::db::{blob_to_vector, init_db, vector_to_blob};
use crate::embed::Embedder;
use crate::error::{MemoryError, Result};
use crate::index::VectorIndex;
use crate::keyword::KeywordIndex;
use crate::types::{MemoryRow, SearchHit};

/// The memory store: SQLite rows as the source of truth, with the HNSW and
/// keyword indices kept in step. Index write failures mark the row
/// `pending_reindex` and still succeed — recall quality degrades, durability
/// does not.
pub struct MemoryStore {
    db: Mutex<Connection>,
    vectors: VectorIndex,
    keywords: RwLock<KeywordIndex>,
    embedder: Arc<dyn Embedder>,
    index_path: Option<PathBuf>,
}

impl MemoryStore {
    /// Open the store, rebuild both indices from SQL, and re-index any rows
    /// left pending by an earlier index failure.
    pub fn new(
        conn: Connection,
        embedder: Arc<dyn Embedder>,
        index_path: Option<PathBuf>,
    ) -> Result<Self> {
        init_db(&conn)?;
        let store = Self {
            db: Mutex::new(conn),
            vectors: VectorIndex::new(embedder.dim()),
            keywords: RwLock::new(KeywordIndex::new()),
            embedder,
            index_path,
        };
        store.init_indices()?;
        let reindexed = store.reindex_pending()?;
        if reindexed > 0 {
            info!(reindexed, "pending memory rows re-indexed on startup");
        }
        Ok(store)
    }

    /// Bring both indices up from disk: the keyword index always rebuilds
    /// from SQL; the vector index restores its snapshot when it matches the
    /// row count, otherwise a full rebuild runs.
    fn init_indices(&self) -> Result<()> {
        let rows = self.all_rows()?;
        let indexed: Vec<&MemoryRow> = rows.iter().filter(|r| !r.pending_reindex).collect();

        let mut keywords = KeywordIndex::new();
        for row in &indexed {
            keywords.add(row.id, &row.content);
        }
        *self.keywords.write().unwrap() = keywords;

        if let Some(ref path) = self.index_path {
            if path.exists() {
                match self.vectors.load(path) {
                    Ok(n) if n == indexed.len() => {
                        debug!(entries = n, "vector index restored from snapshot");
                        return Ok(());
                    }
                    Ok(n) => {
                        warn!(loaded = n, expected = indexed.len(), "index snapshot stale — rebuilding")
                    }
                    Err(e) => warn!(error = %e, "index snapshot unreadable — rebuilding"),
                }
            }
        }
        self.vectors
            .rebuild(indexed.iter().map(|r| (r.id, r.vector.clone())).collect())
    }

    /// Store a memory. SQL first, indices after; an index failure downgrades
    /// to `pending_reindex` and the id is still returned.
    #[instrument(skip(self, content, tags), fields(len = content.len()))]
    pub async fn store(
        &self,
        content: &str,
        tags: &[String],
        source_session_key: Option<&str>,
    ) -> Result<i64> {
        let vector = self.embedder.embed(content).await?;
        if vector.len() != self.vectors.dim() {
            return Err(MemoryError::DimensionMismatch {
                expected: self.vectors.dim(),
                got: vector.len(),
            });
        }

        let now = chrono::Utc::now().to_rfc3339();
        let tags_json = serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string());
        let id = {
            let db = self.db.lock().unwrap();
            db.execute(
                "INSERT INTO memory_rows
                 (content, vector, tags, created_at, source_session_key, pending_reindex)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0)",
                rusqlite::params![
                    content,
                    vector_to_blob(&vector),
                    tags_json,
                    now,
                    source_session_key
                ],
            )?;
            db.last_insert_rowid()
        };

        if let Err(e) = self.index_row(id, content, vector) {
            warn!(id, error = %e, "index write failed — row marked pending_reindex");
            let db = self.db.lock().unwrap();
            db.execute(
                "UPDATE memory_rows SET pending_reindex = 1 WHERE id = ?1",
                [id],
            )?;
        }

        debug!(id, "memory stored");
        Ok(id)
    }

    /// Hybrid search: `score = alpha * vector + (1 - alpha) * keyword`.
    ///
    /// Keyword scores are normalized against the best keyword hit; entries
    /// below `min_score` are dropped; results are deduped by id and sorted
    /// best first.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        min_score: f32,
        alpha: f32,
    ) -> Result<Vec<SearchHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let query_vec = self.embedder.embed(query).await?;
        let vector_hits = self.vectors.search(&query_vec, k)?;
        let keyword_hits = {
            let keywords = self.keywords.read().unwrap();
            keywords.search(query, k)
        };

        let kw_max = keyword_hits
            .iter()
            .map(|(_, s)| *s)
            .fold(0.0f32, f32::max)
            .max(f32::EPSILON);

        let mut blended: std::collections::HashMap<i64, f32> = std::collections::HashMap::new();
        for (id, score) in &vector_hits {
            *blended.entry(*id).or_insert(0.0) += alpha * score;
        }
        for (id, score) in &keyword_hits {
            *blended.entry(*id).or_insert(0.0) += (1.0 - alpha) * (score / kw_max);
        }

        let mut scored: Vec<(i64, f32)> = blended
            .into_iter()
            .filter(|(_, score)| *score >= min_score)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        let mut hits = Vec::with_capacity(scored.len());
        for (id, score) in scored {
            // the index may briefly know ids the store has already deleted
            if let Ok(row) = self.get(id) {
                hits.push(SearchHit {
                    id,
                    content: row.content,
                    score,
                });
            }
        }
        Ok(hits)
    }

    pub fn get(&self, id: i64) -> Result<MemoryRow> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, content, vector, tags, created_at, source_session_key, pending_reindex
             FROM memory_rows WHERE id = ?1",
            [id],
            row_to_memory,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => MemoryError::NotFound { id },
            other => MemoryError::Database(other),
        })
    }

    /// Delete a memory from the store and both indices. The HNSW side is a
    /// tombstone until the next rebuild.
    #[instrument(skip(self))]
    pub fn delete(&self, id: i64) -> Result<()> {
        let n = {
            let db = self.db.lock().unwrap();
            db.execute("DELETE FROM memory_rows WHERE id = ?1", [id])?
        };
        if n == 0 {
            return Err(MemoryError::NotFound { id });
        }
        self.vectors.remove(id);
        self.keywords.write().unwrap().remove(id);
        debug!(id, "memory deleted");
        Ok(())
    }

    /// Rebuild both indices from the authoritative SQL rows.
    pub fn rebuild(&self) -> Result<()> {
        let rows = self.all_rows()?;
        let vectors: Vec<(i64, Vec<f32>)> = rows
            .iter()
            .filter(|r| !r.pending_reindex)
            .map(|r| (r.id, r.vector.clone()))
            .collect();
        self.vectors.rebuild(vectors)?;

        let mut keywords = KeywordIndex::new();
        for row in rows.iter().filter(|r| !r.pending_reindex) {
            keywords.add(row.id, &row.content);
        }
        *self.keywords.write().unwrap() = keywords;
        Ok(())
    }

    /// Re-index rows flagged by an earlier index failure. Their vectors are
    /// already persisted, so no embedding call is needed.
    pub fn reindex_pending(&self) -> Result<usize> {
        let pending: Vec<MemoryRow> = {
            let db = self.db.lock().unwrap();
            let mut stmt = db.prepare(
                "SELECT id, content, vector, tags, created_at, source_session_key, pending_reindex
                 FROM memory_rows WHERE pending_reindex = 1",
            )?;
            let rows = stmt.query_map([], row_to_memory)?;
            rows.filter_map(|r| r.ok()).collect()
        };

        let mut done = 0usize;
        for row in pending {
            match self.index_row(row.id, &row.content, row.vector.clone()) {
                Ok(()) => {
                    let db = self.db.lock().unwrap();
                    db.execute(
                        "UPDATE memory_rows SET pending_reindex = 0 WHERE id = ?1",
                        [row.id],
                    )?;
                    done += 1;
                }
                Err(e) => warn!(id = row.id, error = %e, "reindex still failing"),
            }
        }
        Ok(done)
    }

    /// Persist the vector index snapshot, when a path is configured.
    pub fn save_snapshot(&self) -> Result<()> {
        if let Some(ref path) = self.index_path {
            self.vectors.save(path)?;
        }
        Ok(())
    }

    /// `(sql_rows, live_index_entries)` — rows ≥ live entries always holds.
    pub fn stats(&self) -> Result<(u64, u64)> {
        let rows: i64 = {
            let db = self.db.lock().unwrap();
            db.query_row("SELECT COUNT(*) FROM memory_rows", [], |r| r.get(0))?
        };
        Ok((rows as u64, self.vectors.live_len() as u64))
    }

    fn index_row(&self, id: i64, content: &str, vector: Vec<f32>) -> Result<()> {
        self.vectors.insert(id, vector)?;
        self.keywords.write().unwrap().add(id, content);
        Ok(())
    }

    fn all_rows(&self) -> Result<Vec<MemoryRow>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, content, vector, tags, created_at, source_session_key, pending_reindex
             FROM memory_rows ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_memory)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRow> {
    let tags_json: String = row.get(3)?;
    Ok(MemoryRow {
        id: row.get(0)?,
        content: row.get(1)?,
        vector: blob_to_vector(&row.get::<_, Vec<u8>>(2)?),
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        created_at: row.get(4)?,
        source_session_key: row.get(5)?,
        pending_reindex: row.get::<_, i64>(6)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    const DIM: usize = 32;

    /// Deterministic bag-of-words embedder: each token lights one bucket.
    struct MockEmbedder;

    #[async_trait]
    impl Embedder for MockEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut v = vec![0.0f32; DIM];
            for token in crate::keyword::tokenize(text) {
                let mut hasher = DefaultHasher::new();
                token.hash(&mut hasher);
                v[(hasher.finish() % DIM as u64) as usize] += 1.0;
            }
            Ok(v)
        }

        fn dim(&self) -> usize {
            DIM
        }
    }

    fn store() -> MemoryStore {
        MemoryStore::new(
            Connection::open_in_memory().unwrap(),
            Arc::new(MockEmbedder),
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn stored_content_is_findable_with_high_self_similarity() {
        let store = store();
        let id = store.store("the quick brown fox", &[], None).await.unwrap();
        let hits = store.search("the quick brown fox", 1, 0.2, 0.5).await.unwrap();
        assert_eq!(hits[0].id, id);
        assert!(hits[0].score >= 0.9, "self-similarity was {}", hits[0].score);
    }

    #[tokio::test]
    async fn hybrid_search_prefers_overlapping_document() {
        let store = store();
        let fox = store.store("the quick brown fox", &[], None).await.unwrap();
        let dog = store.store("lazy dog in the sun", &[], None).await.unwrap();

        let hits = store.search("quick fox", 2, 0.2, 0.5).await.unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].id, fox);
        if let Some(second) = hits.iter().find(|h| h.id == dog) {
            assert!(hits[0].score > second.score);
        }
    }

    #[tokio::test]
    async fn delete_then_search_misses_then_new_store_is_findable() {
        let store = store();
        let id = store.store("remember the milk", &[], None).await.unwrap();
        store.delete(id).unwrap();

        let hits = store.search("remember the milk", 3, 0.2, 0.5).await.unwrap();
        assert!(hits.iter().all(|h| h.id != id));

        let id2 = store.store("remember the milk", &[], None).await.unwrap();
        assert_ne!(id, id2);
        let hits = store.search("remember the milk", 3, 0.2, 0.5).await.unwrap();
        assert_eq!(hits[0].id, id2);
    }

    #[tokio::test]
    async fn pending_rows_are_reindexed() {
        let store = store();
        let id = store.store("orphaned fact", &[], None).await.unwrap();
        // simulate an index loss: flag the row and wipe both indices
        {
            let db = store.db.lock().unwrap();
            db.execute("UPDATE memory_rows SET pending_reindex = 1 WHERE id = ?1", [id])
                .unwrap();
        }
        store.vectors.rebuild(Vec::new()).unwrap();
        *store.keywords.write().unwrap() = KeywordIndex::new();

        assert!(store.search("orphaned fact", 2, 0.2, 0.5).await.unwrap().is_empty());
        assert_eq!(store.reindex_pending().unwrap(), 1);
        let hits = store.search("orphaned fact", 2, 0.2, 0.5).await.unwrap();
        assert_eq!(hits[0].id, id);
    }

    #[tokio::test]
    async fn snapshot_restores_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("mem.db");
        let idx_path = dir.path().join("mem.hnsw");

        let store = MemoryStore::new(
            Connection::open(&db_path).unwrap(),
            Arc::new(MockEmbedder),
            Some(idx_path.clone()),
        )
        .unwrap();
        let id = store.store("persistent fact", &[], None).await.unwrap();
        store.save_snapshot().unwrap();
        drop(store);

        let store = MemoryStore::new(
            Connection::open(&db_path).unwrap(),
            Arc::new(MockEmbedder),
            Some(idx_path),
        )
        .unwrap();
        let hits = store.search("persistent fact", 1, 0.2, 0.5).await.unwrap();
        assert_eq!(hits[0].id, id);
    }

    #[tokio::test]
    async fn sql_row_count_dominates_live_index_size() {
        let store = store();
        for i in 0..5 {
            store.store(&format!("note number {i}"), &[], None).await.unwrap();
        }
        store.delete(2).unwrap();
        let (rows, live) = store.stats().unwrap();
        assert_eq!(rows, 4);
        assert!(rows >= live || live == 4);
    }
}
