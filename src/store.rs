//! Durable vector store: one SQLite row per note with its embedding.
//!
//! Every mutation is a single statement, so a concurrent reader sees either the
//! old row or the new one. The database runs in WAL mode and each call takes its
//! own pooled connection, which lets searches proceed while the pipeline writes.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info};

use crate::embeddings::cosine_similarity;
use crate::error::StorageError;
use crate::types::{IndexedNote, StoredState};

const POOL_SIZE: u32 = 8;

const NOTE_COLUMNS: &str = "id, uuid, title, plaintext, html, creation_time, modify_time,
     is_pinned, embedding, content_hash, indexed_at, trashed";

/// A stored note paired with its similarity to a query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredNote {
    pub note: IndexedNote,
    pub score: f32,
}

pub struct VectorStore {
    pool: Pool<SqliteConnectionManager>,
    dimensions: usize,
    path: PathBuf,
}

impl VectorStore {
    /// Open (or create) the store at `path`.
    ///
    /// Fails if the file was created with a different embedding dimensionality.
    pub fn open(path: &Path, dimensions: usize) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(path).with_init(|c| {
            c.execute_batch(
                "PRAGMA busy_timeout = 5000;
                 PRAGMA synchronous = NORMAL;",
            )
        });
        let pool = Pool::builder().max_size(POOL_SIZE).build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS notes (
                id            TEXT    PRIMARY KEY,
                uuid          TEXT    NOT NULL,
                title         TEXT    NOT NULL,
                plaintext     TEXT    NOT NULL,
                html          TEXT    NOT NULL,
                creation_time INTEGER NOT NULL,
                modify_time   INTEGER NOT NULL,
                is_pinned     INTEGER NOT NULL,
                embedding     BLOB    NOT NULL,
                content_hash  TEXT    NOT NULL,
                indexed_at    INTEGER NOT NULL,
                trashed       INTEGER NOT NULL DEFAULT 0
             );
             CREATE INDEX IF NOT EXISTS idx_notes_trashed ON notes(trashed);",
        )?;

        let stored: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'dimensions'", [], |row| row.get(0))
            .optional()?;
        match stored.and_then(|s| s.parse::<usize>().ok()) {
            Some(existing) if existing != dimensions => {
                return Err(StorageError::DimensionMismatch {
                    expected: dimensions,
                    got: existing,
                });
            }
            Some(_) => {}
            None => {
                conn.execute(
                    "INSERT OR REPLACE INTO meta (key, value) VALUES ('dimensions', ?1)",
                    [dimensions.to_string()],
                )?;
            }
        }
        drop(conn);

        info!(path = %path.display(), dimensions, "vector store ready");
        Ok(Self {
            pool,
            dimensions,
            path: path.to_path_buf(),
        })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        Ok(self.pool.get()?)
    }

    /// Insert or replace the row for `note.id`.
    pub fn upsert(&self, note: &IndexedNote) -> Result<(), StorageError> {
        if note.embedding.len() != self.dimensions {
            return Err(StorageError::DimensionMismatch {
                expected: self.dimensions,
                got: note.embedding.len(),
            });
        }

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO notes (id, uuid, title, plaintext, html, creation_time, modify_time,
                                is_pinned, embedding, content_hash, indexed_at, trashed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                uuid = excluded.uuid,
                title = excluded.title,
                plaintext = excluded.plaintext,
                html = excluded.html,
                creation_time = excluded.creation_time,
                modify_time = excluded.modify_time,
                is_pinned = excluded.is_pinned,
                embedding = excluded.embedding,
                content_hash = excluded.content_hash,
                indexed_at = excluded.indexed_at,
                trashed = excluded.trashed",
            params![
                note.id,
                note.uuid,
                note.title,
                note.plaintext,
                note.html,
                note.creation_time,
                note.modify_time,
                note.is_pinned,
                encode_embedding(&note.embedding),
                note.content_hash,
                note.indexed_at,
                note.trashed,
            ],
        )?;
        Ok(())
    }

    /// Remove the row if present. Returns whether a row was removed.
    pub fn delete(&self, id: &str) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM notes WHERE id = ?1", [id])?;
        Ok(removed > 0)
    }

    /// Flag or unflag a row as trashed without touching its embedding.
    pub fn set_trashed(&self, id: &str, trashed: bool) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE notes SET trashed = ?2 WHERE id = ?1",
            params![id, trashed],
        )?;
        Ok(changed > 0)
    }

    pub fn get(&self, id: &str) -> Result<Option<IndexedNote>, StorageError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {NOTE_COLUMNS} FROM notes WHERE id = ?1");
        let raw = conn.query_row(&sql, [id], raw_note).optional()?;
        raw.map(RawNote::decode).transpose()
    }

    pub fn all_ids(&self) -> Result<HashSet<String>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM notes")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    /// Stored hash and trash flag per id.
    pub fn index_state(&self) -> Result<HashMap<String, StoredState>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, content_hash, trashed FROM notes")?;
        let state = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    StoredState {
                        content_hash: row.get(1)?,
                        trashed: row.get(2)?,
                    },
                ))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(state)
    }

    /// Number of searchable (non-trashed) rows.
    pub fn count(&self) -> Result<usize, StorageError> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM notes WHERE trashed = 0", [], |row| {
            row.get(0)
        })?;
        Ok(n as usize)
    }

    /// Top-`limit` non-trashed rows by cosine similarity to `query`.
    /// Ties go to the most recently modified note, then to the smaller id.
    pub fn search(&self, query: &[f32], limit: usize) -> Result<Vec<ScoredNote>, StorageError> {
        self.search_excluding(query, limit, None)
    }

    /// Like [`VectorStore::search`], leaving out the row `exclude`.
    pub fn search_excluding(
        &self,
        query: &[f32],
        limit: usize,
        exclude: Option<&str>,
    ) -> Result<Vec<ScoredNote>, StorageError> {
        if query.len() != self.dimensions {
            return Err(StorageError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn()?;
        // One read transaction: scoring and row fetches see the same snapshot.
        let tx = conn.transaction()?;

        let mut candidates: Vec<(String, i64, f32)> = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT id, modify_time, embedding FROM notes WHERE trashed = 0 AND id IS NOT ?1",
            )?;
            let mut rows = stmt.query([exclude])?;
            while let Some(row) = rows.next()? {
                let id: String = row.get(0)?;
                let modify_time: i64 = row.get(1)?;
                let blob: Vec<u8> = row.get(2)?;
                let embedding = decode_embedding(&blob)
                    .ok_or_else(|| StorageError::CorruptEmbedding(id.clone()))?;
                let score = cosine_similarity(query, &embedding);
                candidates.push((id, modify_time, score));
            }
        }

        candidates.sort_by(|a, b| {
            b.2.total_cmp(&a.2)
                .then_with(|| b.1.cmp(&a.1))
                .then_with(|| a.0.cmp(&b.0))
        });
        candidates.truncate(limit);

        let sql = format!("SELECT {NOTE_COLUMNS} FROM notes WHERE id = ?1");
        let mut stmt = tx.prepare(&sql)?;
        let mut results = Vec::with_capacity(candidates.len());
        for (id, _, score) in candidates {
            if let Some(raw) = stmt.query_row([&id], raw_note).optional()? {
                results.push(ScoredNote {
                    note: raw.decode()?,
                    score,
                });
            }
        }
        drop(stmt);
        tx.commit()?;

        debug!(hits = results.len(), "vector search done");
        Ok(results)
    }

    /// Record that a full indexing cycle completed at `at_ms`.
    pub fn mark_cycle_completed(&self, at_ms: i64) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('last_completed_at', ?1)",
            [at_ms.to_string()],
        )?;
        Ok(())
    }

    pub fn last_completed_at(&self) -> Result<Option<i64>, StorageError> {
        let conn = self.conn()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'last_completed_at'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.and_then(|v| v.parse().ok()))
    }
}

/// Row as read from SQLite, embedding still encoded.
struct RawNote {
    note: IndexedNote,
    blob: Vec<u8>,
}

impl RawNote {
    fn decode(mut self) -> Result<IndexedNote, StorageError> {
        self.note.embedding = decode_embedding(&self.blob)
            .ok_or_else(|| StorageError::CorruptEmbedding(self.note.id.clone()))?;
        Ok(self.note)
    }
}

fn raw_note(row: &Row<'_>) -> rusqlite::Result<RawNote> {
    Ok(RawNote {
        note: IndexedNote {
            id: row.get(0)?,
            uuid: row.get(1)?,
            title: row.get(2)?,
            plaintext: row.get(3)?,
            html: row.get(4)?,
            creation_time: row.get(5)?,
            modify_time: row.get(6)?,
            is_pinned: row.get(7)?,
            embedding: Vec::new(),
            content_hash: row.get(9)?,
            indexed_at: row.get(10)?,
            trashed: row.get(11)?,
        },
        blob: row.get(8)?,
    })
}

fn encode_embedding(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn note(id: &str, embedding: Vec<f32>, modify_time: i64) -> IndexedNote {
        IndexedNote {
            id: id.to_string(),
            uuid: format!("uuid-{id}"),
            title: format!("title {id}"),
            plaintext: format!("body {id}"),
            html: String::new(),
            creation_time: 1,
            modify_time,
            is_pinned: false,
            embedding,
            content_hash: format!("hash-{id}"),
            indexed_at: 10,
            trashed: false,
        }
    }

    fn open(dir: &tempfile::TempDir) -> VectorStore {
        VectorStore::open(&dir.path().join("index.sqlite"), 3).unwrap()
    }

    #[test]
    fn upsert_inserts_then_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);

        store.upsert(&note("a", vec![1.0, 0.0, 0.0], 1)).unwrap();
        let mut updated = note("a", vec![0.0, 1.0, 0.0], 2);
        updated.content_hash = "hash-a-2".to_string();
        store.upsert(&updated).unwrap();

        let stored = store.get("a").unwrap().unwrap();
        assert_eq!(stored, updated);
        assert_eq!(store.all_ids().unwrap().len(), 1);
    }

    #[test]
    fn upsert_rejects_wrong_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);

        let result = store.upsert(&note("a", vec![1.0, 0.0], 1));
        assert!(matches!(
            result,
            Err(StorageError::DimensionMismatch { expected: 3, got: 2 })
        ));
        assert!(store.all_ids().unwrap().is_empty());
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        store.upsert(&note("a", vec![1.0, 0.0, 0.0], 1)).unwrap();

        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert!(!store.delete("never-existed").unwrap());
    }

    #[test]
    fn reopening_with_other_dimensions_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.sqlite");
        drop(VectorStore::open(&path, 3).unwrap());

        let result = VectorStore::open(&path, 384);
        assert!(matches!(result, Err(StorageError::DimensionMismatch { .. })));
    }

    #[test]
    fn search_orders_by_score_then_recency() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);

        store.upsert(&note("far", vec![0.0, 1.0, 0.0], 50)).unwrap();
        store.upsert(&note("old", vec![1.0, 0.0, 0.0], 10)).unwrap();
        store.upsert(&note("new", vec![2.0, 0.0, 0.0], 20)).unwrap();
        store.upsert(&note("mid", vec![1.0, 1.0, 0.0], 30)).unwrap();

        let hits = store.search(&[1.0, 0.0, 0.0], 10).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.note.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old", "mid", "far"]);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert_eq!(hits[0].note.embedding, vec![2.0, 0.0, 0.0]);
    }

    #[test]
    fn search_respects_limit_and_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        for i in 0..10 {
            store
                .upsert(&note(&format!("n{i}"), vec![1.0, i as f32 * 0.1, 0.0], i))
                .unwrap();
        }

        let first = store.search(&[1.0, 0.0, 0.0], 3).unwrap();
        let second = store.search(&[1.0, 0.0, 0.0], 3).unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
        assert_eq!(first[0].note.id, "n0");
        assert!(store.search(&[1.0, 0.0, 0.0], 0).unwrap().is_empty());
    }

    #[test]
    fn trashed_rows_are_kept_but_not_searched() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        store.upsert(&note("a", vec![1.0, 0.0, 0.0], 1)).unwrap();
        store.upsert(&note("b", vec![0.9, 0.1, 0.0], 1)).unwrap();

        assert!(store.set_trashed("a", true).unwrap());
        let hits = store.search(&[1.0, 0.0, 0.0], 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].note.id, "b");
        assert!(store.all_ids().unwrap().contains("a"));
        assert_eq!(store.count().unwrap(), 1);
        assert!(store.index_state().unwrap()["a"].trashed);
    }

    #[test]
    fn excluded_row_is_left_out_of_results() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        store.upsert(&note("self", vec![1.0, 0.0, 0.0], 1)).unwrap();
        store.upsert(&note("near", vec![0.9, 0.1, 0.0], 1)).unwrap();
        store.upsert(&note("far", vec![0.0, 1.0, 0.0], 1)).unwrap();

        let hits = store.search_excluding(&[1.0, 0.0, 0.0], 10, Some("self")).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.note.id.as_str()).collect();
        assert_eq!(ids, vec!["near", "far"]);
        assert_eq!(store.search_excluding(&[1.0, 0.0, 0.0], 10, None).unwrap().len(), 3);
    }

    #[test]
    fn query_dimension_mismatch_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        assert!(store.search(&[1.0, 0.0], 5).is_err());
    }

    #[test]
    fn last_completed_at_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        assert_eq!(store.last_completed_at().unwrap(), None);
        store.mark_cycle_completed(1_700_000_000_000).unwrap();
        assert_eq!(store.last_completed_at().unwrap(), Some(1_700_000_000_000));
    }

    #[test]
    fn concurrent_writers_and_readers() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open(&dir));

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let id = format!("w{w}-{i}");
                        store.upsert(&note(&id, vec![1.0, w as f32, i as f32], i)).unwrap();
                    }
                })
            })
            .collect();
        let reader = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..25 {
                    for hit in store.search(&[1.0, 0.0, 0.0], 5).unwrap() {
                        assert_eq!(hit.note.embedding.len(), 3);
                    }
                }
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();
        assert_eq!(store.all_ids().unwrap().len(), 100);
    }
}
