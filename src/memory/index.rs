//! SQLite-backed similarity index over dialogue memories
//!
//! One row per dialogue record, keyed by turn index. Queries rank every
//! stored embedding by cosine similarity. All rusqlite work runs on the
//! blocking pool so a slow disk never stalls the chat loop.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::embeddings::cosine_similarity;
use crate::types::{MemoryEntry, ScoredMemory};

/// SQLite-based similarity index
pub struct SimilarityIndex {
    conn: Arc<Mutex<Connection>>,
}

impl SimilarityIndex {
    /// Open the index inside `dir`, creating it if needed
    pub async fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir)
            .await
            .context("Failed to create index directory")?;

        let db_path = dir.join("index.db");
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(db_path).context("Failed to open similarity index")?;
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
            Self::init_schema(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| anyhow!("join error: {}", e))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS memories (
                turn_index INTEGER PRIMARY KEY,
                id TEXT NOT NULL,
                document TEXT NOT NULL,
                embedding BLOB NOT NULL
            );
        "#,
        )?;
        Ok(())
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| anyhow!("similarity index lock poisoned"))?;
            f(&conn)
        })
        .await
        .map_err(|e| anyhow!("join error: {}", e))?
    }

    /// Store an entry; re-adding the same turn index replaces it
    pub async fn add(&self, entry: &MemoryEntry) -> Result<()> {
        let turn_index = entry.turn_index;
        let document = entry.document.clone();
        let blob = embedding_to_blob(&entry.embedding);
        self.with_conn(move |conn| {
            conn.execute(
                r#"INSERT OR REPLACE INTO memories (turn_index, id, document, embedding)
                   VALUES (?1, ?2, ?3, ?4)"#,
                params![turn_index as i64, format!("turn_{}", turn_index), document, blob],
            )?;
            Ok(())
        })
        .await
    }

    /// The `k` entries most similar to `query`, best first
    pub async fn query(&self, query: &[f32], k: usize) -> Result<Vec<ScoredMemory>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let query = query.to_vec();
        let mut results = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare_cached("SELECT turn_index, document, embedding FROM memories")?;
                let scored = stmt
                    .query_map([], |row| {
                        let turn_index: i64 = row.get(0)?;
                        let document: String = row.get(1)?;
                        let blob: Vec<u8> = row.get(2)?;
                        Ok((turn_index as u64, document, blob_to_embedding(&blob)))
                    })?
                    .collect::<Result<Vec<_>, _>>()?
                    .into_iter()
                    .map(|(turn_index, document, embedding)| ScoredMemory {
                        turn_index,
                        document,
                        score: cosine_similarity(&query, &embedding),
                    })
                    .collect::<Vec<_>>();
                Ok(scored)
            })
            .await?;

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.turn_index.cmp(&a.turn_index))
        });
        results.truncate(k);

        Ok(results)
    }

    pub async fn count(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }

    /// Turn indexes below `limit` that have no entry
    pub async fn missing_below(&self, limit: u64) -> Result<Vec<u64>> {
        let present = self
            .with_conn(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT turn_index FROM memories WHERE turn_index < ?1 ORDER BY turn_index")?;
                let present = stmt
                    .query_map(params![limit as i64], |row| row.get::<_, i64>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(present)
            })
            .await?;

        let mut present = present.into_iter().map(|i| i as u64).peekable();
        let mut missing = Vec::new();
        for idx in 0..limit {
            if present.peek() == Some(&idx) {
                present.next();
            } else {
                missing.push(idx);
            }
        }
        Ok(missing)
    }

    /// Drop entries whose record is not in the log
    pub async fn prune_from(&self, limit: u64) -> Result<usize> {
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM memories WHERE turn_index >= ?1", params![limit as i64])?;
            Ok(removed)
        })
        .await
    }
}

/// Convert embedding vector to binary blob
fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        blob.extend_from_slice(&val.to_le_bytes());
    }
    blob
}

/// Convert binary blob to embedding vector
fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(turn_index: u64, document: &str, embedding: Vec<f32>) -> MemoryEntry {
        MemoryEntry {
            turn_index,
            document: document.to_string(),
            embedding,
        }
    }

    #[tokio::test]
    async fn test_query_ranks_by_cosine() {
        let dir = tempfile::tempdir().unwrap();
        let index = SimilarityIndex::open(dir.path()).await.unwrap();
        index.add(&entry(0, "x axis", vec![1.0, 0.0])).await.unwrap();
        index.add(&entry(1, "y axis", vec![0.0, 1.0])).await.unwrap();
        index.add(&entry(2, "diagonal", vec![1.0, 1.0])).await.unwrap();

        let results = index.query(&[1.0, 0.1], 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].document, "x axis");
        assert_eq!(results[1].document, "diagonal");
        assert!(results[0].score >= results[1].score);
    }

    #[tokio::test]
    async fn test_query_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let index = SimilarityIndex::open(dir.path()).await.unwrap();
        assert!(index.query(&[1.0, 0.0], 3).await.unwrap().is_empty());
        assert!(index.query(&[1.0, 0.0], 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_and_prune() {
        let dir = tempfile::tempdir().unwrap();
        let index = SimilarityIndex::open(dir.path()).await.unwrap();
        index.add(&entry(0, "a", vec![1.0])).await.unwrap();
        index.add(&entry(2, "c", vec![1.0])).await.unwrap();
        index.add(&entry(7, "stray", vec![1.0])).await.unwrap();

        assert_eq!(index.missing_below(4).await.unwrap(), vec![1, 3]);
        assert_eq!(index.prune_from(4).await.unwrap(), 1);
        assert_eq!(index.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_busy_connection_does_not_stall_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let index = SimilarityIndex::open(dir.path()).await.unwrap();
        index.add(&entry(0, "a", vec![1.0])).await.unwrap();

        // Simulate a long-running statement holding the connection
        let busy = index.conn.lock().unwrap();
        let waited = tokio::time::timeout(std::time::Duration::from_millis(50), index.count()).await;
        assert!(waited.is_err());
        drop(busy);

        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[test]
    fn test_blob_roundtrip() {
        let v = vec![0.25f32, -1.5, 3.0];
        assert_eq!(blob_to_embedding(&embedding_to_blob(&v)), v);
    }
}
