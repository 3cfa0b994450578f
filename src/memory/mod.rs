//! Persistent Memory Module
//!
//! Provides:
//! - Durable append-only dialogue log (source of truth for the record count)
//! - Vector embeddings for semantic search (Ollama or hash fallback)
//! - SQLite similarity index with cosine ranking
//!
//! Writes go log-first, index-second. The index may lag the log after a
//! crash and is backfilled at startup; it never holds an entry the log
//! does not.

pub mod dialogue_log;
pub mod embeddings;
pub mod index;

use anyhow::Result;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub use dialogue_log::DialogueLog;
pub use embeddings::{cosine_similarity, Embedder, EmbeddingConfig, EmbeddingModel, EmbeddingProvider};
pub use index::SimilarityIndex;

use crate::error::EvolutionError;
use crate::types::{DialogueRecord, MemoryEntry};

/// Memory store configuration
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Path of the JSONL dialogue log
    pub log_path: PathBuf,
    /// Directory holding the similarity index
    pub index_dir: PathBuf,
    /// Upper bound on each embed / query call
    pub call_timeout: Duration,
}

impl MemoryConfig {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            log_path: config.paths.dialogue_log(),
            index_dir: config.paths.index_dir(),
            call_timeout: Duration::from_secs(config.embedding.timeout_secs),
        }
    }
}

/// Main memory store combining the dialogue log and the similarity index
pub struct MemoryStore {
    log: Mutex<DialogueLog>,
    log_path: PathBuf,
    /// Mirror of the log's record count for lock-free reads
    count: AtomicU64,
    index: SimilarityIndex,
    embedder: Arc<dyn Embedder>,
    call_timeout: Duration,
}

impl MemoryStore {
    /// Open the log and index, rebuilding the count and backfilling index lag
    pub async fn open(config: MemoryConfig, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let log = DialogueLog::open(&config.log_path)?;
        let index = SimilarityIndex::open(&config.index_dir).await?;
        let store = Self::from_parts(log, index, embedder, config.call_timeout);
        store.reconcile_index().await;
        Ok(store)
    }

    fn from_parts(
        log: DialogueLog,
        index: SimilarityIndex,
        embedder: Arc<dyn Embedder>,
        call_timeout: Duration,
    ) -> Self {
        let count = log.count();
        let log_path = log.path().to_path_buf();
        Self {
            log: Mutex::new(log),
            log_path,
            count: AtomicU64::new(count),
            index,
            embedder,
            call_timeout,
        }
    }

    /// Bring the index in line with the log; failures only leave it lagging
    async fn reconcile_index(&self) {
        let count = self.count();

        match self.index.prune_from(count).await {
            Ok(0) => {}
            Ok(n) => warn!("Removed {} index entries with no dialogue record", n),
            Err(e) => warn!("Could not prune similarity index: {}", e),
        }

        let missing = match self.index.missing_below(count).await {
            Ok(missing) => missing,
            Err(e) => {
                warn!("Could not inspect similarity index: {}", e);
                return;
            }
        };
        if missing.is_empty() {
            return;
        }

        info!("Backfilling {} dialogue records into the similarity index", missing.len());
        let records = match DialogueLog::read_prefix(&self.log_path, count) {
            Ok(records) => records,
            Err(e) => {
                warn!("Could not read dialogue log for backfill: {}", e);
                return;
            }
        };
        for record in records.iter().filter(|r| missing.binary_search(&r.turn_index).is_ok()) {
            if let Err(e) = self.index_record(record).await {
                warn!(kind = e.kind(), "Backfill stopped at turn {}: {}", record.turn_index, e);
                return;
            }
        }
    }

    /// Durably record an exchange, then index it
    ///
    /// Returns once the log line is durable. An indexing failure is logged
    /// and leaves the record unindexed until the next startup.
    pub async fn append(&self, user_text: &str, agent_text: &str) -> Result<DialogueRecord> {
        let record = {
            let mut log = self.log.lock().await;
            let record = log.append(user_text, agent_text)?;
            self.count.store(log.count(), Ordering::SeqCst);
            record
        };
        debug!("Appended dialogue record {}", record.turn_index);

        if let Err(e) = self.index_record(&record).await {
            warn!(kind = e.kind(), "Record {} not indexed: {}", record.turn_index, e);
        }

        Ok(record)
    }

    async fn index_record(&self, record: &DialogueRecord) -> Result<(), EvolutionError> {
        let document = record.document();
        let embedding = self.embed_bounded(&document).await?;
        let entry = MemoryEntry::from_record(record, embedding);
        tokio::time::timeout(self.call_timeout, self.index.add(&entry))
            .await
            .map_err(|_| EvolutionError::RetrievalUnavailable("index write timed out".to_string()))?
            .map_err(|e| EvolutionError::RetrievalUnavailable(e.to_string()))
    }

    async fn embed_bounded(&self, text: &str) -> Result<Vec<f32>, EvolutionError> {
        match tokio::time::timeout(self.call_timeout, self.embedder.embed(text)).await {
            Ok(Ok(embedding)) => Ok(embedding),
            Ok(Err(e)) => Err(EvolutionError::RetrievalUnavailable(e.to_string())),
            Err(_) => Err(EvolutionError::RetrievalUnavailable(format!(
                "embedding timed out after {:?}",
                self.call_timeout
            ))),
        }
    }

    /// Up to `k` remembered exchanges most relevant to `query`, best first
    ///
    /// Never fails: an unavailable embedder or index yields no memories.
    pub async fn retrieve(&self, query: &str, k: usize) -> Vec<String> {
        if k == 0 {
            return Vec::new();
        }
        match self.try_retrieve(query, k).await {
            Ok(memories) => memories,
            Err(e) => {
                warn!(kind = e.kind(), "Memory retrieval failed, continuing without memories: {}", e);
                Vec::new()
            }
        }
    }

    async fn try_retrieve(&self, query: &str, k: usize) -> Result<Vec<String>, EvolutionError> {
        let embedding = self.embed_bounded(query).await?;
        let results = tokio::time::timeout(self.call_timeout, self.index.query(&embedding, k))
            .await
            .map_err(|_| EvolutionError::RetrievalUnavailable("index query timed out".to_string()))?
            .map_err(|e| EvolutionError::RetrievalUnavailable(e.to_string()))?;

        Ok(results.into_iter().take(k).map(|m| m.document).collect())
    }

    /// Number of durable records
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// The first `n` records, as counted at some earlier point
    pub fn snapshot(&self, n: u64) -> Result<Vec<DialogueRecord>> {
        DialogueLog::read_prefix(&self.log_path, n.min(self.count()))
    }

    /// Number of indexed memories
    pub async fn indexed_count(&self) -> Result<u64> {
        self.index.count().await
    }

    pub fn embedder_name(&self) -> &str {
        self.embedder.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    /// Hash embeddings that can be switched off
    struct Switchable {
        inner: EmbeddingModel,
        down: AtomicBool,
    }

    #[async_trait]
    impl Embedder for Switchable {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if self.down.load(Ordering::SeqCst) {
                anyhow::bail!("embedding service down");
            }
            self.inner.embed(text).await
        }

        fn name(&self) -> &str {
            "switchable"
        }
    }

    struct Hanging;

    #[async_trait]
    impl Embedder for Hanging {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            std::future::pending().await
        }

        fn name(&self) -> &str {
            "hanging"
        }
    }

    fn config(dir: &std::path::Path) -> MemoryConfig {
        MemoryConfig {
            log_path: dir.join("dialogues.jsonl"),
            index_dir: dir.join("memory"),
            call_timeout: Duration::from_millis(200),
        }
    }

    fn switchable() -> Arc<Switchable> {
        Arc::new(Switchable {
            inner: EmbeddingModel::new(EmbeddingConfig::hash()).unwrap(),
            down: AtomicBool::new(false),
        })
    }

    #[tokio::test]
    async fn test_append_and_retrieve() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(config(dir.path()), switchable()).await.unwrap();

        store.append("my cat is called Miso", "Nice name for a cat").await.unwrap();
        store.append("the train leaves at noon", "Noted").await.unwrap();
        store.append("cat food brands", "Several exist").await.unwrap();

        assert_eq!(store.count(), 3);
        let memories = store.retrieve("what is my cat called", 2).await;
        assert_eq!(memories.len(), 2);
        assert!(memories[0].contains("cat"));
    }

    #[tokio::test]
    async fn test_retrieve_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(config(dir.path()), switchable()).await.unwrap();
        assert!(store.retrieve("anything", 3).await.is_empty());
    }

    #[tokio::test]
    async fn test_retrieve_degrades_when_embedder_down() {
        let dir = tempfile::tempdir().unwrap();
        let embedder = switchable();
        let store = MemoryStore::open(config(dir.path()), embedder.clone()).await.unwrap();
        store.append("hello", "hi").await.unwrap();

        embedder.down.store(true, Ordering::SeqCst);
        assert!(store.retrieve("hello", 3).await.is_empty());

        // Log write still succeeds without the index
        let record = store.append("still here", "yes").await.unwrap();
        assert_eq!(record.turn_index, 1);
        assert_eq!(store.indexed_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retrieve_times_out_on_hang() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(config(dir.path()), Arc::new(Hanging)).await.unwrap();
        let start = std::time::Instant::now();
        assert!(store.retrieve("hello", 3).await.is_empty());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_reopen_backfills_index_lag() {
        let dir = tempfile::tempdir().unwrap();
        let embedder = switchable();
        {
            let store = MemoryStore::open(config(dir.path()), embedder.clone()).await.unwrap();
            store.append("indexed", "yes").await.unwrap();
            embedder.down.store(true, Ordering::SeqCst);
            store.append("not indexed", "no").await.unwrap();
            assert_eq!(store.indexed_count().await.unwrap(), 1);
        }

        embedder.down.store(false, Ordering::SeqCst);
        let store = MemoryStore::open(config(dir.path()), embedder).await.unwrap();
        assert_eq!(store.count(), 2);
        assert_eq!(store.indexed_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_is_bounded_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(config(dir.path()), switchable()).await.unwrap();
        for i in 0..6 {
            store.append(&format!("q{}", i), "a").await.unwrap();
        }
        let snapshot = store.snapshot(4).unwrap();
        assert_eq!(snapshot.len(), 4);
        assert_eq!(snapshot.last().unwrap().turn_index, 3);
        assert_eq!(store.snapshot(100).unwrap().len(), 6);
    }
}
