use async_trait::async_trait;
use bastion_core::config::MemoryConfig;
use bastion_core::{MemoryError, Paths, Registry, RegistryError};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use crate::embedder::{build_embedder, cosine_similarity, Embedder};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: Value,
    pub importance: f32,
    pub created_at_ms: i64,
    pub last_accessed_ms: i64,
    #[serde(default)]
    pub session_key: Option<String>,
}

impl MemoryRecord {
    pub fn new(text: &str, embedding: Vec<f32>) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.to_string(),
            embedding,
            metadata: Value::Null,
            importance: 0.5,
            created_at_ms: now,
            last_accessed_ms: now,
            session_key: None,
        }
    }

    pub fn with_session(mut self, session_key: &str) -> Self {
        self.session_key = Some(session_key.to_string());
        self
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Fail with `CapacityExceeded` when full.
    Strict,
    /// Evict one record per the backend's policy to make room.
    AllowEviction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    Lru,
    LowestImportance,
    Oldest,
}

impl FromStr for EvictionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lru" => Ok(EvictionPolicy::Lru),
            "lowest_importance" => Ok(EvictionPolicy::LowestImportance),
            "oldest" => Ok(EvictionPolicy::Oldest),
            other => Err(format!("unknown eviction policy '{}'", other)),
        }
    }
}

impl EvictionPolicy {
    /// True when `a` should be evicted before `b`. Ties fall back to age, then id.
    fn evicts_before(&self, a: &MemoryRecord, b: &MemoryRecord) -> bool {
        let primary = match self {
            EvictionPolicy::Lru => a.last_accessed_ms.cmp(&b.last_accessed_ms),
            EvictionPolicy::LowestImportance => a.importance.total_cmp(&b.importance),
            EvictionPolicy::Oldest => a.created_at_ms.cmp(&b.created_at_ms),
        };
        primary
            .then(a.created_at_ms.cmp(&b.created_at_ms))
            .then_with(|| a.id.cmp(&b.id))
            == Ordering::Less
    }

    fn order_by(&self) -> &'static str {
        match self {
            EvictionPolicy::Lru => "last_accessed_ms ASC, created_at_ms ASC, id ASC",
            EvictionPolicy::LowestImportance => "importance ASC, created_at_ms ASC, id ASC",
            EvictionPolicy::Oldest => "created_at_ms ASC, id ASC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredRecord {
    pub record: MemoryRecord,
    pub score: f32,
}

/// Lazily produced recall results: at most `k` items, similarity descending,
/// newer records first on ties.
pub type Recall = Box<dyn Iterator<Item = ScoredRecord> + Send>;

#[async_trait]
pub trait MemoryBackend: Send + Sync {
    fn name(&self) -> &str;

    fn capacity(&self) -> usize;

    async fn remember(&self, record: MemoryRecord, mode: WriteMode) -> Result<(), MemoryError>;

    /// With a `scope`, only records written under that session key or under
    /// no session at all are candidates.
    async fn recall(&self, query: &[f32], k: usize, scope: Option<&str>) -> Result<Recall, MemoryError>;

    async fn len(&self) -> Result<usize, MemoryError>;
}

/// Heap entry ordered by (score, created_at_ms, reverse id).
struct Candidate {
    score: f32,
    created_at_ms: i64,
    id: String,
}

impl Candidate {
    fn rank(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then(self.created_at_ms.cmp(&other.created_at_ms))
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.rank(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank(other)
    }
}

fn in_scope(record_key: Option<&str>, scope: Option<&str>) -> bool {
    match (record_key, scope) {
        (_, None) | (None, _) => true,
        (Some(key), Some(scope)) => key == scope,
    }
}

fn score_all<'a>(query: &[f32], records: impl Iterator<Item = (&'a str, &'a [f32], i64)>) -> BinaryHeap<Candidate> {
    records
        .map(|(id, embedding, created_at_ms)| Candidate {
            score: cosine_similarity(query, embedding),
            created_at_ms,
            id: id.to_string(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

struct InMemoryState {
    records: HashMap<String, MemoryRecord>,
}

pub struct InMemoryBackend {
    state: Arc<Mutex<InMemoryState>>,
    capacity: usize,
    eviction: EvictionPolicy,
}

impl InMemoryBackend {
    pub fn new(capacity: usize, eviction: EvictionPolicy) -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryState {
                records: HashMap::new(),
            })),
            capacity,
            eviction,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InMemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pops the heap one candidate at a time; each popped record has its
/// `last_accessed_ms` refreshed so LRU eviction sees real reads.
struct LazyRecall {
    heap: BinaryHeap<Candidate>,
    remaining: usize,
    state: Arc<Mutex<InMemoryState>>,
}

impl Iterator for LazyRecall {
    type Item = ScoredRecord;

    fn next(&mut self) -> Option<ScoredRecord> {
        while self.remaining > 0 {
            let candidate = self.heap.pop()?;
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            // Evicted since the recall started.
            let Some(record) = state.records.get_mut(&candidate.id) else {
                continue;
            };
            record.last_accessed_ms = now_ms();
            self.remaining -= 1;
            return Some(ScoredRecord {
                record: record.clone(),
                score: candidate.score,
            });
        }
        None
    }
}

#[async_trait]
impl MemoryBackend for InMemoryBackend {
    fn name(&self) -> &str {
        "in_memory"
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    async fn remember(&self, record: MemoryRecord, mode: WriteMode) -> Result<(), MemoryError> {
        let mut state = self.lock();
        if !state.records.contains_key(&record.id) && state.records.len() >= self.capacity {
            match mode {
                WriteMode::Strict => {
                    return Err(MemoryError::CapacityExceeded {
                        capacity: self.capacity,
                    })
                }
                WriteMode::AllowEviction => {
                    let victim = state
                        .records
                        .values()
                        .reduce(|a, b| if self.eviction.evicts_before(b, a) { b } else { a })
                        .map(|r| r.id.clone());
                    match victim {
                        Some(id) => {
                            state.records.remove(&id);
                            debug!(id = %id, policy = ?self.eviction, "Evicted memory record");
                        }
                        None => {
                            return Err(MemoryError::CapacityExceeded {
                                capacity: self.capacity,
                            })
                        }
                    }
                }
            }
        }
        state.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn recall(&self, query: &[f32], k: usize, scope: Option<&str>) -> Result<Recall, MemoryError> {
        let heap = {
            let state = self.lock();
            score_all(
                query,
                state
                    .records
                    .values()
                    .filter(|r| in_scope(r.session_key.as_deref(), scope))
                    .map(|r| (r.id.as_str(), r.embedding.as_slice(), r.created_at_ms)),
            )
        };
        Ok(Box::new(LazyRecall {
            heap,
            remaining: k,
            state: self.state.clone(),
        }))
    }

    async fn len(&self) -> Result<usize, MemoryError> {
        Ok(self.lock().records.len())
    }
}

// ---------------------------------------------------------------------------
// SQLite backend
// ---------------------------------------------------------------------------

fn unavailable(e: impl std::fmt::Display) -> MemoryError {
    MemoryError::BackendUnavailable(e.to_string())
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let embedding: Vec<u8> = row.get("embedding")?;
    let metadata: Option<String> = row.get("metadata")?;
    Ok(MemoryRecord {
        id: row.get("id")?,
        text: row.get("text")?,
        embedding: decode_embedding(&embedding),
        metadata: metadata
            .and_then(|m| serde_json::from_str(&m).ok())
            .unwrap_or(Value::Null),
        importance: row.get::<_, f64>("importance")? as f32,
        created_at_ms: row.get("created_at_ms")?,
        last_accessed_ms: row.get("last_accessed_ms")?,
        session_key: row.get("session_key")?,
    })
}

/// Persistent backend. Every call runs on the blocking pool.
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
    capacity: usize,
    eviction: EvictionPolicy,
}

impl SqliteBackend {
    pub fn open(path: &Path, capacity: usize, eviction: EvictionPolicy) -> Result<Self, MemoryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(unavailable)?;
        }
        let conn = Connection::open(path).map_err(unavailable)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        Self::init(conn, capacity, eviction)
    }

    pub fn open_in_memory(capacity: usize, eviction: EvictionPolicy) -> Result<Self, MemoryError> {
        let conn = Connection::open_in_memory().map_err(unavailable)?;
        Self::init(conn, capacity, eviction)
    }

    fn init(conn: Connection, capacity: usize, eviction: EvictionPolicy) -> Result<Self, MemoryError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                text TEXT NOT NULL,
                embedding BLOB NOT NULL,
                metadata TEXT,
                importance REAL NOT NULL DEFAULT 0.5,
                created_at_ms INTEGER NOT NULL,
                last_accessed_ms INTEGER NOT NULL,
                session_key TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_memories_accessed ON memories(last_accessed_ms);
            CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at_ms);
            CREATE INDEX IF NOT EXISTS idx_memories_importance ON memories(importance);
            CREATE INDEX IF NOT EXISTS idx_memories_session ON memories(session_key);
            ",
        )
        .map_err(unavailable)?;
        debug!("Memory schema initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            capacity,
            eviction,
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, MemoryError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, MemoryError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| MemoryError::BackendUnavailable(format!("lock poisoned: {}", e)))?;
            f(&mut guard)
        })
        .await
        .map_err(unavailable)?
    }
}

#[async_trait]
impl MemoryBackend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    async fn remember(&self, record: MemoryRecord, mode: WriteMode) -> Result<(), MemoryError> {
        let capacity = self.capacity;
        let eviction = self.eviction;
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(unavailable)?;
            let exists: Option<String> = tx
                .query_row("SELECT id FROM memories WHERE id = ?1", params![record.id], |r| r.get(0))
                .optional()
                .map_err(unavailable)?;
            let count: i64 = tx
                .query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))
                .map_err(unavailable)?;

            if exists.is_none() && count as usize >= capacity {
                if mode == WriteMode::Strict || count == 0 {
                    return Err(MemoryError::CapacityExceeded { capacity });
                }
                let sql = format!(
                    "DELETE FROM memories WHERE id = (SELECT id FROM memories ORDER BY {} LIMIT 1)",
                    eviction.order_by()
                );
                tx.execute(&sql, []).map_err(unavailable)?;
                debug!(policy = ?eviction, "Evicted memory record");
            }

            let metadata = if record.metadata.is_null() {
                None
            } else {
                Some(record.metadata.to_string())
            };
            tx.execute(
                "INSERT OR REPLACE INTO memories
                    (id, text, embedding, metadata, importance, created_at_ms, last_accessed_ms, session_key)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.id,
                    record.text,
                    encode_embedding(&record.embedding),
                    metadata,
                    record.importance as f64,
                    record.created_at_ms,
                    record.last_accessed_ms,
                    record.session_key,
                ],
            )
            .map_err(unavailable)?;
            tx.commit().map_err(unavailable)
        })
        .await
    }

    /// Ranking runs on the blocking pool; the top `k` rows are loaded and
    /// touched there, and the returned iterator walks them in order.
    async fn recall(&self, query: &[f32], k: usize, scope: Option<&str>) -> Result<Recall, MemoryError> {
        let query = query.to_vec();
        let scope = scope.map(str::to_string);
        let results = self
            .with_conn(move |conn| {
                let mut heap = {
                    let mut stmt = conn
                        .prepare(
                            "SELECT id, embedding, created_at_ms FROM memories
                             WHERE ?1 IS NULL OR session_key IS NULL OR session_key = ?1",
                        )
                        .map_err(unavailable)?;
                    let rows = stmt
                        .query_map(params![scope], |row| {
                            let id: String = row.get(0)?;
                            let blob: Vec<u8> = row.get(1)?;
                            let created: i64 = row.get(2)?;
                            Ok((id, decode_embedding(&blob), created))
                        })
                        .map_err(unavailable)?
                        .collect::<rusqlite::Result<Vec<_>>>()
                        .map_err(unavailable)?;
                    score_all(
                        &query,
                        rows.iter().map(|(id, e, c)| (id.as_str(), e.as_slice(), *c)),
                    )
                };

                let now = now_ms();
                let mut out = Vec::with_capacity(k.min(heap.len()));
                while out.len() < k {
                    let Some(candidate) = heap.pop() else { break };
                    conn.execute(
                        "UPDATE memories SET last_accessed_ms = ?1 WHERE id = ?2",
                        params![now, candidate.id],
                    )
                    .map_err(unavailable)?;
                    let record = conn
                        .query_row(
                            "SELECT * FROM memories WHERE id = ?1",
                            params![candidate.id],
                            row_to_record,
                        )
                        .optional()
                        .map_err(unavailable)?;
                    if let Some(record) = record {
                        out.push(ScoredRecord {
                            record,
                            score: candidate.score,
                        });
                    }
                }
                Ok(out)
            })
            .await?;
        Ok(Box::new(results.into_iter()))
    }

    async fn len(&self) -> Result<usize, MemoryError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get::<_, i64>(0))
                .map(|n| n as usize)
                .map_err(unavailable)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Store facade
// ---------------------------------------------------------------------------

/// A backend paired with the embedder that feeds it.
#[derive(Clone)]
pub struct MemoryStore {
    backend: Arc<dyn MemoryBackend>,
    embedder: Arc<dyn Embedder>,
}

impl MemoryStore {
    pub fn new(backend: Arc<dyn MemoryBackend>, embedder: Arc<dyn Embedder>) -> Self {
        Self { backend, embedder }
    }

    pub fn backend(&self) -> &Arc<dyn MemoryBackend> {
        &self.backend
    }

    pub async fn remember_text(
        &self,
        text: &str,
        session_key: Option<&str>,
        metadata: Value,
        mode: WriteMode,
    ) -> Result<String, MemoryError> {
        let embedding = self.embedder.embed(text).await?;
        let mut record = MemoryRecord::new(text, embedding).with_metadata(metadata);
        if let Some(key) = session_key {
            record = record.with_session(key);
        }
        let id = record.id.clone();
        self.backend.remember(record, mode).await?;
        Ok(id)
    }

    /// Recall for one session: its own records plus unscoped ones.
    pub async fn recall_text(
        &self,
        query: &str,
        k: usize,
        session_key: Option<&str>,
    ) -> Result<Recall, MemoryError> {
        let embedding = self.embedder.embed(query).await?;
        self.backend.recall(&embedding, k, session_key).await
    }

    pub async fn len(&self) -> Result<usize, MemoryError> {
        self.backend.len().await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackendParams {
    #[serde(default = "default_capacity")]
    capacity: usize,
    #[serde(default = "default_eviction")]
    eviction: String,
    #[serde(default)]
    path: Option<String>,
}

fn default_capacity() -> usize {
    MemoryConfig::default().capacity
}

fn default_eviction() -> String {
    MemoryConfig::default().eviction
}

fn parse_backend_params(params: &Value) -> anyhow::Result<(BackendParams, EvictionPolicy)> {
    let p: BackendParams = if params.is_null() {
        serde_json::from_value(serde_json::json!({}))?
    } else {
        serde_json::from_value(params.clone())?
    };
    let eviction = EvictionPolicy::from_str(&p.eviction).map_err(anyhow::Error::msg)?;
    if p.capacity == 0 {
        anyhow::bail!("memory capacity must be > 0");
    }
    Ok((p, eviction))
}

/// Register the `in_memory` and `sqlite` backends.
pub fn register_builtin(
    registry: &mut Registry<dyn MemoryBackend>,
    paths: Paths,
) -> Result<(), RegistryError> {
    registry.register("in_memory", |params: &Value| {
        let (p, eviction) = parse_backend_params(params)?;
        Ok(Arc::new(InMemoryBackend::new(p.capacity, eviction)) as Arc<dyn MemoryBackend>)
    })?;
    registry.register("sqlite", move |params: &Value| {
        let (p, eviction) = parse_backend_params(params)?;
        let path = match &p.path {
            Some(path) => paths.resolve(path),
            None => paths.memory_db(),
        };
        let backend = SqliteBackend::open(&path, p.capacity, eviction)?;
        info!(path = %path.display(), capacity = p.capacity, "Opened sqlite memory backend");
        Ok(Arc::new(backend) as Arc<dyn MemoryBackend>)
    })?;
    Ok(())
}

/// Resolve the configured backend and embedder into a store.
pub fn build_store(
    registry: &Registry<dyn MemoryBackend>,
    cfg: &MemoryConfig,
) -> anyhow::Result<MemoryStore> {
    let params = serde_json::json!({
        "capacity": cfg.capacity,
        "eviction": cfg.eviction,
        "path": cfg.path,
    });
    let backend = registry.resolve(&cfg.backend, &params)?;
    let embedder = build_embedder(&cfg.embedder)?;
    Ok(MemoryStore::new(backend, embedder))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::HashingEmbedder;
    use bastion_core::CapabilityKind;
    use tempfile::TempDir;

    fn record(id: &str, embedding: Vec<f32>, created: i64) -> MemoryRecord {
        MemoryRecord {
            id: id.to_string(),
            text: format!("text {}", id),
            embedding,
            metadata: Value::Null,
            importance: 0.5,
            created_at_ms: created,
            last_accessed_ms: created,
            session_key: None,
        }
    }

    async fn seed(backend: &dyn MemoryBackend) {
        backend.remember(record("a", vec![1.0, 0.0], 1), WriteMode::Strict).await.unwrap();
        backend.remember(record("b", vec![0.0, 1.0], 2), WriteMode::Strict).await.unwrap();
        backend.remember(record("c", vec![1.0, 0.1], 3), WriteMode::Strict).await.unwrap();
        // Same direction as "a", newer.
        backend.remember(record("d", vec![2.0, 0.0], 4), WriteMode::Strict).await.unwrap();
    }

    fn ids(recall: Recall) -> Vec<String> {
        recall.map(|s| s.record.id).collect()
    }

    async fn check_recall_order(backend: &dyn MemoryBackend) {
        seed(backend).await;
        let results: Vec<ScoredRecord> = backend.recall(&[1.0, 0.0], 3, None).await.unwrap().collect();
        assert_eq!(results.len(), 3);
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        let order: Vec<&str> = results.iter().map(|r| r.record.id.as_str()).collect();
        assert_eq!(order, vec!["d", "a", "c"]);

        assert_eq!(ids(backend.recall(&[1.0, 0.0], 10, None).await.unwrap()).len(), 4);
        assert!(ids(backend.recall(&[1.0, 0.0], 0, None).await.unwrap()).is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_recall_order() {
        let backend = InMemoryBackend::new(10, EvictionPolicy::Lru);
        check_recall_order(&backend).await;
    }

    #[tokio::test]
    async fn test_sqlite_recall_order() {
        let backend = SqliteBackend::open_in_memory(10, EvictionPolicy::Lru).unwrap();
        check_recall_order(&backend).await;
    }

    async fn check_scoped_recall(backend: &dyn MemoryBackend) {
        let mine = record("mine", vec![1.0, 0.0], 1).with_session("telegram:1");
        let theirs = record("theirs", vec![1.0, 0.0], 2).with_session("telegram:2");
        let shared = record("shared", vec![0.9, 0.1], 3);
        for r in [mine, theirs, shared] {
            backend.remember(r, WriteMode::Strict).await.unwrap();
        }

        let got = ids(backend.recall(&[1.0, 0.0], 10, Some("telegram:1")).await.unwrap());
        assert_eq!(got, vec!["mine".to_string(), "shared".to_string()]);
        let got = ids(backend.recall(&[1.0, 0.0], 10, Some("telegram:2")).await.unwrap());
        assert_eq!(got, vec!["theirs".to_string(), "shared".to_string()]);
        assert_eq!(ids(backend.recall(&[1.0, 0.0], 10, None).await.unwrap()).len(), 3);
    }

    #[tokio::test]
    async fn test_in_memory_recall_stays_in_session() {
        let backend = InMemoryBackend::new(10, EvictionPolicy::Lru);
        check_scoped_recall(&backend).await;
    }

    #[tokio::test]
    async fn test_sqlite_recall_stays_in_session() {
        let backend = SqliteBackend::open_in_memory(10, EvictionPolicy::Lru).unwrap();
        check_scoped_recall(&backend).await;
    }

    #[tokio::test]
    async fn test_strict_capacity() {
        let backend = InMemoryBackend::new(2, EvictionPolicy::Lru);
        backend.remember(record("a", vec![1.0], 1), WriteMode::Strict).await.unwrap();
        backend.remember(record("b", vec![1.0], 2), WriteMode::Strict).await.unwrap();
        let err = backend
            .remember(record("c", vec![1.0], 3), WriteMode::Strict)
            .await
            .unwrap_err();
        assert_eq!(err, MemoryError::CapacityExceeded { capacity: 2 });
        // Overwriting an existing id is not growth.
        backend.remember(record("a", vec![0.5], 1), WriteMode::Strict).await.unwrap();
        assert_eq!(backend.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_lru_eviction_respects_recall_touch() {
        let backend = InMemoryBackend::new(2, EvictionPolicy::Lru);
        backend.remember(record("old", vec![1.0, 0.0], 1), WriteMode::Strict).await.unwrap();
        backend.remember(record("new", vec![0.0, 1.0], 2), WriteMode::Strict).await.unwrap();

        // Reading "old" makes "new" the least recently used.
        let touched = ids(backend.recall(&[1.0, 0.0], 1, None).await.unwrap());
        assert_eq!(touched, vec!["old".to_string()]);

        backend
            .remember(record("x", vec![1.0, 1.0], 3), WriteMode::AllowEviction)
            .await
            .unwrap();
        let left = ids(backend.recall(&[1.0, 0.0], 10, None).await.unwrap());
        assert!(left.contains(&"old".to_string()));
        assert!(!left.contains(&"new".to_string()));
    }

    #[tokio::test]
    async fn test_lowest_importance_eviction_sqlite() {
        let backend = SqliteBackend::open_in_memory(2, EvictionPolicy::LowestImportance).unwrap();
        backend
            .remember(record("keep", vec![1.0], 1).with_importance(0.9), WriteMode::Strict)
            .await
            .unwrap();
        backend
            .remember(record("drop", vec![1.0], 2).with_importance(0.1), WriteMode::Strict)
            .await
            .unwrap();
        backend
            .remember(record("new", vec![1.0], 3), WriteMode::AllowEviction)
            .await
            .unwrap();
        let left = ids(backend.recall(&[1.0], 10, None).await.unwrap());
        assert_eq!(left.len(), 2);
        assert!(!left.contains(&"drop".to_string()));
    }

    #[tokio::test]
    async fn test_oldest_eviction() {
        let backend = InMemoryBackend::new(1, EvictionPolicy::Oldest);
        backend.remember(record("first", vec![1.0], 1), WriteMode::Strict).await.unwrap();
        backend
            .remember(record("second", vec![1.0], 2), WriteMode::AllowEviction)
            .await
            .unwrap();
        assert_eq!(ids(backend.recall(&[1.0], 5, None).await.unwrap()), vec!["second".to_string()]);
    }

    #[tokio::test]
    async fn test_sqlite_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("memory.db");
        {
            let backend = SqliteBackend::open(&path, 10, EvictionPolicy::Lru).unwrap();
            backend
                .remember(
                    record("p", vec![0.25, -0.5], 7).with_metadata(serde_json::json!({"k": 1})),
                    WriteMode::Strict,
                )
                .await
                .unwrap();
        }
        let backend = SqliteBackend::open(&path, 10, EvictionPolicy::Lru).unwrap();
        let got: Vec<ScoredRecord> = backend.recall(&[0.25, -0.5], 1, None).await.unwrap().collect();
        assert_eq!(got[0].record.embedding, vec![0.25, -0.5]);
        assert_eq!(got[0].record.metadata["k"], 1);
    }

    #[tokio::test]
    async fn test_store_text_roundtrip_through_registry() {
        let dir = TempDir::new().unwrap();
        let mut reg: Registry<dyn MemoryBackend> = Registry::new(CapabilityKind::Memory);
        register_builtin(&mut reg, Paths::with_base(dir.path().to_path_buf())).unwrap();

        let cfg = MemoryConfig {
            backend: "sqlite".to_string(),
            capacity: 5,
            ..Default::default()
        };
        let store = build_store(&reg, &cfg).unwrap();
        store
            .remember_text("the deploy key lives in vault", Some("cli:u"), Value::Null, WriteMode::Strict)
            .await
            .unwrap();
        store
            .remember_text("lunch is at noon", None, Value::Null, WriteMode::Strict)
            .await
            .unwrap();
        let top: Vec<ScoredRecord> = store.recall_text("where is the deploy key", 1, None).await.unwrap().collect();
        assert_eq!(top[0].record.text, "the deploy key lives in vault");
        assert_eq!(top[0].record.session_key.as_deref(), Some("cli:u"));
        assert!(dir.path().join("memory.db").exists());
    }

    #[test]
    fn test_unknown_eviction_rejected() {
        let mut reg: Registry<dyn MemoryBackend> = Registry::new(CapabilityKind::Memory);
        register_builtin(&mut reg, Paths::with_base(std::env::temp_dir())).unwrap();
        let err = reg
            .resolve("in_memory", &serde_json::json!({"eviction": "random"}))
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::ConstructionError { .. }));
    }

    #[test]
    fn test_hashing_embedder_dims_used_by_store() {
        let e = HashingEmbedder::new(8);
        assert_eq!(e.embed_sync("x").len(), 8);
    }
}
