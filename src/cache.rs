//! SQLite-backed cache for evidence store responses.
//!
//! Cached entries are the raw node lists keyed by a hash of the structured
//! query, so a cached answer binds exactly like a live one and yields the same
//! confidence score.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{debug, warn};

use crate::evidence::{EvidenceError, EvidenceQuery, EvidenceStore, GraphNode};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

/// Cache key for one evidence query against one catalog version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceCacheKey {
    pub catalog_version: String,
    pub query_key: String,
    pub key_hash: String,
}

impl EvidenceCacheKey {
    pub fn new(catalog_version: &str, query: &EvidenceQuery) -> Self {
        let query_key = query.cache_key();
        let key_hash = hash_fields(&[catalog_version, &query_key]);
        Self {
            catalog_version: catalog_version.to_string(),
            query_key,
            key_hash,
        }
    }
}

#[async_trait]
pub trait EvidenceCache: Send + Sync {
    async fn get(&self, key: &EvidenceCacheKey) -> Result<Option<Vec<GraphNode>>, CacheError>;
    async fn put(&self, key: &EvidenceCacheKey, nodes: &[GraphNode]) -> Result<(), CacheError>;
}

#[derive(Clone)]
pub struct SqliteEvidenceCache {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEvidenceCache {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS evidence_cache (\
               key_hash TEXT PRIMARY KEY,\
               catalog_version TEXT NOT NULL,\
               query_key TEXT NOT NULL,\
               nodes_json TEXT NOT NULL,\
               created_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL,\
               hit_count INTEGER NOT NULL DEFAULT 0\
             );",
        )?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("ESV_CACHE_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".esv_evidence_cache.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError>,
    {
        let guard = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        f(&guard)
    }
}

#[async_trait]
impl EvidenceCache for SqliteEvidenceCache {
    async fn get(&self, key: &EvidenceCacheKey) -> Result<Option<Vec<GraphNode>>, CacheError> {
        let key_hash = key.key_hash.clone();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut stmt =
                    conn.prepare("SELECT nodes_json FROM evidence_cache WHERE key_hash = ?1")?;
                let mut rows = stmt.query(params![key_hash])?;
                if let Some(row) = rows.next()? {
                    let raw: String = row.get(0)?;
                    let nodes: Vec<GraphNode> =
                        serde_json::from_str(&raw).map_err(|e| CacheError::Serde(e.to_string()))?;
                    conn.execute(
                        "UPDATE evidence_cache \
                         SET hit_count = hit_count + 1, updated_at = ?1 \
                         WHERE key_hash = ?2",
                        params![now_epoch(), key_hash],
                    )?;
                    Ok(Some(nodes))
                } else {
                    Ok(None)
                }
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    async fn put(&self, key: &EvidenceCacheKey, nodes: &[GraphNode]) -> Result<(), CacheError> {
        let key = key.clone();
        let raw = serde_json::to_string(nodes).map_err(|e| CacheError::Serde(e.to_string()))?;
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let now = now_epoch();
                conn.execute(
                    "INSERT INTO evidence_cache (\
                        key_hash, catalog_version, query_key, nodes_json, created_at, updated_at\
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                     ON CONFLICT(key_hash) DO UPDATE SET \
                        nodes_json = excluded.nodes_json, \
                        updated_at = excluded.updated_at",
                    params![key.key_hash, key.catalog_version, key.query_key, raw, now, now],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CachePruneStats {
    pub deleted: usize,
    pub remaining: usize,
}

impl SqliteEvidenceCache {
    pub async fn prune(
        &self,
        max_age_days: Option<u64>,
        max_rows: Option<usize>,
    ) -> Result<CachePruneStats, CacheError> {
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut deleted: usize = 0;
                if let Some(days) = max_age_days {
                    let cutoff = now_epoch().saturating_sub((days as i64).saturating_mul(86_400));
                    let removed = conn.execute(
                        "DELETE FROM evidence_cache WHERE updated_at < ?1",
                        params![cutoff],
                    )?;
                    deleted = deleted.saturating_add(removed);
                }

                if let Some(max_rows) = max_rows {
                    let count: i64 =
                        conn.query_row("SELECT COUNT(*) FROM evidence_cache", [], |row| row.get(0))?;
                    let keep = max_rows as i64;
                    if count > keep {
                        let removed = conn.execute(
                            "DELETE FROM evidence_cache WHERE key_hash IN (\
                                SELECT key_hash FROM evidence_cache \
                                ORDER BY updated_at DESC, key_hash LIMIT -1 OFFSET ?1\
                             )",
                            params![keep],
                        )?;
                        deleted = deleted.saturating_add(removed);
                    }
                }

                let remaining: i64 =
                    conn.query_row("SELECT COUNT(*) FROM evidence_cache", [], |row| row.get(0))?;
                Ok(CachePruneStats {
                    deleted,
                    remaining: remaining.max(0) as usize,
                })
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

/// Read-through cache in front of any evidence store.
///
/// Cache failures never fail a query; they are logged and the live store answers.
pub struct CachedEvidenceStore<S, C> {
    inner: S,
    cache: C,
    catalog_version: String,
}

impl<S: EvidenceStore, C: EvidenceCache> CachedEvidenceStore<S, C> {
    pub fn new(inner: S, cache: C, catalog_version: impl Into<String>) -> Self {
        Self {
            inner,
            cache,
            catalog_version: catalog_version.into(),
        }
    }
}

#[async_trait]
impl<S: EvidenceStore, C: EvidenceCache> EvidenceStore for CachedEvidenceStore<S, C> {
    async fn query(&self, query: &EvidenceQuery) -> Result<Vec<GraphNode>, EvidenceError> {
        let key = EvidenceCacheKey::new(&self.catalog_version, query);
        match self.cache.get(&key).await {
            Ok(Some(nodes)) => {
                debug!(query = %key.query_key, "evidence cache hit");
                return Ok(nodes);
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "evidence cache read failed"),
        }

        let nodes = self.inner.query(query).await?;
        if let Err(err) = self.cache.put(&key, &nodes).await {
            warn!(error = %err, "evidence cache write failed");
        }
        Ok(nodes)
    }
}

fn hash_fields(fields: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            hasher.update(b"|");
        }
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
