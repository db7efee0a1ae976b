use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use esv_bridge::cache::{CacheError, CachedEvidenceStore, EvidenceCache, EvidenceCacheKey, SqliteEvidenceCache};
use esv_bridge::evidence::{EvidenceError, EvidenceQuery, EvidenceStore, GraphNode, NodeType};
use serde_json::{json, Map};
use tempfile::tempdir;

fn site_node(name: &str) -> GraphNode {
    let mut properties = Map::new();
    properties.insert("name".into(), json!(name));
    properties.insert("habitats".into(), json!(["coral_reef"]));
    GraphNode {
        node_type: NodeType::Site,
        node_id: name.to_string(),
        properties,
        relationship_path: Vec::new(),
    }
}

struct CountingStore {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl EvidenceStore for CountingStore {
    async fn query(&self, query: &EvidenceQuery) -> Result<Vec<GraphNode>, EvidenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![site_node(&query.cache_key())])
    }
}

#[test]
fn cache_key_depends_on_catalog_version_not_name_case() {
    let a = EvidenceCacheKey::new("1.0.0", &EvidenceQuery::site("Cabo Pulmo", 3));
    let b = EvidenceCacheKey::new("1.0.0", &EvidenceQuery::site("cabo pulmo", 3));
    let c = EvidenceCacheKey::new("1.1.0", &EvidenceQuery::site("Cabo Pulmo", 3));
    let d = EvidenceCacheKey::new("1.0.0", &EvidenceQuery::site("Cabo Pulmo", 2));
    assert_eq!(a.key_hash, b.key_hash);
    assert_ne!(a.key_hash, c.key_hash);
    assert_ne!(a.key_hash, d.key_hash);
    assert_eq!(a.key_hash.len(), 64);
}

#[tokio::test]
async fn sqlite_cache_put_get_round_trip() {
    let dir = tempdir().unwrap();
    let cache = SqliteEvidenceCache::new(dir.path().join("cache.sqlite")).unwrap();

    let key = EvidenceCacheKey::new("1.0.0", &EvidenceQuery::axiom("BA-001", 1));
    assert!(cache.get(&key).await.unwrap().is_none());

    let nodes = vec![site_node("Cabo Pulmo National Park")];
    cache.put(&key, &nodes).await.unwrap();
    assert_eq!(cache.get(&key).await.unwrap(), Some(nodes));

    let other = EvidenceCacheKey::new("1.0.0", &EvidenceQuery::axiom("BA-002", 1));
    assert!(cache.get(&other).await.unwrap().is_none());
}

#[tokio::test]
async fn cached_store_serves_repeat_queries_from_sqlite() {
    let dir = tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let store = CachedEvidenceStore::new(
        CountingStore { calls: calls.clone() },
        SqliteEvidenceCache::new(dir.path().join("cache.sqlite")).unwrap(),
        "1.0.0",
    );

    let query = EvidenceQuery::site("Cabo Pulmo", 3);
    let first = store.query(&query).await.unwrap();
    let second = store.query(&query).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    store.query(&EvidenceQuery::site("Ningaloo", 3)).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn prune_caps_row_count() {
    let dir = tempdir().unwrap();
    let cache = SqliteEvidenceCache::new(dir.path().join("cache.sqlite")).unwrap();
    for id in ["BA-001", "BA-002", "BA-003"] {
        let key = EvidenceCacheKey::new("1.0.0", &EvidenceQuery::axiom(id, 1));
        cache.put(&key, &[site_node(id)]).await.unwrap();
    }

    let stats = cache.prune(Some(30), None).await.unwrap();
    assert_eq!(stats.deleted, 0);
    assert_eq!(stats.remaining, 3);

    let stats = cache.prune(None, Some(1)).await.unwrap();
    assert_eq!(stats.deleted, 2);
    assert_eq!(stats.remaining, 1);
}

#[test]
fn unusable_cache_directory_is_an_io_error() {
    let dir = tempdir().unwrap();
    let blocker = dir.path().join("not_a_dir");
    std::fs::write(&blocker, b"x").unwrap();
    let err = SqliteEvidenceCache::new(blocker.join("cache.sqlite")).err().unwrap();
    assert!(matches!(err, CacheError::Io(_)));
}
