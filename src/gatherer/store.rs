use super::clock::Timestamp;
use k8s_openapi::serde_json::Value;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tokio::sync::RwLock;
use tracing::debug;

/// Identity of an object within the gatherer's resource type.
///
/// The uid is deliberately not part of the key: a delete followed by a
/// re-create under the same name replaces the tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    #[must_use]
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
            name: name.to_string(),
        }
    }

    /// Read the key out of an object's `metadata`. Objects without a name have no key.
    #[must_use]
    pub fn from_object(object: &Value) -> Option<Self> {
        let metadata = object.get("metadata")?;
        let name = metadata.get("name")?.as_str().filter(|name| !name.is_empty())?;
        let namespace = metadata.get("namespace").and_then(Value::as_str);
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// One object as handed to consumers of `fetch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatheredResource {
    pub resource: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<Timestamp>,
}

impl GatheredResource {
    #[must_use]
    pub const fn live(resource: Value) -> Self {
        Self {
            resource,
            deleted_at: None,
        }
    }

    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// `metadata.name` of the resource, empty if missing
    #[must_use]
    pub fn name(&self) -> &str {
        self.resource
            .get("metadata")
            .and_then(|metadata| metadata.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
}

/// Latest known state of every object seen by the watch controller,
/// including tombstones of deleted ones.
#[derive(Debug, Default)]
pub struct ResourceCache {
    entries: RwLock<HashMap<ObjectKey, GatheredResource>>,
}

impl ResourceCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the live entry for `key`, clearing any tombstone.
    pub async fn upsert(&self, key: ObjectKey, object: Value) {
        self.entries
            .write()
            .await
            .insert(key, GatheredResource::live(object));
    }

    /// Tombstone the entry for `key`, keeping its last known body.
    ///
    /// Returns `false` without inserting anything when `key` was never seen.
    pub async fn mark_deleted(&self, key: &ObjectKey, at: Timestamp) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) => {
                entry.deleted_at = Some(at);
                true
            }
            None => {
                debug!("ignoring delete of unknown object {}", key);
                false
            }
        }
    }

    /// Consistent copy of every entry, in no particular order.
    pub async fn snapshot(&self) -> Vec<GatheredResource> {
        self.entries.read().await.values().cloned().collect()
    }

    /// Tombstone live entries among `previous` (the keys a shard owned before
    /// relisting) that the fresh listing no longer contains. Returns how many
    /// were tombstoned.
    pub async fn reconcile_listing(
        &self,
        previous: &HashSet<ObjectKey>,
        listed: &HashSet<ObjectKey>,
        at: Timestamp,
    ) -> usize {
        let mut entries = self.entries.write().await;
        let mut tombstoned = 0;
        for key in previous.difference(listed) {
            if let Some(entry) = entries.get_mut(key) {
                if !entry.is_deleted() {
                    entry.deleted_at = Some(at);
                    tombstoned += 1;
                }
            }
        }
        tombstoned
    }

    /// Remove tombstones older than `cutoff`. Returns how many were removed.
    pub async fn prune_tombstones(&self, cutoff: Timestamp) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.deleted_at.is_none_or(|at| at >= cutoff));
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        let deleted = entries.values().filter(|entry| entry.is_deleted()).count();
        CacheStats {
            total_entries: entries.len(),
            live_entries: entries.len() - deleted,
            deleted_entries: deleted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub live_entries: usize,
    pub deleted_entries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeDelta};
    use k8s_openapi::serde_json::json;
    use std::sync::Arc;

    fn foo(name: &str, namespace: &str, generation: u64) -> Value {
        json!({
            "apiVersion": "foobar/v1",
            "kind": "Foo",
            "metadata": {"name": name, "namespace": namespace, "uid": format!("{name}1")},
            "spec": {"generation": generation},
        })
    }

    fn at(secs: i64) -> Timestamp {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_object_key_from_object() {
        let key = ObjectKey::from_object(&foo("testfoo", "testns", 1)).unwrap();
        assert_eq!(key, ObjectKey::new(Some("testns"), "testfoo"));
        assert_eq!(key.to_string(), "testns/testfoo");

        let cluster_scoped = json!({"metadata": {"name": "default", "namespace": ""}});
        let key = ObjectKey::from_object(&cluster_scoped).unwrap();
        assert_eq!(key.namespace, None);
        assert_eq!(key.to_string(), "default");

        assert!(ObjectKey::from_object(&json!({"metadata": {}})).is_none());
        assert!(ObjectKey::from_object(&json!({"metadata": {"name": ""}})).is_none());
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let cache = ResourceCache::new();
        let key = ObjectKey::new(Some("testns"), "testfoo");

        for generation in 0..5 {
            cache.upsert(key.clone(), foo("testfoo", "testns", generation)).await;
        }

        let snapshot = cache.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].resource["spec"]["generation"], 4);
        assert!(!snapshot[0].is_deleted());
    }

    #[tokio::test]
    async fn test_delete_of_unknown_object_is_noop() {
        let cache = ResourceCache::new();
        let key = ObjectKey::new(Some("testns"), "ghost");

        assert!(!cache.mark_deleted(&key, at(10)).await);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_delete_keeps_last_body() {
        let cache = ResourceCache::new();
        let key = ObjectKey::new(Some("testns"), "testfoo");
        cache.upsert(key.clone(), foo("testfoo", "testns", 3)).await;

        assert!(cache.mark_deleted(&key, at(1_615_918_935)).await);

        let snapshot = cache.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].deleted_at, Some(at(1_615_918_935)));
        assert_eq!(snapshot[0].resource, foo("testfoo", "testns", 3));
    }

    #[tokio::test]
    async fn test_readd_clears_tombstone() {
        let cache = ResourceCache::new();
        let key = ObjectKey::new(Some("testns"), "testfoo");
        cache.upsert(key.clone(), foo("testfoo", "testns", 1)).await;
        cache.mark_deleted(&key, at(5)).await;

        cache.upsert(key.clone(), foo("testfoo", "testns", 2)).await;

        let snapshot = cache.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].deleted_at, None);
        assert_eq!(snapshot[0].resource["spec"]["generation"], 2);
    }

    #[tokio::test]
    async fn test_concurrent_writers_lose_nothing() {
        let cache = Arc::new(ResourceCache::new());
        let mut handles = vec![];

        for shard in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let namespace = format!("ns-{shard}");
                for i in 0..50 {
                    let name = format!("foo-{i}");
                    let key = ObjectKey::new(Some(&namespace), &name);
                    cache.upsert(key.clone(), foo(&name, &namespace, 1)).await;
                    if i % 5 == 0 {
                        cache.mark_deleted(&key, at(100)).await;
                    }
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        let stats = cache.stats().await;
        assert_eq!(stats.total_entries, 8 * 50);
        assert_eq!(stats.deleted_entries, 8 * 10);
        assert_eq!(stats.live_entries, 8 * 40);
    }

    #[tokio::test]
    async fn test_reconcile_listing_tombstones_missing_objects() {
        let cache = ResourceCache::new();
        for (ns, name) in [("a", "one"), ("a", "two"), ("b", "three")] {
            cache.upsert(ObjectKey::new(Some(ns), name), foo(name, ns, 1)).await;
        }

        let owned: HashSet<_> = [ObjectKey::new(Some("a"), "one"), ObjectKey::new(Some("a"), "two")]
            .into_iter()
            .collect();
        let listed: HashSet<_> = [ObjectKey::new(Some("a"), "one")].into_iter().collect();
        let tombstoned = cache.reconcile_listing(&owned, &listed, at(50)).await;
        assert_eq!(tombstoned, 1);

        let mut snapshot = cache.snapshot().await;
        snapshot.sort_by(|x, y| x.name().cmp(y.name()));
        let names: Vec<_> = snapshot
            .iter()
            .map(|item| (item.name().to_string(), item.deleted_at))
            .collect();
        // "three" belongs to another shard and is left alone
        assert_eq!(
            names,
            vec![
                ("one".to_string(), None),
                ("three".to_string(), None),
                ("two".to_string(), Some(at(50))),
            ]
        );

        // a second relist does not move an existing tombstone
        assert_eq!(cache.reconcile_listing(&owned, &listed, at(90)).await, 0);
        let two = cache.snapshot().await.into_iter().find(|item| item.name() == "two").unwrap();
        assert_eq!(two.deleted_at, Some(at(50)));
    }

    #[tokio::test]
    async fn test_reconcile_listing_covers_cluster_scoped_keys() {
        let cache = ResourceCache::new();
        for name in ["keep", "gone"] {
            cache.upsert(ObjectKey::new(None, name), json!({"metadata": {"name": name}})).await;
        }

        let owned: HashSet<_> = [ObjectKey::new(None, "keep"), ObjectKey::new(None, "gone")]
            .into_iter()
            .collect();
        let listed: HashSet<_> = [ObjectKey::new(None, "keep")].into_iter().collect();

        assert_eq!(cache.reconcile_listing(&owned, &listed, at(7)).await, 1);
        let stats = cache.stats().await;
        assert_eq!(stats.live_entries, 1);
        assert_eq!(stats.deleted_entries, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_snapshot_never_sees_torn_writes() {
        let cache = Arc::new(ResourceCache::new());
        let mut writers = vec![];

        for shard in 0..4 {
            let cache = cache.clone();
            writers.push(tokio::spawn(async move {
                let namespace = format!("ns-{shard}");
                for i in 0..200_u64 {
                    let name = format!("foo-{}", i % 20);
                    let key = ObjectKey::new(Some(&namespace), &name);
                    cache.upsert(key.clone(), foo(&name, &namespace, i)).await;
                    if i % 3 == 0 {
                        cache.mark_deleted(&key, at(100)).await;
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }

        let mut last_len = 0;
        while writers.iter().any(|writer| !writer.is_finished()) {
            let snapshot = cache.snapshot().await;
            assert!(snapshot.len() >= last_len, "snapshot shrank without pruning");
            last_len = snapshot.len();
            for item in &snapshot {
                let metadata = &item.resource["metadata"];
                assert!(metadata["name"].as_str().is_some_and(|name| name.starts_with("foo-")));
                assert!(metadata["namespace"].as_str().is_some_and(|ns| ns.starts_with("ns-")));
                assert!(item.resource["spec"]["generation"].is_u64());
            }
            tokio::task::yield_now().await;
        }

        for writer in writers {
            writer.await.unwrap();
        }
        assert_eq!(cache.len().await, 4 * 20);
    }

    #[tokio::test]
    async fn test_prune_tombstones() {
        let cache = ResourceCache::new();
        let old = ObjectKey::new(Some("ns"), "old");
        let recent = ObjectKey::new(Some("ns"), "recent");
        let live = ObjectKey::new(Some("ns"), "live");
        cache.upsert(old.clone(), foo("old", "ns", 1)).await;
        cache.upsert(recent.clone(), foo("recent", "ns", 1)).await;
        cache.upsert(live.clone(), foo("live", "ns", 1)).await;
        cache.mark_deleted(&old, at(0)).await;
        cache.mark_deleted(&recent, at(600)).await;

        let cutoff = at(600) - TimeDelta::seconds(300);
        assert_eq!(cache.prune_tombstones(cutoff).await, 1);

        let mut names: Vec<_> = cache
            .snapshot()
            .await
            .iter()
            .map(|item| item.name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["live", "recent"]);
    }

    #[test]
    fn test_gathered_resource_serialization() {
        let live = GatheredResource::live(json!({"kind": "Foo"}));
        assert_eq!(
            k8s_openapi::serde_json::to_value(&live).unwrap(),
            json!({"resource": {"kind": "Foo"}})
        );

        let deleted = GatheredResource {
            resource: json!({"kind": "Foo"}),
            deleted_at: Some(at(1_615_918_935)),
        };
        assert_eq!(
            k8s_openapi::serde_json::to_value(&deleted).unwrap(),
            json!({"resource": {"kind": "Foo"}, "deleted_at": "2021-03-16T18:22:15Z"})
        );
    }
}
