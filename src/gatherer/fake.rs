/**
 * In-memory cluster implementing `EventSource`
 *
 * Objects are filed under the resource guessed from their `apiVersion` and
 * `kind` ("Foo" in "foobar/v1" becomes `foobar/v1, Resource=foos`).
 * Subscriptions see an initial listing followed by every later change in
 * their scope, including field-selector exclusions.
 */
use super::config::GroupVersionResource;
use super::namespaces::field_selector_excludes;
use super::source::{EventSource, EventStream, ResourceEvent, WatchScope};
use super::store::ObjectKey;
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::{StreamExt, future, stream};
use k8s_openapi::serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tokio_stream::wrappers::BroadcastStream;

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum Change {
    Apply(Value),
    Delete(Value),
    Relist(Vec<Value>),
}

#[derive(Debug, Default)]
struct State {
    /// Served resource types and whether each is namespaced
    resources: BTreeMap<GroupVersionResource, bool>,
    objects: BTreeMap<(GroupVersionResource, ObjectKey), Value>,
}

impl State {
    fn objects_of(&self, gvr: &GroupVersionResource) -> Vec<Value> {
        self.objects
            .iter()
            .filter(|((object_gvr, _), _)| object_gvr == gvr)
            .map(|(_, object)| object.clone())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
    changes: broadcast::Sender<(GroupVersionResource, Change)>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            changes,
        }
    }

    /// Serve `gvr` even while no object of that type exists.
    pub async fn register(&self, gvr: GroupVersionResource) {
        self.state.lock().await.resources.insert(gvr, true);
    }

    /// Serve `gvr` as a cluster-scoped type: watches ignore their namespace.
    pub async fn register_cluster_scoped(&self, gvr: GroupVersionResource) {
        self.state.lock().await.resources.insert(gvr, false);
    }

    /// Create or update an object.
    ///
    /// # Errors
    ///
    /// Returns an error if the object lacks `apiVersion`, `kind` or `metadata.name`
    pub async fn apply(&self, object: Value) -> Result<()> {
        let gvr = guess_gvr(&object)?;
        let key = ObjectKey::from_object(&object)
            .ok_or_else(|| Error::Custom("object has no metadata.name".to_string()))?;

        let mut state = self.state.lock().await;
        state.resources.entry(gvr.clone()).or_insert(true);
        state.objects.insert((gvr.clone(), key), object.clone());
        let _ = self.changes.send((gvr, Change::Apply(object)));
        Ok(())
    }

    /// Delete an object and notify watchers.
    ///
    /// # Errors
    ///
    /// Returns an error if the object does not exist
    pub async fn delete(&self, gvr: &GroupVersionResource, namespace: Option<&str>, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let object = Self::remove(&mut state, gvr, namespace, name)?;
        let _ = self.changes.send((gvr.clone(), Change::Delete(object)));
        Ok(())
    }

    /// Delete an object without telling anyone, as if the delete happened
    /// while every watch was disconnected.
    ///
    /// # Errors
    ///
    /// Returns an error if the object does not exist
    pub async fn forget(&self, gvr: &GroupVersionResource, namespace: Option<&str>, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::remove(&mut state, gvr, namespace, name).map(|_| ())
    }

    /// Make every watch on `gvr` relist, as after a reconnect.
    pub async fn relist(&self, gvr: &GroupVersionResource) {
        let state = self.state.lock().await;
        let listing = state.objects_of(gvr);
        let _ = self.changes.send((gvr.clone(), Change::Relist(listing)));
    }

    fn remove(
        state: &mut State,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Value> {
        let key = ObjectKey::new(namespace, name);
        state
            .objects
            .remove(&(gvr.clone(), key.clone()))
            .ok_or_else(|| Error::Custom(format!("{gvr} {key} not found")))
    }
}

#[async_trait]
impl EventSource for FakeCluster {
    async fn subscribe(&self, scope: &WatchScope) -> Result<EventStream> {
        let state = self.state.lock().await;
        let Some(&namespaced) = state.resources.get(&scope.gvr) else {
            return Err(Error::UnknownResource(scope.gvr.to_string()));
        };
        let mut scope = scope.clone();
        if !namespaced {
            scope.namespace = None;
        }
        let listing = listing_events(state.objects_of(&scope.gvr), &scope);
        let changes = BroadcastStream::new(self.changes.subscribe());
        drop(state);

        let updates = changes
            .filter_map(move |change| {
                future::ready(match change {
                    Ok((gvr, change)) if gvr == scope.gvr => {
                        Some(stream::iter(events_for(change, &scope)))
                    }
                    _ => None,
                })
            })
            .flatten();

        Ok(stream::iter(listing).chain(updates).map(Ok).boxed())
    }

    async fn namespaced(&self, gvr: &GroupVersionResource) -> Result<bool> {
        self.state
            .lock()
            .await
            .resources
            .get(gvr)
            .copied()
            .ok_or_else(|| Error::UnknownResource(gvr.to_string()))
    }
}

fn events_for(change: Change, scope: &WatchScope) -> Vec<ResourceEvent> {
    match change {
        Change::Apply(object) if in_scope(scope, &object) => vec![ResourceEvent::Apply(object)],
        Change::Delete(object) if in_scope(scope, &object) => vec![ResourceEvent::Delete(object)],
        Change::Relist(objects) => listing_events(objects, scope),
        Change::Apply(_) | Change::Delete(_) => vec![],
    }
}

fn listing_events(objects: Vec<Value>, scope: &WatchScope) -> Vec<ResourceEvent> {
    let mut events = vec![ResourceEvent::Init];
    events.extend(
        objects
            .into_iter()
            .filter(|object| in_scope(scope, object))
            .map(ResourceEvent::InitApply),
    );
    events.push(ResourceEvent::InitDone);
    events
}

fn in_scope(scope: &WatchScope, object: &Value) -> bool {
    let namespace = object
        .get("metadata")
        .and_then(|metadata| metadata.get("namespace"))
        .and_then(Value::as_str)
        .filter(|ns| !ns.is_empty());

    let namespace_matches = scope
        .namespace
        .as_deref()
        .is_none_or(|wanted| namespace == Some(wanted));
    let selected = scope
        .field_selector
        .as_deref()
        .is_none_or(|selector| !field_selector_excludes(selector, namespace));

    namespace_matches && selected
}

fn guess_gvr(object: &Value) -> Result<GroupVersionResource> {
    let api_version = object
        .get("apiVersion")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Custom("object has no apiVersion".to_string()))?;
    let kind = object
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Custom("object has no kind".to_string()))?;

    let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
    Ok(GroupVersionResource::gvr(group, version, &guess_resource(kind)))
}

/// Lower-cased plural of `kind`, the way API servers usually name resources.
#[must_use]
pub fn guess_resource(kind: &str) -> String {
    let kind = kind.to_lowercase();
    if kind.ends_with('s') {
        format!("{kind}es")
    } else if let Some(stem) = kind.strip_suffix('y') {
        format!("{stem}ies")
    } else {
        format!("{kind}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::serde_json::json;

    fn foos() -> GroupVersionResource {
        GroupVersionResource::gvr("foobar", "v1", "foos")
    }

    fn foo(name: &str, namespace: &str) -> Value {
        json!({
            "apiVersion": "foobar/v1",
            "kind": "Foo",
            "metadata": {"name": name, "namespace": namespace},
        })
    }

    #[test]
    fn test_guess_resource() {
        assert_eq!(guess_resource("Foo"), "foos");
        assert_eq!(guess_resource("Secret"), "secrets");
        assert_eq!(guess_resource("Ingress"), "ingresses");
        assert_eq!(guess_resource("NetworkPolicy"), "networkpolicies");
    }

    #[tokio::test]
    async fn test_unknown_resource_cannot_be_watched() {
        let cluster = FakeCluster::new();
        let scope = WatchScope::new(foos(), None, "");
        assert!(matches!(
            cluster.subscribe(&scope).await,
            Err(Error::UnknownResource(_))
        ));

        cluster.register(foos()).await;
        assert!(cluster.subscribe(&scope).await.is_ok());
    }

    #[tokio::test]
    async fn test_listing_respects_scope() {
        let cluster = FakeCluster::new();
        cluster.apply(foo("a", "testns")).await.unwrap();
        cluster.apply(foo("b", "kube-system")).await.unwrap();
        cluster
            .apply(json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "svc", "namespace": "testns"}}))
            .await
            .unwrap();

        let scope = WatchScope::new(foos(), None, "metadata.namespace!=kube-system,");
        let mut events = cluster.subscribe(&scope).await.unwrap();

        assert_eq!(events.next().await.unwrap().unwrap(), ResourceEvent::Init);
        assert_eq!(
            events.next().await.unwrap().unwrap(),
            ResourceEvent::InitApply(foo("a", "testns"))
        );
        assert_eq!(events.next().await.unwrap().unwrap(), ResourceEvent::InitDone);

        cluster.apply(foo("c", "kube-system")).await.unwrap();
        cluster.delete(&foos(), Some("testns"), "a").await.unwrap();
        assert_eq!(
            events.next().await.unwrap().unwrap(),
            ResourceEvent::Delete(foo("a", "testns"))
        );
    }

    #[tokio::test]
    async fn test_cluster_scoped_watch_ignores_namespace() {
        let namespaces = GroupVersionResource::gvr("", "v1", "namespaces");
        let cluster = FakeCluster::new();
        cluster.register_cluster_scoped(namespaces.clone()).await;
        let default = json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "default"}});
        cluster.apply(default.clone()).await.unwrap();

        assert!(!cluster.namespaced(&namespaces).await.unwrap());
        assert!(cluster.namespaced(&foos()).await.is_err());

        let scope = WatchScope::new(namespaces, Some("a".to_string()), "");
        let mut events = cluster.subscribe(&scope).await.unwrap();
        assert_eq!(events.next().await.unwrap().unwrap(), ResourceEvent::Init);
        assert_eq!(
            events.next().await.unwrap().unwrap(),
            ResourceEvent::InitApply(default)
        );
    }

    #[tokio::test]
    async fn test_delete_missing_object_fails() {
        let cluster = FakeCluster::new();
        assert!(cluster.delete(&foos(), Some("testns"), "nope").await.is_err());
        assert!(cluster.apply(json!({"kind": "Foo"})).await.is_err());
    }
}
