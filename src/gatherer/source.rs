/**
 * Inbound change stream consumed by the watch controller
 *
 * The controller only depends on this trait, so the cache and sanitizer
 * never see a client library's types. `crate::k8s::watch` implements it on
 * top of the kube runtime watcher, `super::fake` in memory.
 */
use super::config::GroupVersionResource;
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::serde_json::Value;
use std::fmt;

/// A change notification for one object, or a listing boundary.
///
/// Every (re)list is delivered as `Init`, one `InitApply` per object, then
/// `InitDone`. Between listings, `Apply` carries adds and updates and
/// `Delete` carries the last state of a removed object.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent {
    Init,
    InitApply(Value),
    InitDone,
    Apply(Value),
    Delete(Value),
}

/// Transient failures arrive as `Err` items; the stream keeps going after them.
pub type EventStream = BoxStream<'static, Result<ResourceEvent>>;

/// What one subscription covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchScope {
    pub gvr: GroupVersionResource,
    /// `None` watches every namespace
    pub namespace: Option<String>,
    /// Server-side filter, `None` when there is nothing to exclude
    pub field_selector: Option<String>,
}

impl WatchScope {
    #[must_use]
    pub fn new(gvr: GroupVersionResource, namespace: Option<String>, field_selector: &str) -> Self {
        Self {
            gvr,
            namespace,
            field_selector: (!field_selector.is_empty()).then(|| field_selector.to_string()),
        }
    }
}

impl fmt::Display for WatchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} in namespace {ns}", self.gvr),
            None => write!(f, "{} in all namespaces", self.gvr),
        }
    }
}

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Open a list-then-watch subscription for `scope`.
    ///
    /// # Errors
    ///
    /// Returns an error if the scope cannot be watched at all, e.g. the
    /// resource type is not served.
    async fn subscribe(&self, scope: &WatchScope) -> Result<EventStream>;

    /// Whether objects of `gvr` live in namespaces. Cluster-scoped types
    /// ignore `WatchScope::namespace` and are watched once, cluster-wide.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource type cannot be resolved
    async fn namespaced(&self, gvr: &GroupVersionResource) -> Result<bool> {
        let _ = gvr;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_drops_empty_selector() {
        let gvr = GroupVersionResource::gvr("foobar", "v1", "foos");
        let scope = WatchScope::new(gvr.clone(), None, "");
        assert_eq!(scope.field_selector, None);
        assert_eq!(scope.to_string(), "foobar/v1, Resource=foos in all namespaces");

        let scope = WatchScope::new(gvr, Some("testns".to_string()), "metadata.namespace!=a,");
        assert_eq!(scope.field_selector.as_deref(), Some("metadata.namespace!=a,"));
        assert_eq!(scope.to_string(), "foobar/v1, Resource=foos in namespace testns");
    }
}
