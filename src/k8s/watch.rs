/**
 * `EventSource` backed by the kube runtime watcher
 *
 * Resource types are resolved through API discovery, so any served
 * group/version/resource can be watched as `DynamicObject`s.
 */
use crate::error::{Error, Result};
use crate::gatherer::config::GroupVersionResource;
use crate::gatherer::source::{EventSource, EventStream, ResourceEvent, WatchScope};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::serde_json::{self, Value};
use kube::api::{Api, DynamicObject};
use kube::core::GroupVersion;
use kube::discovery::{self, ApiCapabilities, ApiResource, Scope};
use kube::Client;
use kube::runtime::{WatchStreamExt, watcher};
use tracing::debug;

#[derive(Clone)]
pub struct KubeEventSource {
    client: Client,
}

impl KubeEventSource {
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self { client }
    }

    /// Look up `gvr` in the server's discovery document.
    async fn resolve(&self, gvr: &GroupVersionResource) -> Result<(ApiResource, ApiCapabilities)> {
        let gv = GroupVersion::gv(&gvr.group, &gvr.version);
        let group = match discovery::pinned_group(&self.client, &gv).await {
            Ok(group) => group,
            Err(kube::Error::Api(response)) if response.code == 404 => {
                return Err(Error::UnknownResource(gvr.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        group
            .versioned_resources(&gvr.version)
            .into_iter()
            .find(|(resource, _)| resource.plural == gvr.resource)
            .ok_or_else(|| Error::UnknownResource(gvr.to_string()))
    }
}

#[async_trait]
impl EventSource for KubeEventSource {
    async fn subscribe(&self, scope: &WatchScope) -> Result<EventStream> {
        let (resource, caps) = self.resolve(&scope.gvr).await?;
        debug!("Resolved {} to kind {}", scope.gvr, resource.kind);

        let api: Api<DynamicObject> = match watch_namespace(&caps.scope, scope.namespace.as_deref()) {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        };

        let mut config = watcher::Config::default();
        if let Some(selector) = &scope.field_selector {
            config = config.fields(selector);
        }

        let stream = watcher(api, config)
            .default_backoff()
            .map(move |event| match event {
                Ok(event) => to_resource_event(event, &resource),
                Err(e) => Err(Error::Watch(e)),
            })
            .boxed();

        Ok(stream)
    }

    async fn namespaced(&self, gvr: &GroupVersionResource) -> Result<bool> {
        let (_, caps) = self.resolve(gvr).await?;
        Ok(matches!(caps.scope, Scope::Namespaced))
    }
}

/// Namespace to list and watch in; `None` is a cluster-wide watch.
fn watch_namespace<'a>(scope: &Scope, namespace: Option<&'a str>) -> Option<&'a str> {
    match scope {
        Scope::Namespaced => namespace,
        Scope::Cluster => None,
    }
}

fn to_resource_event(event: watcher::Event<DynamicObject>, resource: &ApiResource) -> Result<ResourceEvent> {
    Ok(match event {
        watcher::Event::Init => ResourceEvent::Init,
        watcher::Event::InitApply(object) => ResourceEvent::InitApply(to_value(&object, resource)?),
        watcher::Event::InitDone => ResourceEvent::InitDone,
        watcher::Event::Apply(object) => ResourceEvent::Apply(to_value(&object, resource)?),
        watcher::Event::Delete(object) => ResourceEvent::Delete(to_value(&object, resource)?),
    })
}

/// Watch payloads from list calls omit `apiVersion` and `kind`; put them back.
fn to_value(object: &DynamicObject, resource: &ApiResource) -> Result<Value> {
    let mut value = serde_json::to_value(object)?;
    if let Some(fields) = value.as_object_mut() {
        fields
            .entry("apiVersion")
            .or_insert_with(|| Value::String(resource.api_version.clone()));
        fields
            .entry("kind")
            .or_insert_with(|| Value::String(resource.kind.clone()));
    }
    Ok(value)
}
