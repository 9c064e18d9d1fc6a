/**
 * Dynamic data gatherer
 *
 * Watches one resource type and serves sanitized snapshots of everything it
 * has seen, including objects deleted within the tombstone retention window.
 * `fetch` only reads the local cache and never waits on the API server.
 */
use super::clock::{Clock, SystemClock};
use super::config::{ConfigDynamic, ControllerSettings, GroupVersionResource};
use super::controller::{ControllerState, WatchController};
use super::namespaces::{generate_field_selector, watch_namespaces};
use super::sanitize::Sanitizer;
use super::source::{EventSource, WatchScope};
use super::store::{GatheredResource, ResourceCache};
use crate::error::{Error, Result};
use crate::k8s::watch::KubeEventSource;
use crate::k8s::{USER_AGENT, client};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Result of a fetch, serialized as `{"items": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatheredList {
    pub items: Vec<GatheredResource>,
}

impl GatheredList {
    /// Order items by namespace, then name.
    pub fn sort_by_name(&mut self) {
        self.items.sort_by(|a, b| {
            let key = |item: &GatheredResource| {
                let namespace = item
                    .resource
                    .get("metadata")
                    .and_then(|metadata| metadata.get("namespace"))
                    .and_then(|ns| ns.as_str())
                    .unwrap_or_default()
                    .to_string();
                (namespace, item.name().to_string())
            };
            key(a).cmp(&key(b))
        });
    }
}

pub struct DynamicGatherer {
    gvr: GroupVersionResource,
    namespaces: Vec<String>,
    field_selector: String,
    cache: Arc<ResourceCache>,
    controller: WatchController,
    sanitizer: Sanitizer,
}

impl ConfigDynamic {
    /// Build a gatherer watching through a kube client made from `kubeconfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or no client can be built
    pub async fn new_data_gatherer(&self) -> Result<DynamicGatherer> {
        self.validate()?;
        let client = client::new(&self.kubeconfig, Some(USER_AGENT)).await?;
        self.new_data_gatherer_with_source(Arc::new(KubeEventSource::new(client)))
    }

    /// Build a gatherer on top of any event source.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configuration is invalid
    pub fn new_data_gatherer_with_source(&self, source: Arc<dyn EventSource>) -> Result<DynamicGatherer> {
        DynamicGatherer::new(self, source)
    }
}

impl DynamicGatherer {
    /// # Errors
    ///
    /// Returns `Error::Config` if the configuration is invalid
    pub fn new(config: &ConfigDynamic, source: Arc<dyn EventSource>) -> Result<Self> {
        config.validate()?;

        let gvr = config.resource_type.clone();
        let field_selector = generate_field_selector(&config.exclude_namespaces);
        let scopes: Vec<WatchScope> = watch_namespaces(&config.include_namespaces)
            .into_iter()
            .map(|namespace| WatchScope::new(gvr.clone(), namespace, &field_selector))
            .collect();
        debug!(
            "Gatherer for {} with {} scope(s), field selector {:?}",
            gvr,
            scopes.len(),
            field_selector
        );

        let cache = Arc::new(ResourceCache::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let controller = WatchController::new(source, scopes, cache.clone(), clock);

        Ok(Self {
            gvr,
            namespaces: config.include_namespaces.clone(),
            field_selector,
            cache,
            controller,
            sanitizer: Sanitizer::default(),
        })
    }

    /// Use `clock` for tombstone timestamps. Only effective before `run`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.controller = self.controller.with_clock(clock);
        self
    }

    /// Only effective before `run`.
    #[must_use]
    pub fn with_settings(mut self, settings: ControllerSettings) -> Self {
        self.controller = self.controller.with_settings(settings);
        self
    }

    #[must_use]
    pub fn with_sanitizer(mut self, sanitizer: Sanitizer) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    #[must_use]
    pub const fn group_version_resource(&self) -> &GroupVersionResource {
        &self.gvr
    }

    /// The configured include list, as given.
    #[must_use]
    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }

    #[must_use]
    pub fn field_selector(&self) -> &str {
        &self.field_selector
    }

    #[must_use]
    pub fn scopes(&self) -> &[WatchScope] {
        self.controller.scopes()
    }

    #[must_use]
    pub fn state(&self) -> ControllerState {
        self.controller.state()
    }

    /// Start watching. Must be called once, before `fetch`.
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyRunning` on a second call and `Error::Subscribe`
    /// if the resource type cannot be watched
    pub async fn run(&self, stop: CancellationToken) -> Result<()> {
        info!("🚀 Starting data gatherer for {}", self.gvr);
        self.controller.run(stop).await
    }

    /// Wait for the initial listing, at most `timeout` if given.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` if `stop` fires first and
    /// `Error::SyncTimeout` when the deadline passes
    pub async fn wait_for_cache_sync(
        &self,
        stop: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.controller.wait_for_cache_sync(stop, timeout).await
    }

    /// Sanitized snapshot of every known object, live or deleted.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotSynced` until the initial listing has completed,
    /// rather than handing out a partial view of the cluster
    pub async fn fetch(&self) -> Result<GatheredList> {
        if !self.controller.has_synced() {
            return Err(Error::NotSynced);
        }

        let mut items = self.cache.snapshot().await;
        for item in &mut items {
            self.sanitizer.sanitize_in_place(&mut item.resource);
        }
        debug!("Fetched {} {} object(s)", items.len(), self.gvr);

        Ok(GatheredList { items })
    }
}
