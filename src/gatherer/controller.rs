/**
 * Watch controller
 *
 * Runs one shard per watch scope. Each shard applies its notifications to
 * the shared cache in arrival order, so per-object ordering is that of the
 * remote stream. Readiness is published on a `watch` channel once every
 * shard has delivered its initial listing.
 */
use super::clock::Clock;
use super::config::ControllerSettings;
use super::source::{EventSource, EventStream, ResourceEvent, WatchScope};
use super::store::{ObjectKey, ResourceCache};
use crate::error::{Error, Result};
use futures::StreamExt;
use k8s_openapi::serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ControllerState {
    Created,
    Starting,
    Synced,
    Running,
    Stopped,
}

pub struct WatchController {
    source: Arc<dyn EventSource>,
    scopes: Vec<WatchScope>,
    cache: Arc<ResourceCache>,
    clock: Arc<dyn Clock>,
    settings: ControllerSettings,
    state: Arc<watch::Sender<ControllerState>>,
    has_synced: Arc<AtomicBool>,
}

impl WatchController {
    #[must_use]
    pub fn new(
        source: Arc<dyn EventSource>,
        scopes: Vec<WatchScope>,
        cache: Arc<ResourceCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (state, _) = watch::channel(ControllerState::Created);
        Self {
            source,
            scopes,
            cache,
            clock,
            settings: ControllerSettings::default(),
            state: Arc::new(state),
            has_synced: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: ControllerSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn scopes(&self) -> &[WatchScope] {
        &self.scopes
    }

    #[must_use]
    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    /// Whether the initial listing completed at some point, even if the
    /// controller has stopped since.
    #[must_use]
    pub fn has_synced(&self) -> bool {
        self.has_synced.load(Ordering::Acquire)
    }

    /// Subscribe every scope and start applying notifications.
    ///
    /// Returns once all subscriptions are established; the initial listings
    /// are processed in the background.
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyRunning` on a second call, or `Error::Subscribe`
    /// if any scope cannot be watched, in which case nothing is started.
    pub async fn run(&self, stop: CancellationToken) -> Result<()> {
        let mut claimed = false;
        self.state.send_if_modified(|state| {
            claimed = *state == ControllerState::Created;
            if claimed {
                *state = ControllerState::Starting;
            }
            claimed
        });
        if !claimed {
            return Err(Error::AlreadyRunning);
        }

        let scopes = match self.effective_scopes().await {
            Ok(scopes) => scopes,
            Err(e) => {
                self.state.send_replace(ControllerState::Stopped);
                return Err(e);
            }
        };

        let mut streams = Vec::with_capacity(scopes.len());
        for scope in &scopes {
            match self.source.subscribe(scope).await {
                Ok(stream) => streams.push(stream),
                Err(e) => {
                    error!("❌ Failed to watch {}: {}", scope, e);
                    self.state.send_replace(ControllerState::Stopped);
                    return Err(Error::Subscribe {
                        scope: scope.to_string(),
                        source: Box::new(e),
                    });
                }
            }
        }

        let pending = Arc::new(AtomicUsize::new(scopes.len()));
        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(scopes.len() + 1);
        for (scope, stream) in scopes.iter().cloned().zip(streams) {
            let shard = Shard {
                scope,
                source: self.source.clone(),
                cache: self.cache.clone(),
                clock: self.clock.clone(),
                settings: self.settings.clone(),
                state: self.state.clone(),
                has_synced: self.has_synced.clone(),
                pending: pending.clone(),
                owned: HashSet::new(),
                listing: None,
                synced: false,
            };
            let stop = stop.clone();
            handles.push(tokio::spawn(async move { shard.run(stream, stop).await }));
        }

        if let Some(retention) = self.settings.tombstone_retention {
            let cache = self.cache.clone();
            let clock = self.clock.clone();
            let interval = self.settings.janitor_interval;
            let stop = stop.clone();
            handles.push(tokio::spawn(async move {
                run_janitor(cache, clock, retention, interval, stop).await;
            }));
        }

        // Stopped only once every task is gone, so no mutation follows it.
        let state = self.state.clone();
        tokio::spawn(async move {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!("❌ Watch task failed: {}", e);
                }
            }
            state.send_replace(ControllerState::Stopped);
            info!("🛑 Watch controller stopped");
        });

        info!("🔍 Watch streams started for {} scope(s)", scopes.len());
        Ok(())
    }

    /// The configured scopes, or a single cluster-wide scope when the
    /// resource type is not namespaced.
    async fn effective_scopes(&self) -> Result<Vec<WatchScope>> {
        let Some(first) = self.scopes.iter().find(|scope| scope.namespace.is_some()) else {
            return Ok(self.scopes.clone());
        };

        let namespaced = self
            .source
            .namespaced(&first.gvr)
            .await
            .map_err(|e| {
                error!("❌ Failed to resolve {}: {}", first.gvr, e);
                Error::Subscribe {
                    scope: first.to_string(),
                    source: Box::new(e),
                }
            })?;
        if namespaced {
            return Ok(self.scopes.clone());
        }

        info!(
            "🔍 {} is cluster-scoped, watching it once instead of per namespace",
            first.gvr
        );
        Ok(vec![WatchScope {
            namespace: None,
            ..first.clone()
        }])
    }

    /// Block until every shard delivered its initial listing.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` if `stop` fires or the controller stops
    /// first, and `Error::SyncTimeout` once `timeout` elapses.
    pub async fn wait_for_cache_sync(
        &self,
        stop: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if self.has_synced() {
            return Ok(());
        }

        let mut state = self.state.subscribe();
        let synced = async move {
            loop {
                let current = *state.borrow_and_update();
                match current {
                    ControllerState::Synced | ControllerState::Running => return Ok(()),
                    ControllerState::Stopped => return Err(Error::Cancelled),
                    ControllerState::Created | ControllerState::Starting => {}
                }
                if state.changed().await.is_err() {
                    return Err(Error::Cancelled);
                }
            }
        };
        let bounded = async move {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, synced)
                    .await
                    .unwrap_or(Err(Error::SyncTimeout(limit))),
                None => synced.await,
            }
        };

        tokio::select! {
            biased;
            () = stop.cancelled() => Err(Error::Cancelled),
            result = bounded => result,
        }
    }
}

/// Applies one scope's notifications to the cache.
struct Shard {
    scope: WatchScope,
    source: Arc<dyn EventSource>,
    cache: Arc<ResourceCache>,
    clock: Arc<dyn Clock>,
    settings: ControllerSettings,
    state: Arc<watch::Sender<ControllerState>>,
    has_synced: Arc<AtomicBool>,
    /// Shards that have not finished their first listing yet
    pending: Arc<AtomicUsize>,
    /// Live keys this shard delivered; only these are reconciled on relist
    owned: HashSet<ObjectKey>,
    /// Keys seen by the listing in progress
    listing: Option<HashSet<ObjectKey>>,
    synced: bool,
}

impl Shard {
    async fn run(mut self, mut stream: EventStream, stop: CancellationToken) {
        debug!("🔍 Starting watcher for {}", self.scope);

        loop {
            self.drain(&mut stream, &stop).await;
            if stop.is_cancelled() {
                break;
            }

            info!("🔍 Watch for {} ended, restarting...", self.scope);
            match self.resubscribe(&stop).await {
                Some(next) => stream = next,
                None => break,
            }
        }

        debug!("Watcher for {} exited", self.scope);
    }

    async fn drain(&mut self, stream: &mut EventStream, stop: &CancellationToken) {
        loop {
            let next = tokio::select! {
                biased;
                () = stop.cancelled() => return,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(event)) => self.apply(event).await,
                Some(Err(e)) => warn!("Watch error for {}, retrying: {}", self.scope, e),
                None => return,
            }
        }
    }

    /// Open a new stream with exponential backoff. `None` when stopped or
    /// out of attempts.
    async fn resubscribe(&self, stop: &CancellationToken) -> Option<EventStream> {
        let mut delay = self.settings.restart_delay;
        let mut backoff = self.settings.initial_backoff;
        let mut restart_count = 0;

        loop {
            tokio::select! {
                biased;
                () = stop.cancelled() => return None,
                () = sleep(delay) => {}
            }

            match self.source.subscribe(&self.scope).await {
                Ok(stream) => return Some(stream),
                Err(e) => {
                    restart_count += 1;
                    if restart_count >= self.settings.max_restarts {
                        error!(
                            "❌ Watcher for {} exceeded maximum restart attempts ({}), stopping",
                            self.scope, self.settings.max_restarts
                        );
                        return None;
                    }
                    error!(
                        "❌ Watcher for {} failed (attempt {}/{}): {}, restarting in {:?}",
                        self.scope, restart_count, self.settings.max_restarts, e, backoff
                    );
                    delay = backoff;
                    backoff = (backoff * 2).min(self.settings.max_backoff);
                }
            }
        }
    }

    async fn apply(&mut self, event: ResourceEvent) {
        match event {
            ResourceEvent::Init => {
                debug!("Listing {}", self.scope);
                self.listing = Some(HashSet::new());
            }
            ResourceEvent::InitApply(object) => {
                if let Some(key) = self.key_of(&object) {
                    if let Some(listing) = self.listing.as_mut() {
                        listing.insert(key.clone());
                    }
                    self.cache.upsert(key, object).await;
                }
            }
            ResourceEvent::InitDone => {
                if let Some(listed) = self.listing.take() {
                    let missing = self
                        .cache
                        .reconcile_listing(&self.owned, &listed, self.clock.now())
                        .await;
                    if missing > 0 {
                        info!("🗑️  {} object(s) of {} vanished during relist", missing, self.scope);
                    }
                    self.owned = listed;
                }
                if !self.synced {
                    self.synced = true;
                    self.mark_synced();
                }
            }
            ResourceEvent::Apply(object) => {
                if let Some(key) = self.key_of(&object) {
                    debug!("📝 Applied: {}", key);
                    self.owned.insert(key.clone());
                    self.cache.upsert(key, object).await;
                    self.mark_running();
                }
            }
            ResourceEvent::Delete(object) => {
                if let Some(key) = self.key_of(&object) {
                    debug!("🗑️  Deleted: {}", key);
                    self.cache.mark_deleted(&key, self.clock.now()).await;
                    self.owned.remove(&key);
                    self.mark_running();
                }
            }
        }
    }

    fn key_of(&self, object: &Value) -> Option<ObjectKey> {
        let key = ObjectKey::from_object(object);
        if key.is_none() {
            warn!("Skipping {} object without metadata.name", self.scope);
        }
        key
    }

    fn mark_synced(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.has_synced.store(true, Ordering::Release);
            self.state.send_if_modified(|state| {
                let starting = *state == ControllerState::Starting;
                if starting {
                    *state = ControllerState::Synced;
                }
                starting
            });
            info!("✅ Cache synced");
        }
    }

    fn mark_running(&self) {
        self.state.send_if_modified(|state| {
            let synced = *state == ControllerState::Synced;
            if synced {
                *state = ControllerState::Running;
            }
            synced
        });
    }
}

async fn run_janitor(
    cache: Arc<ResourceCache>,
    clock: Arc<dyn Clock>,
    retention: chrono::TimeDelta,
    interval: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => break,
            _ = ticker.tick() => {
                let pruned = cache.prune_tombstones(clock.now() - retention).await;
                if pruned > 0 {
                    let stats = cache.stats().await;
                    debug!(
                        "Pruned {} expired tombstone(s), {} live and {} deleted remain",
                        pruned, stats.live_entries, stats.deleted_entries
                    );
                }
            }
        }
    }
}
