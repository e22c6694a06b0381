//! The cache manager itself: lifecycle and request entry point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{join_all, try_join_all};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace, warn};
use url::Url;

use journeygo_cache::{Cache, CacheStorage, CachedResponse, MatchOptions, RequestKey};
use journeygo_net::{Fetcher, Request, Response};

use crate::clients::Clients;
use crate::config::SwConfig;
use crate::lifecycle::{LifecycleState, SwEvent};
use crate::pending::PendingWrites;
use crate::strategy::{self, Route};
use crate::SwError;

/// Offline cache manager for one cache version.
///
/// Collaborators are injected: the network through [`Fetcher`], persistence
/// through [`CacheStorage`]. Share it behind an `Arc` to intercept requests
/// from many tasks at once.
pub struct ServiceWorker {
    pub(crate) config: Arc<SwConfig>,
    pub(crate) fetcher: Arc<dyn Fetcher>,
    pub(crate) storage: Arc<dyn CacheStorage>,
    state: RwLock<LifecycleState>,
    /// Store serving traffic; set on activation.
    active_cache: RwLock<Option<Arc<dyn Cache>>>,
    skip_waiting: AtomicBool,
    clients: RwLock<Clients>,
    pub(crate) pending: PendingWrites,
    pub(crate) event_tx: mpsc::UnboundedSender<SwEvent>,
}

impl ServiceWorker {
    /// Create a manager in the `Uninstalled` state.
    pub fn new(
        config: SwConfig,
        fetcher: Arc<dyn Fetcher>,
        storage: Arc<dyn CacheStorage>,
    ) -> (Self, mpsc::UnboundedReceiver<SwEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                config: Arc::new(config),
                fetcher,
                storage,
                state: RwLock::new(LifecycleState::Uninstalled),
                active_cache: RwLock::new(None),
                skip_waiting: AtomicBool::new(false),
                clients: RwLock::new(Clients::new()),
                pending: PendingWrites::default(),
                event_tx,
            },
            event_rx,
        )
    }

    pub fn config(&self) -> &SwConfig {
        &self.config
    }

    pub async fn state(&self) -> LifecycleState {
        *self.state.read().await
    }

    /// Name of the store serving traffic, once active.
    pub async fn active_version(&self) -> Option<String> {
        self.active_cache
            .read()
            .await
            .as_ref()
            .map(|c| c.name().to_string())
    }

    async fn transition(
        &self,
        expected: LifecycleState,
        next: LifecycleState,
    ) -> Result<(), SwError> {
        let mut state = self.state.write().await;
        require_state(*state, expected)?;
        *state = next;
        drop(state);

        self.announce(expected, next);
        Ok(())
    }

    fn announce(&self, from: LifecycleState, to: LifecycleState) {
        debug!(from = %from, to = %to, "Lifecycle transition");
        let _ = self.event_tx.send(SwEvent::StateChanged { from, to });
    }

    // ==================== Install ====================

    /// Populate the current version's store with the app shell.
    ///
    /// All app shell fetches run concurrently; a single failure fails the
    /// install, removes a store this call created and returns the manager to
    /// `Uninstalled` so a later call retries from scratch.
    pub async fn install(&self) -> Result<(), SwError> {
        self.transition(LifecycleState::Uninstalled, LifecycleState::Installing)
            .await?;

        match self.populate_app_shell().await {
            Ok(count) => {
                self.transition(LifecycleState::Installing, LifecycleState::Installed)
                    .await?;
                info!(version = %self.config.cache_version, entries = count, "Installed");
                self.skip_waiting();
                Ok(())
            }
            Err(err) => {
                warn!(version = %self.config.cache_version, error = %err, "Install failed");
                self.transition(LifecycleState::Installing, LifecycleState::Uninstalled)
                    .await?;
                Err(err)
            }
        }
    }

    async fn populate_app_shell(&self) -> Result<usize, SwError> {
        let version = &self.config.cache_version;
        let urls = self.config.app_shell_urls()?;

        let existed = self.storage.has(version).await?;
        let cache = self.storage.open(version).await?;

        let result = self.add_all(cache.as_ref(), urls).await;
        if result.is_err() && !existed {
            match self.storage.delete(version).await {
                Ok(_) => debug!(cache = %version, "Rolled back partial install"),
                Err(e) => warn!(cache = %version, error = %e, "Could not roll back partial install"),
            }
        }
        result
    }

    /// Fetch every URL, then store them all. Nothing is written unless every
    /// fetch succeeded.
    async fn add_all(&self, cache: &dyn Cache, urls: Vec<Url>) -> Result<usize, SwError> {
        let fetches = urls.into_iter().map(|url| async move {
            let install_failed = |reason: String| SwError::InstallFailed {
                url: url.to_string(),
                reason,
            };

            let response = self
                .fetcher
                .fetch(Request::get(url.clone()))
                .await
                .map_err(|e| install_failed(e.to_string()))?;

            if !response.ok() {
                return Err(install_failed(format!("HTTP {}", response.status)));
            }

            let snapshot = CachedResponse::from_response(response)
                .await
                .map_err(|e| install_failed(e.to_string()))?;

            trace!(url = %url, "Fetched app shell entry");
            Ok::<_, SwError>((RequestKey::get(&url), snapshot))
        });

        let entries = try_join_all(fetches).await?;
        let count = entries.len();
        for (key, snapshot) in entries {
            cache.put(key, snapshot).await?;
        }
        Ok(count)
    }

    /// Take over without waiting for existing clients to go away.
    pub fn skip_waiting(&self) {
        self.skip_waiting.store(true, Ordering::SeqCst);
        let _ = self.event_tx.send(SwEvent::SkipWaiting {
            version: self.config.cache_version.clone(),
        });
    }

    /// Whether the installed version asked to activate immediately.
    pub fn is_skipping_waiting(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    // ==================== Activate ====================

    /// Delete every store but the current version, then start serving.
    ///
    /// The state lock is held until the store is live, so concurrent calls
    /// purge once and the rest fail with `InvalidState`.
    pub async fn activate(&self) -> Result<(), SwError> {
        let mut state = self.state.write().await;
        require_state(*state, LifecycleState::Installed)?;

        self.purge_stale_caches().await?;

        let cache = self.storage.open(&self.config.cache_version).await?;
        *self.active_cache.write().await = Some(cache);
        *state = LifecycleState::Active;
        drop(state);

        self.announce(LifecycleState::Installed, LifecycleState::Active);
        let claimed = self.claim_clients().await;
        info!(version = %self.config.cache_version, claimed, "Activated");
        Ok(())
    }

    async fn purge_stale_caches(&self) -> Result<(), SwError> {
        let version = &self.config.cache_version;
        let stale: Vec<String> = self
            .storage
            .keys()
            .await?
            .into_iter()
            .filter(|name| name != version)
            .collect();

        let results = join_all(stale.iter().map(|name| async move {
            (name, self.storage.delete(name).await)
        }))
        .await;

        let mut first_error = None;
        for (name, result) in results {
            match result {
                Ok(true) => {
                    debug!(cache = %name, "Deleted stale cache");
                    let _ = self.event_tx.send(SwEvent::CacheDeleted { name: name.clone() });
                }
                Ok(false) => trace!(cache = %name, "Stale cache already gone"),
                Err(e) => {
                    warn!(cache = %name, error = %e, "Failed to delete stale cache");
                    first_error.get_or_insert(SwError::Cache(e));
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resume as `Active` from a store left by an earlier run, as after a
    /// restart against persistent storage.
    ///
    /// The store counts only if it holds every app shell entry. Stale
    /// versions are purged exactly as on activation.
    pub async fn restore(&self) -> Result<bool, SwError> {
        let mut state = self.state.write().await;
        require_state(*state, LifecycleState::Uninstalled)?;

        let version = &self.config.cache_version;
        if !self.storage.has(version).await? {
            debug!(version = %version, "Nothing to restore");
            return Ok(false);
        }

        let cache = self.storage.open(version).await?;
        if !self.holds_app_shell(cache.as_ref()).await? {
            info!(version = %version, "Stored app shell is incomplete, not restoring");
            return Ok(false);
        }

        self.purge_stale_caches().await?;
        *self.active_cache.write().await = Some(cache);
        *state = LifecycleState::Active;
        drop(state);

        self.announce(LifecycleState::Uninstalled, LifecycleState::Active);
        self.claim_clients().await;
        info!(version = %version, "Restored active cache");
        Ok(true)
    }

    async fn holds_app_shell(&self, cache: &dyn Cache) -> Result<bool, SwError> {
        for url in self.config.app_shell_urls()? {
            let key = RequestKey::get(&url);
            if cache.match_request(&key, MatchOptions::default()).await?.is_none() {
                debug!(cache = %cache.name(), url = %url, "App shell entry missing");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Restore if possible, otherwise install and activate.
    pub async fn ensure_active(&self) -> Result<(), SwError> {
        if self.restore().await? {
            return Ok(());
        }
        self.install().await?;
        self.activate().await
    }

    // ==================== Clients ====================

    /// Register a page. It stays uncontrolled until the next claim.
    pub async fn open_client(&self, url: Url) -> String {
        self.clients.write().await.open_window(url).id
    }

    pub async fn client_controller(&self, id: &str) -> Option<String> {
        self.clients
            .read()
            .await
            .get(id)
            .and_then(|c| c.controller.clone())
    }

    async fn claim_clients(&self) -> usize {
        let version = &self.config.cache_version;
        let count = self.clients.write().await.claim(version);
        let _ = self.event_tx.send(SwEvent::ClientsClaimed {
            version: version.clone(),
            count,
        });
        count
    }

    // ==================== Fetch ====================

    /// Intercept one outgoing request.
    ///
    /// `Ok(None)`: not intercepted, the host should go to the network itself.
    /// `Err(SwError::Network)`: the network failed and no fallback applied.
    pub async fn handle_fetch(&self, request: Request) -> Result<Option<Response>, SwError> {
        let cache = match self.serving_cache().await {
            Some(cache) => cache,
            None => {
                trace!(url = %request.url, "Not active, passing through");
                return Ok(None);
            }
        };

        let route = strategy::classify(&request, &self.config);
        debug!(url = %request.url, method = %request.method, route = ?route, "Intercepting request");

        let response = match route {
            Route::Passthrough => return Ok(None),
            Route::Navigation => self.navigation(cache, request).await?,
            Route::Static => self.cache_first(cache, request).await?,
            Route::Default => self.network_first(cache, request).await?,
        };
        Ok(Some(response))
    }

    async fn serving_cache(&self) -> Option<Arc<dyn Cache>> {
        if !self.state().await.can_intercept_fetch() {
            return None;
        }
        self.active_cache.read().await.clone()
    }

    /// Wait for background store writes started so far.
    pub async fn wait_for_pending_writes(&self) -> usize {
        self.pending.wait().await
    }
}

fn require_state(actual: LifecycleState, expected: LifecycleState) -> Result<(), SwError> {
    if actual != expected {
        return Err(SwError::InvalidState { expected, actual });
    }
    Ok(())
}
