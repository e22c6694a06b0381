//! Request routing and the three caching strategies.

use std::sync::Arc;

use http::Method;
use tracing::{debug, trace, warn};

use journeygo_cache::{Cache, CacheError, CachedResponse, MatchOptions, RequestKey};
use journeygo_net::{Destination, NetError, Request, Response, ResponseType};

use crate::config::SwConfig;
use crate::lifecycle::SwEvent;
use crate::worker::ServiceWorker;
use crate::SwError;

/// How an intercepted request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Not intercepted; the store is neither read nor written.
    Passthrough,
    /// Network-first, fallback document when offline.
    Navigation,
    /// Cache-first for static sub-resources.
    Static,
    /// Network-first, exact cached match when offline.
    Default,
}

/// Pick a route from the request's shape. Checked in order: method, mode,
/// destination.
pub fn classify(request: &Request, config: &SwConfig) -> Route {
    if request.method != Method::GET {
        return Route::Passthrough;
    }
    if !matches!(request.url.scheme(), "http" | "https") {
        return Route::Passthrough;
    }
    if request.is_navigation() {
        return Route::Navigation;
    }
    if config.is_cacheable_destination(request.destination) {
        return Route::Static;
    }
    Route::Default
}

/// Only complete same-origin responses may replace what is in the store.
pub fn is_storable(response: &Response) -> bool {
    response.status == http::StatusCode::OK && response.response_type == ResponseType::Basic
}

impl ServiceWorker {
    pub(crate) async fn navigation(
        &self,
        cache: Arc<dyn Cache>,
        request: Request,
    ) -> Result<Response, SwError> {
        let key = RequestKey::from_request(&request);
        let err = match self.fetch_and_store(&cache, key, request).await {
            Ok(response) => return Ok(response),
            Err(err) => err,
        };

        let fallback = RequestKey::get(&self.config.fallback_document_url()?);
        debug!(error = %err, fallback = %fallback.url, "Navigation failed, serving fallback document");
        match self.lookup(&cache, &fallback, MatchOptions::ignore_search()).await {
            Some(response) => Ok(response),
            None => Err(SwError::Network(err)),
        }
    }

    pub(crate) async fn cache_first(
        &self,
        cache: Arc<dyn Cache>,
        request: Request,
    ) -> Result<Response, SwError> {
        let key = RequestKey::from_request(&request);
        if let Some(hit) = self.lookup(&cache, &key, MatchOptions::default()).await {
            trace!(url = %key.url, "Cache hit");
            return Ok(hit);
        }

        let destination = request.destination;
        let err = match self.fetch_and_store(&cache, key, request).await {
            Ok(response) => return Ok(response),
            Err(err) => err,
        };

        if destination != Destination::Image {
            return Err(SwError::Network(err));
        }

        let placeholder = RequestKey::get(&self.config.fallback_image_url()?);
        debug!(error = %err, fallback = %placeholder.url, "Image failed, serving placeholder");
        match self.lookup(&cache, &placeholder, MatchOptions::default()).await {
            Some(response) => Ok(response),
            None => Err(SwError::Network(err)),
        }
    }

    pub(crate) async fn network_first(
        &self,
        cache: Arc<dyn Cache>,
        request: Request,
    ) -> Result<Response, SwError> {
        let key = RequestKey::from_request(&request);
        let err = match self.fetch_and_store(&cache, key.clone(), request).await {
            Ok(response) => return Ok(response),
            Err(err) => err,
        };

        debug!(error = %err, url = %key.url, "Network failed, trying cache");
        match self.lookup(&cache, &key, MatchOptions::default()).await {
            Some(response) => Ok(response),
            None => Err(SwError::Network(err)),
        }
    }

    /// Fetch; if the response is storable, write a duplicate in the
    /// background and return the original.
    async fn fetch_and_store(
        &self,
        cache: &Arc<dyn Cache>,
        key: RequestKey,
        request: Request,
    ) -> Result<Response, NetError> {
        let mut response = self.fetcher.fetch(request).await?;

        if !is_storable(&response) {
            trace!(
                url = %key.url,
                status = %response.status,
                response_type = ?response.response_type,
                "Not storing response"
            );
            return Ok(response);
        }

        let copy = response.duplicate().await?;
        self.store_in_background(Arc::clone(cache), key, copy).await;
        Ok(response)
    }

    async fn store_in_background(&self, cache: Arc<dyn Cache>, key: RequestKey, copy: Response) {
        let events = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            let url = key.url.to_string();
            if let Err(e) = write_entry(cache.as_ref(), key, copy).await {
                warn!(cache = %cache.name(), url = %url, error = %e, "Cache write failed");
                let _ = events.send(SwEvent::CacheWriteFailed {
                    url,
                    reason: e.to_string(),
                });
            }
        });
        self.pending.track(handle).await;
    }

    /// Cached response for `key`, treating store errors as a miss.
    async fn lookup(
        &self,
        cache: &Arc<dyn Cache>,
        key: &RequestKey,
        options: MatchOptions,
    ) -> Option<Response> {
        let snapshot = match cache.match_request(key, options).await {
            Ok(snapshot) => snapshot?,
            Err(e) => {
                warn!(url = %key.url, error = %e, "Cache lookup failed");
                return None;
            }
        };

        match snapshot.to_response() {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(url = %key.url, error = %e, "Discarding unreadable cache entry");
                None
            }
        }
    }
}

async fn write_entry(cache: &dyn Cache, key: RequestKey, copy: Response) -> Result<(), CacheError> {
    let snapshot = CachedResponse::from_response(copy).await?;
    cache.put(key, snapshot).await
}
