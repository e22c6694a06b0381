//! # JourneyGo Cache
//!
//! Named request/response stores, modelled on the browser Cache API.
//!
//! ## Architecture
//!
//! ```text
//! CacheStorage (caches)
//!     │
//!     └── Cache ("journeygo-cache-v2")
//!             └── RequestKey → CachedResponse
//! ```
//!
//! Two backends implement the same traits: [`MemoryCacheStorage`] for tests
//! and short-lived hosts, [`SqliteCacheStorage`] for a store that survives
//! restarts of the host process.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use thiserror::Error;
use tracing::trace;
use url::Url;

use journeygo_common::{strip_fragment, strip_search};
use journeygo_net::{NetError, Request, Response, ResponseType};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryCacheStorage;
pub use sqlite::SqliteCacheStorage;

// ==================== Errors ====================

/// Errors that can occur in cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Only GET requests can be cached, got {0}")]
    UnsupportedMethod(String),

    #[error("Corrupt cache entry: {0}")]
    InvalidEntry(String),

    #[error("Failed to read response body: {0}")]
    Body(#[from] NetError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ==================== Keys ====================

/// Request identity: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub method: Method,
    pub url: Url,
}

impl RequestKey {
    pub fn new(method: Method, url: &Url) -> Self {
        Self {
            method,
            url: strip_fragment(url),
        }
    }

    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn from_request(request: &Request) -> Self {
        Self::new(request.method.clone(), &request.url)
    }

    /// Whether a stored key satisfies a lookup for `self`.
    pub fn matches(&self, stored: &RequestKey, options: MatchOptions) -> bool {
        if self.method != stored.method {
            return false;
        }
        if options.ignore_search {
            strip_search(&self.url) == strip_search(&stored.url)
        } else {
            self.url == stored.url
        }
    }
}

/// Options for [`Cache::match_request`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchOptions {
    /// Compare URLs with their query strings removed.
    pub ignore_search: bool,
}

impl MatchOptions {
    pub fn ignore_search() -> Self {
        Self {
            ignore_search: true,
        }
    }
}

// ==================== Snapshots ====================

/// An immutable copy of a response as it was when stored.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub url: Url,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub response_type: ResponseType,
    pub body: Bytes,
    pub cached_at: DateTime<Utc>,
}

impl CachedResponse {
    /// Snapshot a response, consuming its body.
    ///
    /// Pass a duplicate if the response is also going back to a caller.
    pub async fn from_response(response: Response) -> Result<Self, CacheError> {
        let url = response.url.clone();
        let status = response.status.as_u16();
        let response_type = response.response_type;
        let headers = header_pairs(&response.headers);
        let body = response.bytes().await?;

        Ok(Self {
            url,
            status,
            headers,
            response_type,
            body,
            cached_at: Utc::now(),
        })
    }

    /// Build a fresh response that can be handed to a caller.
    pub fn to_response(&self) -> Result<Response, CacheError> {
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| CacheError::InvalidEntry(format!("status {}: {}", self.status, e)))?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| CacheError::InvalidEntry(format!("header {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| CacheError::InvalidEntry(format!("header value: {}", e)))?;
            headers.append(name, value);
        }

        Ok(Response::new(self.url.clone(), status)
            .with_headers(headers)
            .with_type(self.response_type)
            .with_body(self.body.clone())
            .cached())
    }
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| match value.to_str() {
            Ok(v) => Some((name.as_str().to_string(), v.to_string())),
            Err(_) => {
                trace!(header = %name, "Dropping non-UTF-8 header from snapshot");
                None
            }
        })
        .collect()
}

pub(crate) fn ensure_cacheable(key: &RequestKey) -> Result<(), CacheError> {
    if key.method != Method::GET {
        return Err(CacheError::UnsupportedMethod(key.method.to_string()));
    }
    Ok(())
}

// ==================== Traits ====================

/// A single named store.
#[async_trait]
pub trait Cache: Send + Sync {
    fn name(&self) -> &str;

    /// Store `response` under `key`, replacing any previous entry.
    async fn put(&self, key: RequestKey, response: CachedResponse) -> Result<(), CacheError>;

    /// Oldest stored entry matching `key`.
    async fn match_request(
        &self,
        key: &RequestKey,
        options: MatchOptions,
    ) -> Result<Option<CachedResponse>, CacheError>;

    async fn delete(&self, key: &RequestKey) -> Result<bool, CacheError>;

    /// Stored keys in insertion order.
    async fn keys(&self) -> Result<Vec<RequestKey>, CacheError>;
}

/// The set of named stores (the `caches` global).
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a store, creating it if absent.
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, CacheError>;

    async fn has(&self, name: &str) -> Result<bool, CacheError>;

    /// Delete a store and all its entries. `false` if it did not exist.
    async fn delete(&self, name: &str) -> Result<bool, CacheError>;

    /// Store names in creation order.
    async fn keys(&self) -> Result<Vec<String>, CacheError>;
}
