//! # JourneyGo Net
//!
//! Request/response model and network access for the JourneyGo offline cache.
//!
//! ## Design Goals
//!
//! 1. **Request shape**: method, URL, mode and destination are all the cache
//!    layer needs to route a request
//! 2. **Single-read bodies**: a [`Response`] body is consumed by value; use
//!    [`Response::duplicate`] before handing one response to two consumers
//! 3. **Pluggable network**: everything that touches the network goes through
//!    the [`Fetcher`] trait so the cache policy can be driven by test doubles

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

pub mod loader;

pub use loader::{HttpFetcher, LoaderConfig};

/// Errors that can occur in networking.
///
/// Every variant is a network-level failure. An HTTP error status is not an
/// error here; it arrives as an ordinary [`Response`].
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network unavailable")]
    Offline,

    #[error("Body stream failed: {0}")]
    Body(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Request mode, as set by the page that issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    /// Top-level document load.
    Navigate,
    SameOrigin,
    NoCors,
    #[default]
    Cors,
}

/// What the requested resource will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    /// `fetch()`/XHR calls and anything without a declared role.
    #[default]
    Empty,
    Document,
    Style,
    Script,
    Font,
    Image,
    Manifest,
}

impl Destination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Destination::Empty => "",
            Destination::Document => "document",
            Destination::Style => "style",
            Destination::Script => "script",
            Destination::Font => "font",
            Destination::Image => "image",
            Destination::Manifest => "manifest",
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Empty => f.write_str("empty"),
            other => f.write_str(other.as_str()),
        }
    }
}

impl FromStr for Destination {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "empty" => Ok(Destination::Empty),
            "document" => Ok(Destination::Document),
            "style" => Ok(Destination::Style),
            "script" => Ok(Destination::Script),
            "font" => Ok(Destination::Font),
            "image" => Ok(Destination::Image),
            "manifest" => Ok(Destination::Manifest),
            other => Err(NetError::RequestFailed(format!(
                "unknown request destination '{}'",
                other
            ))),
        }
    }
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
    pub destination: Destination,
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::Cors,
            destination: Destination::Empty,
            timeout: None,
        }
    }

    /// Create a top-level document load.
    pub fn navigate(url: Url) -> Self {
        Self::get(url)
            .mode(RequestMode::Navigate)
            .destination(Destination::Document)
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get(url)
        }
    }

    /// Set the method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the destination.
    pub fn destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// How much of a response the requesting page may inspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    /// Same-origin response.
    #[default]
    Basic,
    /// Cross-origin response with CORS headers.
    Cors,
    /// Cross-origin `no-cors` response; status and body are hidden.
    Opaque,
}

/// HTTP response.
#[derive(Debug)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub response_type: ResponseType,
    pub content_type: Option<Mime>,
    /// Served from the local cache rather than the network.
    pub from_cache: bool,
    body: ResponseBody,
}

/// Response body variants.
#[derive(Debug)]
enum ResponseBody {
    /// Full body already loaded.
    Full(Bytes),
    /// Streaming body.
    Stream(mpsc::Receiver<Result<Bytes, NetError>>),
    /// Empty.
    Empty,
}

impl Response {
    /// Create a response with an empty body.
    pub fn new(url: Url, status: StatusCode) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            response_type: ResponseType::Basic,
            content_type: None,
            from_cache: false,
            body: ResponseBody::Empty,
        }
    }

    /// Create a response whose body arrives as chunks on `chunks`.
    pub fn streaming(
        url: Url,
        status: StatusCode,
        chunks: mpsc::Receiver<Result<Bytes, NetError>>,
    ) -> Self {
        Self {
            body: ResponseBody::Stream(chunks),
            ..Self::new(url, status)
        }
    }

    /// Set a fully loaded body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = ResponseBody::Full(body.into());
        self
    }

    /// Set headers, deriving `content_type` from them.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.content_type = parse_content_type(&headers);
        self.headers = headers;
        self
    }

    /// Set the response type.
    pub fn with_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Mark as served from the local cache.
    pub fn cached(mut self) -> Self {
        self.from_cache = true;
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Produce an independent copy of this response.
    ///
    /// A streaming body is drained into memory first so both copies can be
    /// read in full. Fails if the stream itself fails.
    pub async fn duplicate(&mut self) -> Result<Response, NetError> {
        if let ResponseBody::Stream(rx) = &mut self.body {
            let buffered = drain(rx).await?;
            debug!(url = %self.url, len = buffered.len(), "Buffered streaming body for duplication");
            self.body = ResponseBody::Full(buffered);
        }

        let body = match &self.body {
            ResponseBody::Full(b) => ResponseBody::Full(b.clone()),
            _ => ResponseBody::Empty,
        };

        Ok(Response {
            url: self.url.clone(),
            status: self.status,
            headers: self.headers.clone(),
            response_type: self.response_type,
            content_type: self.content_type.clone(),
            from_cache: self.from_cache,
            body,
        })
    }

    /// Get the body as bytes.
    pub async fn bytes(self) -> Result<Bytes, NetError> {
        match self.body {
            ResponseBody::Full(b) => Ok(b),
            ResponseBody::Stream(mut rx) => drain(&mut rx).await,
            ResponseBody::Empty => Ok(Bytes::new()),
        }
    }

    /// Get the body as text.
    pub async fn text(self) -> Result<String, NetError> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| NetError::Body(e.to_string()))
    }
}

async fn drain(rx: &mut mpsc::Receiver<Result<Bytes, NetError>>) -> Result<Bytes, NetError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = rx.recv().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

pub(crate) fn parse_content_type(headers: &HeaderMap) -> Option<Mime> {
    headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<Mime>().ok())
}

/// Anything that can put a request on the wire.
///
/// `Err` means the network failed; HTTP error statuses come back as `Ok`.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: Request) -> Result<Response, NetError>;
}

/// A fetcher with no network at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineFetcher;

#[async_trait]
impl Fetcher for OfflineFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        debug!(url = %request.url, "Offline, refusing fetch");
        Err(NetError::Offline)
    }
}
