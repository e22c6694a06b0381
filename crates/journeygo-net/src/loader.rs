//! reqwest-backed [`Fetcher`].

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use url::Url;

use journeygo_common::is_same_origin;

use crate::{Fetcher, NetError, Request, RequestMode, Response, ResponseType};

/// Chunks buffered between the socket task and the body reader.
const BODY_CHANNEL_CAPACITY: usize = 16;

/// Resource loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Origin of the application. Responses from it are `basic`.
    pub origin: Option<Url>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("JourneyGo/{}", env!("CARGO_PKG_VERSION")),
            accept_language: "en-US,en;q=0.9".to_string(),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
            origin: None,
        }
    }
}

impl LoaderConfig {
    /// Config for an application served from `origin`.
    pub fn for_origin(origin: Url) -> Self {
        Self {
            origin: Some(origin),
            ..Default::default()
        }
    }
}

/// Fetches over HTTP(S) with a shared connection pool.
pub struct HttpFetcher {
    client: Client,
    config: LoaderConfig,
}

impl HttpFetcher {
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(origin = ?config.origin.as_ref().map(|o| o.as_str()), "HttpFetcher initialized");

        Ok(Self { client, config })
    }

    /// Classify a response by where it finally came from.
    pub fn response_type(&self, request: &Request, final_url: &Url) -> ResponseType {
        let same_origin = match self.config.origin {
            Some(ref origin) => is_same_origin(origin, final_url),
            None => is_same_origin(&request.url, final_url),
        };

        if same_origin {
            ResponseType::Basic
        } else if request.mode == RequestMode::NoCors {
            ResponseType::Opaque
        } else {
            ResponseType::Cors
        }
    }

    fn map_send_error(&self, request: &Request, err: reqwest::Error) -> NetError {
        if err.is_timeout() {
            NetError::Timeout(request.timeout.unwrap_or(self.config.default_timeout))
        } else {
            NetError::HttpError(err)
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .header("Accept-Language", &self.config.accept_language);

        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        if let Some(timeout) = request.timeout {
            req_builder = req_builder.timeout(timeout);
        }

        let response = req_builder
            .send()
            .await
            .map_err(|e| self.map_send_error(&request, e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let response_type = self.response_type(&request, &url);

        trace!(
            url = %url,
            status = %status,
            response_type = ?response_type,
            content_length = ?response.content_length(),
            "Response headers received"
        );

        // The body keeps streaming after we hand the response back.
        let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let body_url = url.clone();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| NetError::Body(e.to_string()));
                let failed = chunk.is_err();
                if tx.send(chunk).await.is_err() {
                    trace!(url = %body_url, "Body reader dropped");
                    return;
                }
                if failed {
                    warn!(url = %body_url, "Body stream failed");
                    return;
                }
            }
        });

        Ok(Response::streaming(url, status, rx)
            .with_headers(headers)
            .with_type(response_type))
    }
}
