//! End-to-end behaviour of the cache manager against scripted networks.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::StatusCode;
use tokio::sync::mpsc;
use url::Url;

use journeygo_cache::{
    Cache, CacheError, CacheStorage, CachedResponse, MatchOptions, MemoryCacheStorage, RequestKey,
    SqliteCacheStorage,
};
use journeygo_net::{
    Destination, Fetcher, NetError, OfflineFetcher, Request, Response, ResponseType,
};
use journeygo_sw::{LifecycleState, ServiceWorker, SwConfig, SwError, SwEvent};

const ORIGIN: &str = "https://journeygo.test/";
const VERSION: &str = "journeygo-cache-v2";

fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

fn config() -> SwConfig {
    SwConfig::for_origin(Url::parse(ORIGIN).unwrap())
}

// ==================== Test doubles ====================

#[derive(Clone)]
enum Script {
    Serve {
        status: StatusCode,
        body: Bytes,
        response_type: ResponseType,
        streamed: bool,
    },
    Fail,
}

/// Network double: scripted per URL, records every call.
#[derive(Default)]
struct ScriptedFetcher {
    routes: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<String>>,
    offline: AtomicBool,
    forbidden: AtomicBool,
}

impl ScriptedFetcher {
    fn with_app_shell() -> Arc<Self> {
        let fetcher = Self::default();
        fetcher.serve("/", "<html>root</html>");
        fetcher.serve("/index.html", "<html>shell</html>");
        fetcher.serve("/manifest.json", r#"{"name":"JourneyGo"}"#);
        fetcher.serve("/icons/icon-192.png", "png-192");
        fetcher.serve("/icons/icon-512.png", "png-512");
        Arc::new(fetcher)
    }

    fn script(&self, path: &str, script: Script) {
        self.routes
            .lock()
            .unwrap()
            .insert(url(path).to_string(), script);
    }

    fn serve(&self, path: &str, body: &'static str) {
        self.script(
            path,
            Script::Serve {
                status: StatusCode::OK,
                body: Bytes::from_static(body.as_bytes()),
                response_type: ResponseType::Basic,
                streamed: false,
            },
        );
    }

    fn serve_streamed(&self, path: &str, body: &'static str) {
        self.script(
            path,
            Script::Serve {
                status: StatusCode::OK,
                body: Bytes::from_static(body.as_bytes()),
                response_type: ResponseType::Basic,
                streamed: true,
            },
        );
    }

    fn serve_status(&self, path: &str, status: StatusCode) {
        self.script(
            path,
            Script::Serve {
                status,
                body: Bytes::new(),
                response_type: ResponseType::Basic,
                streamed: false,
            },
        );
    }

    fn fail(&self, path: &str) {
        self.script(path, Script::Fail);
    }

    fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    /// Any further fetch fails the test.
    fn forbid(&self) {
        self.forbidden.store(true, Ordering::SeqCst);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        let target = request.url.to_string();
        assert!(
            !self.forbidden.load(Ordering::SeqCst),
            "network used for {}",
            target
        );
        self.calls.lock().unwrap().push(target.clone());

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline);
        }

        let script = self.routes.lock().unwrap().get(&target).cloned();
        match script {
            Some(Script::Serve {
                status,
                body,
                response_type,
                streamed,
            }) => {
                let response = if streamed {
                    let (tx, rx) = mpsc::channel(4);
                    let (head, tail) = body.split_at(body.len() / 2);
                    tx.send(Ok(Bytes::copy_from_slice(head))).await.unwrap();
                    tx.send(Ok(Bytes::copy_from_slice(tail))).await.unwrap();
                    Response::streaming(request.url, status, rx)
                } else {
                    Response::new(request.url, status).with_body(body)
                };
                Ok(response.with_type(response_type))
            }
            Some(Script::Fail) => Err(NetError::RequestFailed(format!("scripted failure for {}", target))),
            None => Ok(Response::new(request.url, StatusCode::NOT_FOUND)),
        }
    }
}

#[derive(Default)]
struct Counters {
    reads: AtomicUsize,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl Counters {
    fn reset(&self) {
        self.reads.store(0, Ordering::SeqCst);
        self.writes.store(0, Ordering::SeqCst);
    }
}

/// In-memory storage that counts store traffic and can refuse writes.
#[derive(Default)]
struct InstrumentedStorage {
    inner: MemoryCacheStorage,
    counters: Arc<Counters>,
}

struct InstrumentedCache {
    inner: Arc<dyn Cache>,
    counters: Arc<Counters>,
}

#[async_trait]
impl Cache for InstrumentedCache {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn put(&self, key: RequestKey, response: CachedResponse) -> Result<(), CacheError> {
        self.counters.writes.fetch_add(1, Ordering::SeqCst);
        if self.counters.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheError::Storage("quota exceeded".to_string()));
        }
        self.inner.put(key, response).await
    }

    async fn match_request(
        &self,
        key: &RequestKey,
        options: MatchOptions,
    ) -> Result<Option<CachedResponse>, CacheError> {
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.match_request(key, options).await
    }

    async fn delete(&self, key: &RequestKey) -> Result<bool, CacheError> {
        self.inner.delete(key).await
    }

    async fn keys(&self) -> Result<Vec<RequestKey>, CacheError> {
        self.inner.keys().await
    }
}

#[async_trait]
impl CacheStorage for InstrumentedStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, CacheError> {
        Ok(Arc::new(InstrumentedCache {
            inner: self.inner.open(name).await?,
            counters: Arc::clone(&self.counters),
        }))
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        self.inner.has(name).await
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        self.inner.delete(name).await
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        self.inner.keys().await
    }
}

// ==================== Helpers ====================

async fn active_worker(
    config: SwConfig,
    fetcher: Arc<ScriptedFetcher>,
    storage: Arc<dyn CacheStorage>,
) -> (ServiceWorker, mpsc::UnboundedReceiver<SwEvent>) {
    let (worker, events) = ServiceWorker::new(config, fetcher, storage);
    worker.install().await.unwrap();
    worker.activate().await.unwrap();
    (worker, events)
}

fn drain(events: &mut mpsc::UnboundedReceiver<SwEvent>) -> Vec<SwEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

async fn stored_body(storage: &dyn CacheStorage, path: &str) -> Option<Bytes> {
    let cache = storage.open(VERSION).await.unwrap();
    cache
        .match_request(&RequestKey::get(&url(path)), MatchOptions::default())
        .await
        .unwrap()
        .map(|entry| entry.body)
}

async fn body_of(response: Response) -> String {
    response.text().await.unwrap()
}

// ==================== Install ====================

#[tokio::test]
async fn test_install_stores_every_app_shell_url() {
    let fetcher = ScriptedFetcher::with_app_shell();
    let storage = Arc::new(MemoryCacheStorage::new());
    let (worker, mut events) = ServiceWorker::new(config(), fetcher, storage.clone());

    worker.install().await.unwrap();

    assert_eq!(worker.state().await, LifecycleState::Installed);
    assert!(worker.is_skipping_waiting());

    let cache = storage.open(VERSION).await.unwrap();
    let stored: Vec<String> = cache
        .keys()
        .await
        .unwrap()
        .into_iter()
        .map(|k| k.url.path().to_string())
        .collect();
    for path in &worker.config().app_shell {
        assert!(stored.contains(path), "{} missing from store", path);
    }

    let events = drain(&mut events);
    assert!(events.contains(&SwEvent::SkipWaiting {
        version: VERSION.to_string()
    }));
}

#[tokio::test]
async fn test_failed_install_leaves_no_store() {
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.serve("/", "<html>root</html>");
    fetcher.fail("/index.html");

    let mut config = config();
    config.app_shell = vec!["/".to_string(), "/index.html".to_string()];

    let storage = Arc::new(MemoryCacheStorage::new());
    let (worker, _events) = ServiceWorker::new(config, fetcher.clone(), storage.clone());

    let err = worker.install().await.unwrap_err();
    match err {
        SwError::InstallFailed { url, .. } => assert!(url.ends_with("/index.html")),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!storage.has(VERSION).await.unwrap());
    assert_eq!(worker.state().await, LifecycleState::Uninstalled);

    // A later attempt starts from scratch.
    fetcher.serve("/index.html", "<html>shell</html>");
    worker.install().await.unwrap();
    assert_eq!(worker.state().await, LifecycleState::Installed);
    assert_eq!(
        stored_body(storage.as_ref(), "/index.html").await.unwrap(),
        Bytes::from_static(b"<html>shell</html>")
    );
}

#[tokio::test]
async fn test_install_rejects_error_status() {
    let fetcher = ScriptedFetcher::with_app_shell();
    fetcher.serve_status("/manifest.json", StatusCode::NOT_FOUND);

    let storage = Arc::new(MemoryCacheStorage::new());
    let (worker, _events) = ServiceWorker::new(config(), fetcher, storage.clone());

    let err = worker.install().await.unwrap_err();
    assert!(matches!(err, SwError::InstallFailed { .. }));
    assert!(!storage.has(VERSION).await.unwrap());
}

#[tokio::test]
async fn test_failed_install_keeps_existing_store() {
    let storage = Arc::new(MemoryCacheStorage::new());
    let cache = storage.open(VERSION).await.unwrap();
    cache
        .put(
            RequestKey::get(&url("/index.html")),
            CachedResponse::from_response(
                Response::new(url("/index.html"), StatusCode::OK).with_body("<html>old</html>"),
            )
            .await
            .unwrap(),
        )
        .await
        .unwrap();

    let fetcher = ScriptedFetcher::with_app_shell();
    fetcher.fail("/icons/icon-512.png");
    let (worker, _events) = ServiceWorker::new(config(), fetcher, storage.clone());

    assert!(worker.install().await.is_err());
    assert!(storage.has(VERSION).await.unwrap());
    assert_eq!(
        stored_body(storage.as_ref(), "/index.html").await.unwrap(),
        Bytes::from_static(b"<html>old</html>")
    );
}

// ==================== Activate ====================

#[tokio::test]
async fn test_activate_keeps_only_current_version() {
    let storage = Arc::new(MemoryCacheStorage::new());
    storage.open("journeygo-cache-v1").await.unwrap();
    storage.open("trip-photos").await.unwrap();

    let fetcher = ScriptedFetcher::with_app_shell();
    let (worker, mut events) = active_worker(config(), fetcher, storage.clone()).await;

    assert_eq!(worker.state().await, LifecycleState::Active);
    assert_eq!(worker.active_version().await.as_deref(), Some(VERSION));
    assert_eq!(storage.keys().await.unwrap(), vec![VERSION.to_string()]);

    let events = drain(&mut events);
    assert!(events.contains(&SwEvent::CacheDeleted {
        name: "journeygo-cache-v1".to_string()
    }));
    assert!(events.contains(&SwEvent::CacheDeleted {
        name: "trip-photos".to_string()
    }));
}

#[tokio::test]
async fn test_activate_requires_install() {
    let storage = Arc::new(MemoryCacheStorage::new());
    let (worker, _events) =
        ServiceWorker::new(config(), ScriptedFetcher::with_app_shell(), storage);

    let err = worker.activate().await.unwrap_err();
    assert!(matches!(
        err,
        SwError::InvalidState {
            expected: LifecycleState::Installed,
            actual: LifecycleState::Uninstalled,
        }
    ));
}

#[tokio::test]
async fn test_activate_claims_open_clients() {
    let storage = Arc::new(MemoryCacheStorage::new());
    let (worker, _events) =
        ServiceWorker::new(config(), ScriptedFetcher::with_app_shell(), storage);

    let client = worker.open_client(url("/trips")).await;
    worker.install().await.unwrap();
    assert_eq!(worker.client_controller(&client).await, None);

    worker.activate().await.unwrap();
    assert_eq!(
        worker.client_controller(&client).await.as_deref(),
        Some(VERSION)
    );
}

#[tokio::test]
async fn test_concurrent_activate_purges_once() {
    let storage = Arc::new(MemoryCacheStorage::new());
    storage.open("journeygo-cache-v1").await.unwrap();

    let (worker, mut events) =
        ServiceWorker::new(config(), ScriptedFetcher::with_app_shell(), storage.clone());
    worker.install().await.unwrap();

    let (first, second) = tokio::join!(worker.activate(), worker.activate());
    let failures: Vec<SwError> = [first, second].into_iter().filter_map(Result::err).collect();
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        failures[0],
        SwError::InvalidState {
            expected: LifecycleState::Installed,
            actual: LifecycleState::Active,
        }
    ));

    let deleted = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, SwEvent::CacheDeleted { .. }))
        .count();
    assert_eq!(deleted, 1);
    assert_eq!(storage.keys().await.unwrap(), vec![VERSION.to_string()]);
}

// ==================== Fetch ====================

#[tokio::test]
async fn test_requests_pass_through_until_active() {
    let fetcher = ScriptedFetcher::with_app_shell();
    let storage = Arc::new(MemoryCacheStorage::new());
    let (worker, _events) = ServiceWorker::new(config(), fetcher.clone(), storage);

    let response = worker
        .handle_fetch(Request::navigate(url("/")))
        .await
        .unwrap();
    assert!(response.is_none());
    assert!(fetcher.calls().is_empty());
}

#[tokio::test]
async fn test_non_get_never_touches_store() {
    let fetcher = ScriptedFetcher::with_app_shell();
    let storage = Arc::new(InstrumentedStorage::default());
    let counters = Arc::clone(&storage.counters);
    let (worker, _events) = active_worker(config(), fetcher.clone(), storage).await;
    counters.reset();
    let before = fetcher.calls().len();

    let post = Request::post(url("/api/trips"), Bytes::from_static(b"{}"));
    assert!(worker.handle_fetch(post).await.unwrap().is_none());

    let delete = Request::get(url("/api/trips/4")).method(http::Method::DELETE);
    assert!(worker.handle_fetch(delete).await.unwrap().is_none());

    worker.wait_for_pending_writes().await;
    assert_eq!(counters.reads.load(Ordering::SeqCst), 0);
    assert_eq!(counters.writes.load(Ordering::SeqCst), 0);
    assert_eq!(fetcher.calls().len(), before);
}

#[tokio::test]
async fn test_static_hit_skips_network() {
    let fetcher = ScriptedFetcher::with_app_shell();
    fetcher.serve("/assets/app.css", "body { margin: 0 }");
    let storage = Arc::new(MemoryCacheStorage::new());
    let (worker, _events) = active_worker(config(), fetcher.clone(), storage).await;

    let style = || Request::get(url("/assets/app.css")).destination(Destination::Style);

    let first = worker.handle_fetch(style()).await.unwrap().unwrap();
    assert!(!first.from_cache);
    worker.wait_for_pending_writes().await;

    fetcher.forbid();

    let second = worker.handle_fetch(style()).await.unwrap().unwrap();
    assert!(second.from_cache);
    assert_eq!(body_of(second).await, "body { margin: 0 }");

    // App shell icons are already stored at install.
    let icon = Request::get(url("/icons/icon-512.png")).destination(Destination::Image);
    let icon = worker.handle_fetch(icon).await.unwrap().unwrap();
    assert_eq!(body_of(icon).await, "png-512");
}

#[tokio::test]
async fn test_static_lookup_ignores_fragment() {
    let fetcher = ScriptedFetcher::with_app_shell();
    let storage = Arc::new(MemoryCacheStorage::new());
    let (worker, _events) = active_worker(config(), fetcher.clone(), storage).await;
    fetcher.forbid();

    let request =
        Request::get(url("/icons/icon-192.png#badge")).destination(Destination::Image);
    let response = worker.handle_fetch(request).await.unwrap().unwrap();
    assert_eq!(body_of(response).await, "png-192");
}

#[tokio::test]
async fn test_navigation_stores_copy_and_returns_original() {
    let fetcher = ScriptedFetcher::with_app_shell();
    fetcher.serve_streamed("/trips?id=4", "<html>trip 4</html>");
    let storage = Arc::new(MemoryCacheStorage::new());
    let (worker, _events) = active_worker(config(), fetcher, storage.clone()).await;

    let response = worker
        .handle_fetch(Request::navigate(url("/trips?id=4")))
        .await
        .unwrap()
        .unwrap();
    assert!(!response.from_cache);

    // Caller reads its body while the stored copy is written independently.
    assert_eq!(body_of(response).await, "<html>trip 4</html>");
    worker.wait_for_pending_writes().await;

    assert_eq!(
        stored_body(storage.as_ref(), "/trips?id=4").await.unwrap(),
        Bytes::from_static(b"<html>trip 4</html>")
    );
    assert!(stored_body(storage.as_ref(), "/trips").await.is_none());
}

#[tokio::test]
async fn test_offline_navigation_serves_fallback_document() {
    let fetcher = ScriptedFetcher::with_app_shell();
    let storage = Arc::new(MemoryCacheStorage::new());
    let (worker, _events) = active_worker(config(), fetcher.clone(), storage).await;
    fetcher.go_offline();

    let response = worker
        .handle_fetch(Request::navigate(url("/page?x=1")))
        .await
        .unwrap()
        .unwrap();

    assert!(response.from_cache);
    assert_eq!(response.url, url("/index.html"));
    assert_eq!(body_of(response).await, "<html>shell</html>");
}

#[tokio::test]
async fn test_fallback_document_matched_ignoring_query() {
    let fetcher = ScriptedFetcher::with_app_shell();
    fetcher.serve("/index.html?build=7", "<html>build 7</html>");

    let mut config = config();
    config.app_shell = vec!["/index.html?build=7".to_string()];

    let storage = Arc::new(MemoryCacheStorage::new());
    let (worker, _events) = active_worker(config, fetcher.clone(), storage).await;
    fetcher.go_offline();

    let response = worker
        .handle_fetch(Request::navigate(url("/page?x=1")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(body_of(response).await, "<html>build 7</html>");
}

#[tokio::test]
async fn test_offline_navigation_without_fallback_is_network_error() {
    let fetcher = ScriptedFetcher::with_app_shell();
    let mut config = config();
    config.app_shell = vec!["/".to_string()];

    let storage = Arc::new(MemoryCacheStorage::new());
    let (worker, _events) = active_worker(config, fetcher.clone(), storage).await;
    fetcher.go_offline();

    let err = worker
        .handle_fetch(Request::navigate(url("/page")))
        .await
        .unwrap_err();
    assert!(err.is_network());
}

#[tokio::test]
async fn test_offline_image_serves_placeholder() {
    let fetcher = ScriptedFetcher::with_app_shell();
    let storage = Arc::new(MemoryCacheStorage::new());
    let (worker, _events) = active_worker(config(), fetcher.clone(), storage).await;
    fetcher.go_offline();

    let request = Request::get(url("/photos/lisbon.jpg")).destination(Destination::Image);
    let response = worker.handle_fetch(request).await.unwrap().unwrap();

    assert!(response.from_cache);
    assert_eq!(body_of(response).await, "png-192");
}

#[tokio::test]
async fn test_offline_script_without_entry_is_network_error() {
    let fetcher = ScriptedFetcher::with_app_shell();
    let storage = Arc::new(MemoryCacheStorage::new());
    let (worker, _events) = active_worker(config(), fetcher.clone(), storage).await;
    fetcher.go_offline();

    let request = Request::get(url("/assets/map.js")).destination(Destination::Script);
    let err = worker.handle_fetch(request).await.unwrap_err();
    assert!(matches!(err, SwError::Network(NetError::Offline)));
}

#[tokio::test]
async fn test_default_route_prefers_network_then_cache() {
    let fetcher = ScriptedFetcher::with_app_shell();
    fetcher.serve("/api/trips", r#"[{"id":1}]"#);
    let storage = Arc::new(MemoryCacheStorage::new());
    let (worker, _events) = active_worker(config(), fetcher.clone(), storage).await;

    let trips = || Request::get(url("/api/trips"));

    let first = worker.handle_fetch(trips()).await.unwrap().unwrap();
    assert_eq!(body_of(first).await, r#"[{"id":1}]"#);
    worker.wait_for_pending_writes().await;

    // Network wins while it is up.
    fetcher.serve("/api/trips", r#"[{"id":1},{"id":2}]"#);
    let second = worker.handle_fetch(trips()).await.unwrap().unwrap();
    assert!(!second.from_cache);
    assert_eq!(body_of(second).await, r#"[{"id":1},{"id":2}]"#);
    worker.wait_for_pending_writes().await;

    fetcher.go_offline();
    let third = worker.handle_fetch(trips()).await.unwrap().unwrap();
    assert!(third.from_cache);
    assert_eq!(body_of(third).await, r#"[{"id":1},{"id":2}]"#);

    // Query strings are significant on this route.
    let err = worker
        .handle_fetch(Request::get(url("/api/trips?page=2")))
        .await
        .unwrap_err();
    assert!(err.is_network());
}

#[tokio::test]
async fn test_ineligible_responses_are_not_stored() {
    let fetcher = ScriptedFetcher::with_app_shell();
    fetcher.serve_status("/api/missing", StatusCode::NOT_FOUND);
    fetcher.script(
        "/assets/hero.png",
        Script::Serve {
            status: StatusCode::OK,
            body: Bytes::from_static(b"opaque"),
            response_type: ResponseType::Opaque,
            streamed: false,
        },
    );
    let storage = Arc::new(MemoryCacheStorage::new());
    let (worker, _events) = active_worker(config(), fetcher, storage.clone()).await;

    let missing = worker
        .handle_fetch(Request::get(url("/api/missing")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(missing.status, StatusCode::NOT_FOUND);

    let hero = worker
        .handle_fetch(Request::get(url("/assets/hero.png")).destination(Destination::Image))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hero.response_type, ResponseType::Opaque);

    assert_eq!(worker.wait_for_pending_writes().await, 0);
    assert!(stored_body(storage.as_ref(), "/api/missing").await.is_none());
    assert!(stored_body(storage.as_ref(), "/assets/hero.png").await.is_none());
}

#[tokio::test]
async fn test_store_write_failure_does_not_fail_request() {
    let fetcher = ScriptedFetcher::with_app_shell();
    fetcher.serve("/api/weather", r#"{"temp":21}"#);
    let storage = Arc::new(InstrumentedStorage::default());
    let counters = Arc::clone(&storage.counters);
    let (worker, mut events) = active_worker(config(), fetcher, storage).await;
    drain(&mut events);

    counters.fail_writes.store(true, Ordering::SeqCst);
    let response = worker
        .handle_fetch(Request::get(url("/api/weather")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(body_of(response).await, r#"{"temp":21}"#);

    assert_eq!(worker.wait_for_pending_writes().await, 1);
    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        SwEvent::CacheWriteFailed { url, .. } if url.ends_with("/api/weather")
    )));
}

#[tokio::test]
async fn test_shared_worker_serves_concurrent_requests() {
    let fetcher = ScriptedFetcher::with_app_shell();
    fetcher.serve("/assets/app.css", "body { margin: 0 }");
    fetcher.serve("/assets/map.js", "initMap()");
    fetcher.serve("/api/trips", r#"[{"id":1}]"#);
    let storage = Arc::new(MemoryCacheStorage::new());
    let (worker, _events) = active_worker(config(), fetcher.clone(), storage.clone()).await;
    let worker = Arc::new(worker);

    let style = || Request::get(url("/assets/app.css")).destination(Destination::Style);
    worker.handle_fetch(style()).await.unwrap().unwrap();
    worker.wait_for_pending_writes().await;

    let mut requests = vec![
        Request::get(url("/assets/map.js")).destination(Destination::Script),
        style(),
        style(),
    ];
    requests.extend((0..5).map(|_| Request::get(url("/api/trips"))));

    let tasks: Vec<_> = requests
        .into_iter()
        .map(|request| {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move {
                let response = worker.handle_fetch(request).await?;
                Ok::<_, SwError>(response.map(|r| r.status))
            })
        })
        .collect();

    for result in futures::future::join_all(tasks).await {
        assert_eq!(result.unwrap().unwrap(), Some(StatusCode::OK));
    }
    worker.wait_for_pending_writes().await;

    let keys = storage.open(VERSION).await.unwrap().keys().await.unwrap();
    let unique: hashbrown::HashSet<_> = keys.iter().cloned().collect();
    assert_eq!(unique.len(), keys.len());
    // App shell plus the stylesheet, the script and the API response.
    assert_eq!(keys.len(), 8);
    assert_eq!(
        stored_body(storage.as_ref(), "/api/trips").await.unwrap(),
        Bytes::from_static(br#"[{"id":1}]"#)
    );

    let css_fetches = fetcher
        .calls()
        .iter()
        .filter(|u| u.ends_with("/assets/app.css"))
        .count();
    assert_eq!(css_fetches, 1);
}

// ==================== Persistence ====================

#[tokio::test]
async fn test_restore_from_sqlite_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("caches.db");

    {
        let storage = Arc::new(SqliteCacheStorage::open(&path).unwrap());
        storage.open("journeygo-cache-v1").await.unwrap();
        let (worker, _events) =
            ServiceWorker::new(config(), ScriptedFetcher::with_app_shell(), storage.clone());
        worker.ensure_active().await.unwrap();
        assert_eq!(storage.keys().await.unwrap(), vec![VERSION.to_string()]);
    }

    let storage = Arc::new(SqliteCacheStorage::open(&path).unwrap());
    let (worker, _events) = ServiceWorker::new(config(), Arc::new(OfflineFetcher), storage);

    assert!(worker.restore().await.unwrap());
    assert_eq!(worker.state().await, LifecycleState::Active);

    let response = worker
        .handle_fetch(Request::navigate(url("/trips?id=9")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(body_of(response).await, "<html>shell</html>");
}

#[tokio::test]
async fn test_restore_purges_stale_versions() {
    let storage = Arc::new(MemoryCacheStorage::new());
    storage.open("journeygo-cache-v1").await.unwrap();

    // Installed by an earlier run that stopped before activating.
    let (previous, _events) =
        ServiceWorker::new(config(), ScriptedFetcher::with_app_shell(), storage.clone());
    previous.install().await.unwrap();
    assert_eq!(storage.keys().await.unwrap().len(), 2);

    let (worker, mut events) = ServiceWorker::new(config(), Arc::new(OfflineFetcher), storage.clone());
    assert!(worker.restore().await.unwrap());

    assert_eq!(worker.state().await, LifecycleState::Active);
    assert_eq!(storage.keys().await.unwrap(), vec![VERSION.to_string()]);
    assert!(drain(&mut events).contains(&SwEvent::CacheDeleted {
        name: "journeygo-cache-v1".to_string()
    }));
}

#[tokio::test]
async fn test_restore_rejects_empty_store() {
    let storage = Arc::new(MemoryCacheStorage::new());
    storage.open("journeygo-cache-v1").await.unwrap();
    storage.open(VERSION).await.unwrap();

    let fetcher = ScriptedFetcher::with_app_shell();
    let (worker, _events) = ServiceWorker::new(config(), fetcher.clone(), storage.clone());

    assert!(!worker.restore().await.unwrap());
    assert_eq!(worker.state().await, LifecycleState::Uninstalled);
    assert!(worker.handle_fetch(Request::navigate(url("/"))).await.unwrap().is_none());
    assert!(fetcher.calls().is_empty());

    worker.ensure_active().await.unwrap();
    assert_eq!(worker.state().await, LifecycleState::Active);
    assert_eq!(storage.keys().await.unwrap(), vec![VERSION.to_string()]);
    assert!(stored_body(storage.as_ref(), "/icons/icon-512.png").await.is_some());
}

#[tokio::test]
async fn test_restore_rejects_partial_app_shell() {
    let storage = Arc::new(MemoryCacheStorage::new());
    let cache = storage.open(VERSION).await.unwrap();
    cache
        .put(
            RequestKey::get(&url("/")),
            CachedResponse::from_response(
                Response::new(url("/"), StatusCode::OK).with_body("<html>root</html>"),
            )
            .await
            .unwrap(),
        )
        .await
        .unwrap();

    let (worker, _events) = ServiceWorker::new(config(), Arc::new(OfflineFetcher), storage);
    assert!(!worker.restore().await.unwrap());
    assert_eq!(worker.active_version().await, None);
}

#[tokio::test]
async fn test_ensure_active_installs_when_nothing_stored() {
    let storage = Arc::new(MemoryCacheStorage::new());
    let (worker, _events) =
        ServiceWorker::new(config(), ScriptedFetcher::with_app_shell(), storage.clone());

    assert!(!worker.restore().await.unwrap());
    worker.ensure_active().await.unwrap();
    assert_eq!(worker.state().await, LifecycleState::Active);
    assert!(storage.has(VERSION).await.unwrap());
}
